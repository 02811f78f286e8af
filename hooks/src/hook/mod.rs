pub mod guard;
#[cfg(target_arch = "x86_64")]
pub mod trampoline;
pub mod vtable;

/// Common capability of every installed hook.
pub trait Hook {
    /// The address a caller uses to reach "the original": the detour buffer
    /// for trampoline hooks, the displaced slot value for vtable hooks, the
    /// hooked address itself for guard-page hooks.
    fn location(&self) -> usize;
}
