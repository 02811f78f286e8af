//! graft-hooks: in-process control-flow redirection.
//!
//! Three hooking strategies behind one façade:
//!
//! - [`hook::trampoline::TrampolineHook`] — inline JMP patching with a
//!   relocated detour for "call the original".
//! - [`hook::vtable::VtableHook`] — per-instance shadow dispatch tables.
//! - [`hook::guard::GuardPageHook`] — exception-driven interception over
//!   guarded pages, with zero code modification at the hook site.
//!
//! Plus [`sandbox`], a catchable hardware-fault boundary for running
//! instrumentation code that may crash.

pub mod arch;
pub mod code;
pub mod hook;
pub mod sandbox;
pub mod types;

pub use hook::guard::{GuardPageHook, GuardPageHooks, PageProtector, PageRange};
#[cfg(target_arch = "x86_64")]
pub use hook::trampoline::TrampolineHook;
pub use hook::vtable::VtableHook;
pub use hook::Hook;
pub use sandbox::FaultCode;
#[cfg(any(target_os = "linux", windows))]
pub use sandbox::{run_guarded, run_guarded_silent};
pub use types::{CpuContext, GuardHandler, HookError};

use core::ffi::c_void;

/// Hooking façade: one entry point for the three redirection strategies.
///
/// The guard-page manager is an injected dependency rather than an ambient
/// global; [`Hooker::new`] wires the process-wide instance, and tests can
/// wire their own.
pub struct Hooker {
    guard: &'static GuardPageHooks,
}

impl Hooker {
    pub fn new() -> Self {
        Self {
            guard: GuardPageHooks::instance(),
        }
    }

    /// Hook `slot` of the dispatch table `instance` points at.
    ///
    /// # Safety
    /// See [`VtableHook::install`].
    pub unsafe fn hook_vtable(
        &self,
        instance: *mut c_void,
        slot: usize,
        callback: *const c_void,
        table_size: usize,
    ) -> Result<VtableHook, HookError> {
        VtableHook::install(instance, slot, callback, table_size)
    }

    /// Patch a JMP-to-callback over the first `patch_len` bytes at
    /// `address`.
    ///
    /// # Safety
    /// See [`TrampolineHook::install`].
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn hook_trampoline(
        &self,
        address: *mut c_void,
        patch_len: usize,
        callback: *const c_void,
    ) -> Result<TrampolineHook, HookError> {
        TrampolineHook::install(address, patch_len, callback)
    }

    /// Intercept execution of `address` through the guard-page manager.
    ///
    /// # Safety
    /// See [`GuardPageHook::install`].
    pub unsafe fn hook_guard_page(
        &self,
        address: *mut c_void,
        callback: GuardHandler,
    ) -> Result<GuardPageHook, HookError> {
        self.guard.add_hook(address as usize, callback)?;
        Ok(GuardPageHook::from_parts(address as usize, self.guard))
    }

    /// Remove a hook. Restoration happens in the hook's drop, so removal
    /// never fails from the caller's perspective.
    pub fn unhook<H: Hook>(&self, hook: H) {
        drop(hook);
    }
}

impl Default for Hooker {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-global lock for tests that modify executable code or install
/// fault handlers.
///
/// All tests that patch generated functions or drive the guard-page state
/// machine must hold this lock to keep their faults from interleaving.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_wires_the_process_guard_manager() {
        let hooker = Hooker::new();
        // Two façades share one underlying registry.
        let other = Hooker::default();
        assert!(core::ptr::eq(hooker.guard, other.guard));
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn facade_guard_page_hook_roundtrip() {
        use crate::code::allocator::CodeAllocator;
        use core::sync::atomic::{AtomicU32, Ordering};

        let _g = crate::lock_hook_tests();

        static HITS: AtomicU32 = AtomicU32::new(0);
        unsafe fn count(_ctx: &mut CpuContext) {
            HITS.fetch_add(1, Ordering::Relaxed);
        }

        // mov rax, rdi; ret
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");
        let f: extern "C" fn(i64) -> i64 = unsafe {
            core::ptr::copy_nonoverlapping([0x48u8, 0x89, 0xf8, 0xc3].as_ptr(), slice.data, 4);
            alloc.make_executable(&slice).expect("rx");
            core::mem::transmute(slice.pc)
        };

        HITS.store(0, Ordering::Relaxed);
        let hooker = Hooker::new();
        let hook = unsafe { hooker.hook_guard_page(f as *mut c_void, count) }.expect("hook");
        assert_eq!(hook.location(), f as usize);

        let f = std::hint::black_box(f);
        assert_eq!(f(41), 41);
        assert_eq!(HITS.load(Ordering::Relaxed), 1);

        hooker.unhook(hook);
        assert_eq!(f(41), 41);
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
    }
}
