//! Inline JMP/detour hooking.
//!
//! The patched-over prologue lives on in a relocated detour buffer followed
//! by a jump back to the remainder of the function, so calling through the
//! detour reproduces the original exactly. The caller guarantees that
//! `min_patch_bytes` does not split an instruction.

use crate::arch::x86_64::writer::{
    near_jmp_reachable, X86_64Writer, FAR_JMP_SIZE, NEAR_JMP_SIZE, NEAR_RANGE,
};
use crate::code::allocator::{CodeAllocator, CodeSlice};
use crate::code::patcher::patch_code;
use crate::hook::Hook;
use crate::types::HookError;
use core::ffi::c_void;

/// Upper bound on the patched region; prologues past this point would be
/// better served by two hooks.
pub const MAX_PATCH_BYTES: usize = 32;

pub struct TrampolineHook {
    location: *mut u8,
    patch_len: usize,
    original: [u8; MAX_PATCH_BYTES],
    detour: CodeSlice,
}

unsafe impl Send for TrampolineHook {}
unsafe impl Sync for TrampolineHook {}

impl TrampolineHook {
    /// Redirect `location` to `callback`, overwriting `min_patch_bytes`
    /// bytes (>= 5, the near-JMP minimum).
    ///
    /// # Safety
    /// `location` must be executable code owned by this process;
    /// `min_patch_bytes` must cover whole instructions; `callback` must be
    /// ABI-compatible with the patched function.
    pub unsafe fn install(
        location: *mut c_void,
        min_patch_bytes: usize,
        callback: *const c_void,
    ) -> Result<Self, HookError> {
        if location.is_null() {
            return Err(HookError::InvalidArgument("null hook location"));
        }
        if callback.is_null() {
            return Err(HookError::InvalidArgument("null callback"));
        }
        if min_patch_bytes < NEAR_JMP_SIZE {
            return Err(HookError::InvalidArgument("patch shorter than a near jump"));
        }
        if min_patch_bytes > MAX_PATCH_BYTES {
            return Err(HookError::InvalidArgument("patch longer than supported"));
        }

        let loc = location as *mut u8;
        let loc_pc = loc as u64;
        let callback_pc = callback as u64;

        let mut alloc = CodeAllocator::default();
        let slice = alloc
            .alloc_near(loc as *const u8, NEAR_RANGE)
            .or_else(|_| alloc.alloc_any())?;

        let mut original = [0u8; MAX_PATCH_BYTES];
        core::ptr::copy_nonoverlapping(loc as *const u8, original.as_mut_ptr(), min_patch_bytes);

        // Detour: the displaced prologue, then a jump back to the rest of
        // the function.
        let mut w = X86_64Writer::new(slice.data, slice.size, slice.data as u64);
        w.put_bytes(&original[..min_patch_bytes]);
        w.put_jmp_address(loc_pc + min_patch_bytes as u64);

        // Pick the redirect shape for the patch site. A distant callback
        // can still use the 5-byte form when the detour page is near: the
        // page then carries a far relay.
        let (stub_target, use_near) = if near_jmp_reachable(loc_pc, callback_pc) {
            (callback_pc, true)
        } else if near_jmp_reachable(loc_pc, w.pc()) {
            let relay = w.pc();
            w.put_jmp_far(callback_pc);
            (relay, true)
        } else if min_patch_bytes >= FAR_JMP_SIZE {
            (callback_pc, false)
        } else {
            return Err(HookError::InvalidArgument(
                "patch too short to reach a distant callback",
            ));
        };

        alloc.make_executable(&slice)?;

        let mut stub = [0u8; MAX_PATCH_BYTES];
        let mut sw = X86_64Writer::new(stub.as_mut_ptr(), stub.len(), loc_pc);
        if use_near {
            sw.put_jmp_near(stub_target);
        } else {
            sw.put_jmp_far(stub_target);
        }
        let written = sw.offset();
        sw.put_nop_n(min_patch_bytes - written);

        // Single writable window over the patch site; if the protection
        // change fails nothing has been modified.
        patch_code(loc, min_patch_bytes, |p| {
            core::ptr::copy_nonoverlapping(stub.as_ptr(), p, min_patch_bytes);
        })?;

        log::debug!(
            "trampoline hook at {:#x} -> {:#x}, detour {:#x}",
            loc as usize,
            callback as usize,
            slice.pc as usize
        );

        Ok(Self {
            location: loc,
            patch_len: min_patch_bytes,
            original,
            detour: slice,
        })
    }

    /// Address of the relocated original ("call the original" entry point).
    pub fn detour_address(&self) -> usize {
        self.detour.pc as usize
    }

    /// Address that was patched.
    pub fn target_address(&self) -> usize {
        self.location as usize
    }
}

impl Hook for TrampolineHook {
    fn location(&self) -> usize {
        self.detour.pc as usize
    }
}

impl Drop for TrampolineHook {
    fn drop(&mut self) {
        let original = self.original;
        let len = self.patch_len;
        unsafe {
            if patch_code(self.location, len, |p| {
                core::ptr::copy_nonoverlapping(original.as_ptr(), p, len);
            })
            .is_err()
            {
                log::warn!(
                    "failed to restore original bytes at {:#x}",
                    self.location as usize
                );
            }
        }
        // The detour buffer is released by `CodeSlice`'s drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    type BinFn = extern "C" fn(i64, i64) -> i64;

    /// Hand-assembled `f(i, j) = (i * j) << i`:
    ///   mov rax, rdi          48 89 f8
    ///   imul rax, rsi         48 0f af c6
    ///   mov rcx, rdi          48 89 f9
    ///   shl rax, cl           48 d3 e0
    ///   ret                   c3
    /// The first two instructions form a 7-byte patch window.
    const MUL_SHIFT_CODE: [u8; 14] = [
        0x48, 0x89, 0xf8, 0x48, 0x0f, 0xaf, 0xc6, 0x48, 0x89, 0xf9, 0x48, 0xd3, 0xe0, 0xc3,
    ];
    const MUL_SHIFT_PATCH: usize = 7;

    fn make_mul_shift() -> (CodeSlice, BinFn) {
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");
        unsafe {
            core::ptr::copy_nonoverlapping(MUL_SHIFT_CODE.as_ptr(), slice.data, MUL_SHIFT_CODE.len());
            alloc.make_executable(&slice).expect("rx");
            let f: BinFn = core::mem::transmute(slice.pc);
            (slice, f)
        }
    }

    fn mul_shift_reference(i: i64, j: i64) -> i64 {
        (i.wrapping_mul(j)) << (i & 63)
    }

    static HOOK_HITS: AtomicU32 = AtomicU32::new(0);
    static ORIGINAL_ENTRY: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn counting_callback(i: i64, j: i64) -> i64 {
        HOOK_HITS.fetch_add(1, Ordering::Relaxed);
        let original: BinFn =
            unsafe { core::mem::transmute(ORIGINAL_ENTRY.load(Ordering::Relaxed)) };
        original(i, j)
    }

    extern "C" fn constant_callback(_i: i64, _j: i64) -> i64 {
        -7
    }

    #[test]
    fn install_redirects_and_detour_calls_original() {
        let _g = crate::lock_hook_tests();

        let (_mem, f) = make_mul_shift();
        assert_eq!(f(3, 4), 96, "sanity: (3*4) << 3");

        HOOK_HITS.store(0, Ordering::Relaxed);
        let hook = unsafe {
            TrampolineHook::install(f as *mut c_void, MUL_SHIFT_PATCH, counting_callback as *const c_void)
        }
        .expect("install");
        ORIGINAL_ENTRY.store(hook.location(), Ordering::Relaxed);

        let f = std::hint::black_box(f);
        assert_eq!(f(3, 4), 96, "callback must reach the original through the detour");
        assert_eq!(HOOK_HITS.load(Ordering::Relaxed), 1);

        // Calling the handle's location directly is "the original".
        let original: BinFn = unsafe { core::mem::transmute(hook.location()) };
        assert_eq!(original(2, 5), 40);
        assert_eq!(HOOK_HITS.load(Ordering::Relaxed), 1, "detour call must not re-enter the hook");

        drop(hook);
        let f = std::hint::black_box(f);
        assert_eq!(f(3, 4), 96);
        assert_eq!(HOOK_HITS.load(Ordering::Relaxed), 1, "unhooked calls must not fire the callback");
    }

    #[test]
    fn unhook_restores_behavior_over_many_calls() {
        let _g = crate::lock_hook_tests();

        let (_mem, f) = make_mul_shift();
        let before: [u8; 14] = unsafe { core::ptr::read_unaligned(f as *const [u8; 14]) };

        let hook = unsafe {
            TrampolineHook::install(f as *mut c_void, MUL_SHIFT_PATCH, constant_callback as *const c_void)
        }
        .expect("install");

        let f = std::hint::black_box(f);
        assert_eq!(f(1, 1), -7, "replacement visible while hooked");
        drop(hook);

        let after: [u8; 14] = unsafe { core::ptr::read_unaligned(f as *const [u8; 14]) };
        assert_eq!(before, after, "original bytes must be restored verbatim");

        for n in 0..1000i64 {
            let i = n % 8;
            let j = n % 100;
            assert_eq!(f(i, j), mul_shift_reference(i, j), "call #{n} after unhook");
        }
    }

    #[test]
    fn rejects_degenerate_arguments() {
        let cb = constant_callback as *const c_void;
        unsafe {
            assert!(matches!(
                TrampolineHook::install(core::ptr::null_mut(), 5, cb),
                Err(HookError::InvalidArgument(_))
            ));
            let (_mem, f) = make_mul_shift();
            assert!(matches!(
                TrampolineHook::install(f as *mut c_void, 4, cb),
                Err(HookError::InvalidArgument(_))
            ));
            assert!(matches!(
                TrampolineHook::install(f as *mut c_void, MAX_PATCH_BYTES + 1, cb),
                Err(HookError::InvalidArgument(_))
            ));
            assert!(matches!(
                TrampolineHook::install(f as *mut c_void, 5, core::ptr::null()),
                Err(HookError::InvalidArgument(_))
            ));
        }
    }
}
