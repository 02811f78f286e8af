//! In-place patching of live code.
//!
//! `patch_code` is all-or-nothing: if the protection change fails, the
//! target bytes are untouched and the error is reported before `apply`
//! ever runs.

use crate::types::HookError;

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Make `[addr, addr+size)` writable, run `apply` against `addr`, restore
/// executable protection and flush the instruction cache.
///
/// # Safety
/// `addr..addr+size` must be a mapped code range owned by this process, and
/// the bytes `apply` writes must form valid instructions at that location.
pub unsafe fn patch_code(
    addr: *mut u8,
    size: usize,
    apply: impl FnOnce(*mut u8),
) -> Result<(), HookError> {
    if size == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    {
        let page_sz = page_size();
        let start = (addr as usize) & !(page_sz - 1);
        let end = (addr as usize)
            .saturating_add(size)
            .saturating_add(page_sz - 1)
            & !(page_sz - 1);
        let map_size = end - start;

        if libc::mprotect(
            start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            return Err(HookError::ProtectionFailed);
        }

        apply(addr);

        // Code pages go back to RX. On x86 the instruction fetch path is
        // coherent with data writes, so no explicit cache flush is needed.
        if libc::mprotect(
            start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_EXEC,
        ) != 0
        {
            return Err(HookError::ProtectionFailed);
        }
        Ok(())
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE};
        use windows_sys::Win32::System::Threading::GetCurrentProcess;

        let mut old = 0u32;
        if VirtualProtect(
            addr as *const core::ffi::c_void,
            size,
            PAGE_EXECUTE_READWRITE,
            &mut old,
        ) == 0
        {
            return Err(HookError::ProtectionFailed);
        }

        apply(addr);

        let mut scratch = 0u32;
        VirtualProtect(addr as *const core::ffi::c_void, size, old, &mut scratch);
        FlushInstructionCache(GetCurrentProcess(), addr as *const core::ffi::c_void, size);
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (addr, apply);
        Err(HookError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::allocator::CodeAllocator;

    #[test]
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn patch_rewrites_protected_code() {
        let _g = crate::lock_hook_tests();

        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");
        unsafe {
            // mov eax, 1; ret
            slice.data.copy_from([0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3].as_ptr(), 6);
            alloc.make_executable(&slice).expect("rx");

            let f: extern "C" fn() -> i32 = core::mem::transmute(slice.pc);
            assert_eq!(f(), 1);

            // Flip the immediate to 2 through the patcher.
            patch_code(slice.data, 6, |p| p.add(1).write(0x02)).expect("patch");
            let f = std::hint::black_box(f);
            assert_eq!(f(), 2);
        }
    }
}
