//! Executable code buffers.
//!
//! Buffers are allocated writable, filled, then flipped to RX with
//! [`CodeAllocator::make_executable`] — the documented protection-transition
//! contract for every detour and relay graft emits.

use crate::types::HookError;

/// One owned slab of code memory. Freed on drop.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub pc: *const u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

impl Drop for CodeSlice {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.data as *mut libc::c_void, self.size);
        }
        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
            VirtualFree(self.data as *mut core::ffi::c_void, 0, MEM_RELEASE);
        }
    }
}

#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self { slab_size: 4096 }
    }
}

impl CodeAllocator {
    pub fn new(slab_size: usize) -> Self {
        Self {
            slab_size: slab_size.max(4096),
        }
    }

    /// Allocate a slab as close to `near` as possible, within `max_distance`
    /// bytes. Proximity is what lets a 5-byte near JMP reach the slab.
    pub fn alloc_near(&mut self, near: *const u8, max_distance: usize) -> Result<CodeSlice, HookError> {
        #[cfg(target_os = "linux")]
        unsafe {
            let near_u = near as usize;
            let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let need = self.slab_size;

            let win_start = near_u.saturating_sub(max_distance) & !(page_sz - 1);
            let win_end = near_u.saturating_add(max_distance) & !(page_sz - 1);

            // Find gaps between mapped regions inside the window.
            if let Ok(maps) = std::fs::read_to_string("/proc/self/maps") {
                let mut regions: Vec<(usize, usize)> = Vec::new();
                for line in maps.lines() {
                    let Some(range) = line.split_whitespace().next() else { continue };
                    let Some((start_s, end_s)) = range.split_once('-') else { continue };
                    let Ok(start) = usize::from_str_radix(start_s, 16) else { continue };
                    let Ok(end) = usize::from_str_radix(end_s, 16) else { continue };
                    regions.push((start, end));
                }
                regions.sort_by_key(|&(s, _)| s);

                let mut prev_end = win_start;
                for &(region_start, region_end) in &regions {
                    if region_start > win_end {
                        break;
                    }
                    if region_start > prev_end {
                        let gap_start = prev_end;
                        let gap_end = region_start.min(win_end);
                        if gap_end > gap_start && gap_end - gap_start >= need {
                            let candidate = near_u.clamp(gap_start, gap_end - need) & !(page_sz - 1);
                            let ptr = libc::mmap(
                                candidate as *mut libc::c_void,
                                need,
                                libc::PROT_READ | libc::PROT_WRITE,
                                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                                -1,
                                0,
                            );
                            if ptr != libc::MAP_FAILED {
                                return Ok(CodeSlice {
                                    data: ptr as *mut u8,
                                    pc: ptr as *const u8,
                                    size: need,
                                });
                            }
                        }
                    }
                    prev_end = prev_end.max(region_end);
                }
            }

            // No usable gap; take anything.
            self.alloc_any()
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Memory::{
                VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
            };

            // Walk outward from `near` in 64 KiB steps and let the kernel
            // reject occupied addresses.
            const GRANULARITY: usize = 0x10000;
            let near_u = (near as usize) & !(GRANULARITY - 1);
            let mut step = GRANULARITY;
            while step <= max_distance {
                for candidate in [near_u.saturating_add(step), near_u.saturating_sub(step)] {
                    if candidate == 0 {
                        continue;
                    }
                    let ptr = VirtualAlloc(
                        candidate as *const core::ffi::c_void,
                        self.slab_size,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_READWRITE,
                    );
                    if !ptr.is_null() {
                        return Ok(CodeSlice {
                            data: ptr as *mut u8,
                            pc: ptr as *const u8,
                            size: self.slab_size,
                        });
                    }
                }
                step = step.saturating_mul(2);
            }
            self.alloc_any()
        }

        #[cfg(not(any(target_os = "linux", windows)))]
        {
            let _ = (near, max_distance);
            Err(HookError::Unsupported)
        }
    }

    /// Allocate a slab anywhere in the address space.
    pub fn alloc_any(&mut self) -> Result<CodeSlice, HookError> {
        #[cfg(unix)]
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                self.slab_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(HookError::AllocationFailed);
            }
            Ok(CodeSlice {
                data: ptr as *mut u8,
                pc: ptr as *const u8,
                size: self.slab_size,
            })
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Memory::{
                VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
            };
            let ptr = VirtualAlloc(
                core::ptr::null(),
                self.slab_size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            );
            if ptr.is_null() {
                return Err(HookError::AllocationFailed);
            }
            Ok(CodeSlice {
                data: ptr as *mut u8,
                pc: ptr as *const u8,
                size: self.slab_size,
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(HookError::Unsupported)
        }
    }

    /// Flip a filled slab from RW to RX.
    ///
    /// # Safety
    /// The slab must contain valid code before anything jumps into it.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<(), HookError> {
        #[cfg(unix)]
        {
            if libc::mprotect(
                slice.data as *mut libc::c_void,
                slice.size,
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
            use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READ};
            use windows_sys::Win32::System::Threading::GetCurrentProcess;

            let mut old = 0u32;
            if VirtualProtect(
                slice.data as *const core::ffi::c_void,
                slice.size,
                PAGE_EXECUTE_READ,
                &mut old,
            ) == 0
            {
                return Err(HookError::ProtectionFailed);
            }
            FlushInstructionCache(
                GetCurrentProcess(),
                slice.data as *const core::ffi::c_void,
                slice.size,
            );
            Ok(())
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = slice;
            Err(HookError::Unsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn alloc_any_returns_executable_page() {
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");
        unsafe {
            slice.data.write(0xc3); // ret
            alloc.make_executable(&slice).expect("protect");
            let f: extern "C" fn() = core::mem::transmute(slice.pc);
            f();
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn alloc_near_returns_within_range() {
        let mut alloc = CodeAllocator::default();
        let near = alloc_near_returns_within_range as *const u8;
        let max_distance = 1024 * 1024 * 1024; // 1 GiB, generous vs ASLR fragmentation
        let slice = alloc.alloc_near(near, max_distance).expect("alloc_near");
        let dist = (slice.data as usize).abs_diff(near as usize);
        assert!(dist <= max_distance);
    }
}
