//! Windows back end: classic remote-thread injection.
//!
//! Opens the target with the minimum access the steps need, writes the
//! absolute library path (and the injector's working directory) into
//! remote scratch, points the DLL search path at that directory, and
//! spawns a remote thread at `LoadLibraryW`. The thread's exit code
//! confirms or denies the load.

use crate::{InjectError, InjectOutcome};
use std::io;
use std::path::Path;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
    TH32CS_SNAPMODULE32,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateRemoteThread, GetCurrentProcess, GetExitCodeThread, IsWow64Process, OpenProcess,
    WaitForSingleObject, PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION,
    PROCESS_VM_READ, PROCESS_VM_WRITE,
};

fn wide(s: &std::ffi::OsStr) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Strip the `\\?\` verbatim prefix `canonicalize` produces, so paths
/// compare against module entries and survive `LoadLibraryW`.
fn display_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    s.strip_prefix(r"\\?\").unwrap_or(&s).to_string()
}

struct RemoteScratch {
    process: HANDLE,
    base: *mut core::ffi::c_void,
}

impl Drop for RemoteScratch {
    fn drop(&mut self) {
        unsafe {
            VirtualFreeEx(self.process, self.base, 0, MEM_RELEASE);
        }
    }
}

struct ProcessHandle(HANDLE);

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

fn module_loaded(pid: u32, library: &str) -> Result<bool, InjectError> {
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid);
        if snapshot == INVALID_HANDLE_VALUE {
            // Snapshot failures are common against protected processes;
            // the guard degrades to a warning rather than silently
            // claiming the library is absent *and* fresh.
            log::warn!("module snapshot of pid {pid} failed; double-injection check degraded");
            return Ok(false);
        }

        let mut found = false;
        let mut entry: MODULEENTRY32W = core::mem::zeroed();
        entry.dwSize = core::mem::size_of::<MODULEENTRY32W>() as u32;
        if Module32FirstW(snapshot, &mut entry) != 0 {
            loop {
                let len = entry
                    .szExePath
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(entry.szExePath.len());
                let path = String::from_utf16_lossy(&entry.szExePath[..len]);
                if path.eq_ignore_ascii_case(library) {
                    found = true;
                    break;
                }
                if Module32NextW(snapshot, &mut entry) == 0 {
                    break;
                }
            }
        }
        CloseHandle(snapshot);
        Ok(found)
    }
}

fn pointer_width_matches(process: HANDLE, pid: u32) -> Result<(), InjectError> {
    unsafe {
        let mut own_wow64 = 0;
        let mut target_wow64 = 0;
        if IsWow64Process(GetCurrentProcess(), &mut own_wow64) == 0
            || IsWow64Process(process, &mut target_wow64) == 0
        {
            return Err(InjectError::OpenProcess {
                pid,
                source: io::Error::last_os_error(),
            });
        }
        if own_wow64 != target_wow64 {
            let own_bits = if own_wow64 != 0 { 32 } else { crate::own_pointer_width_bits() };
            let target_bits = if target_wow64 != 0 { 32 } else { 64 };
            return Err(InjectError::ArchMismatch {
                injector: own_bits,
                target: target_bits,
            });
        }
    }
    Ok(())
}

fn kernel32_export(name: &[u8]) -> Result<usize, InjectError> {
    unsafe {
        let kernel32: Vec<u16> = "kernel32.dll\0".encode_utf16().collect();
        let module = GetModuleHandleW(kernel32.as_ptr());
        if module.is_null() {
            return Err(InjectError::ResolveLoader("kernel32 not mapped".into()));
        }
        // kernel32 loads at one base system-wide, so a local resolution is
        // valid inside the target.
        GetProcAddress(module, name.as_ptr())
            .map(|f| f as usize)
            .ok_or_else(|| {
                InjectError::ResolveLoader(format!(
                    "{} not exported by kernel32",
                    String::from_utf8_lossy(&name[..name.len() - 1])
                ))
            })
    }
}

/// Run `entry(argument)` on a fresh target thread; `Ok(None)` is a timeout.
fn run_remote_thread(
    process: HANDLE,
    pid: u32,
    entry: usize,
    argument: *mut core::ffi::c_void,
    timeout: Duration,
) -> Result<Option<u32>, InjectError> {
    unsafe {
        let thread = CreateRemoteThread(
            process,
            core::ptr::null(),
            0,
            Some(core::mem::transmute::<
                usize,
                unsafe extern "system" fn(*mut core::ffi::c_void) -> u32,
            >(entry)),
            argument,
            0,
            core::ptr::null_mut(),
        );
        if thread.is_null() {
            return Err(InjectError::OpenProcess {
                pid,
                source: io::Error::last_os_error(),
            });
        }

        let wait = WaitForSingleObject(thread, timeout.as_millis().min(u32::MAX as u128) as u32);
        let result = if wait == WAIT_OBJECT_0 {
            let mut exit_code = 0u32;
            if GetExitCodeThread(thread, &mut exit_code) == 0 {
                CloseHandle(thread);
                return Err(InjectError::OpenProcess {
                    pid,
                    source: io::Error::last_os_error(),
                });
            }
            Some(exit_code)
        } else if wait == WAIT_TIMEOUT {
            None
        } else {
            CloseHandle(thread);
            return Err(InjectError::OpenProcess {
                pid,
                source: io::Error::last_os_error(),
            });
        };
        CloseHandle(thread);
        Ok(result)
    }
}

pub(crate) fn inject(pid: u32, library: &Path, timeout: Duration) -> Result<InjectOutcome, InjectError> {
    let library_display = display_path(library);

    if module_loaded(pid, &library_display)? {
        return Err(InjectError::AlreadyLoaded(library.to_path_buf()));
    }

    let process = unsafe {
        OpenProcess(
            PROCESS_CREATE_THREAD
                | PROCESS_QUERY_INFORMATION
                | PROCESS_VM_OPERATION
                | PROCESS_VM_READ
                | PROCESS_VM_WRITE,
            0,
            pid,
        )
    };
    if process.is_null() {
        return Err(InjectError::OpenProcess {
            pid,
            source: io::Error::last_os_error(),
        });
    }
    let process = ProcessHandle(process);

    pointer_width_matches(process.0, pid)?;

    let load_library = kernel32_export(b"LoadLibraryW\0")?;
    let set_dll_directory = kernel32_export(b"SetDllDirectoryW\0").ok();

    // Scratch block: the wide library path, then the injector's working
    // directory for the target's DLL search path.
    let path_wide = wide(std::ffi::OsStr::new(&library_display));
    let cwd = std::env::current_dir().ok();
    let cwd_wide = cwd.as_deref().map(|d| wide(d.as_os_str()));

    let path_bytes = path_wide.len() * 2;
    let cwd_offset = (path_bytes + 15) & !15;
    let total = cwd_offset + cwd_wide.as_ref().map_or(0, |w| w.len() * 2);

    let base = unsafe {
        VirtualAllocEx(
            process.0,
            core::ptr::null(),
            total.max(16),
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    if base.is_null() {
        return Err(InjectError::RemoteAlloc(
            io::Error::last_os_error().to_string(),
        ));
    }
    let scratch = RemoteScratch {
        process: process.0,
        base,
    };

    let write = |offset: usize, data: &[u16]| -> Result<(), InjectError> {
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                process.0,
                (scratch.base as usize + offset) as *mut core::ffi::c_void,
                data.as_ptr() as *const core::ffi::c_void,
                data.len() * 2,
                &mut written,
            )
        };
        if ok == 0 || written != data.len() * 2 {
            return Err(InjectError::RemoteWrite(
                io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    };

    write(0, &path_wide)?;

    // Best effort: point the target's DLL search path at our working
    // directory before the load, mirroring how the library would resolve
    // its dependencies if the injector had loaded it itself.
    if let (Some(set_dir), Some(cwd_wide)) = (set_dll_directory, &cwd_wide) {
        write(cwd_offset, cwd_wide)?;
        let dir_arg = (scratch.base as usize + cwd_offset) as *mut core::ffi::c_void;
        match run_remote_thread(process.0, pid, set_dir, dir_arg, Duration::from_secs(2)) {
            Ok(Some(_)) => {}
            Ok(None) => log::warn!("SetDllDirectoryW thread timed out; continuing"),
            Err(e) => log::warn!("SetDllDirectoryW thread failed ({e}); continuing"),
        }
    }

    match run_remote_thread(process.0, pid, load_library, scratch.base, timeout)? {
        Some(0) => Err(InjectError::LoaderFailed(library.to_path_buf())),
        Some(handle) => {
            log::info!("remote LoadLibraryW returned {handle:#x}");
            Ok(InjectOutcome::Loaded {
                handle: handle as u64,
            })
        }
        None => {
            // The loader thread is still running; the scratch block is
            // deliberately left to it. Forget the guard so the free does
            // not race the in-flight load.
            log::warn!("remote loader thread did not finish within the timeout");
            core::mem::forget(scratch);
            Ok(InjectOutcome::TimedOut)
        }
    }
}
