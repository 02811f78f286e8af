//! Target-process selection and module listing for the CLI.

use anyhow::{bail, Result};
#[cfg(target_os = "linux")]
use anyhow::Context;

/// A pid either given literally or resolved from a process name.
pub fn resolve_targets(selector: &str, all: bool) -> Result<Vec<u32>> {
    if let Ok(pid) = selector.parse::<u32>() {
        return Ok(vec![pid]);
    }

    let mut pids = pids_by_name(selector)?;
    pids.sort_unstable();
    match (pids.len(), all) {
        (0, _) => bail!("no running process named {selector:?}"),
        (_, true) => Ok(pids),
        (1, false) => Ok(pids),
        (n, false) => {
            log::warn!(
                "{n} processes named {selector:?}; injecting into pid {} (use --all for every match)",
                pids[0]
            );
            Ok(vec![pids[0]])
        }
    }
}

#[cfg(target_os = "linux")]
fn pids_by_name(name: &str) -> Result<Vec<u32>> {
    let mut pids = Vec::new();
    for entry in std::fs::read_dir("/proc").context("read /proc")? {
        let entry = entry?;
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).unwrap_or_default();
        if comm.trim_end() == name {
            pids.push(pid);
            continue;
        }
        // comm is truncated at 15 bytes; fall back to the executable name.
        if let Ok(exe) = std::fs::read_link(format!("/proc/{pid}/exe")) {
            if exe.file_name().map(|f| f.to_string_lossy() == name).unwrap_or(false) {
                pids.push(pid);
            }
        }
    }
    Ok(pids)
}

#[cfg(windows)]
fn pids_by_name(name: &str) -> Result<Vec<u32>> {
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
        TH32CS_SNAPPROCESS,
    };

    let mut pids = Vec::new();
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0);
        if snapshot == INVALID_HANDLE_VALUE {
            bail!("process snapshot failed: {}", std::io::Error::last_os_error());
        }
        let mut entry: PROCESSENTRY32W = core::mem::zeroed();
        entry.dwSize = core::mem::size_of::<PROCESSENTRY32W>() as u32;
        if Process32FirstW(snapshot, &mut entry) != 0 {
            loop {
                let len = entry
                    .szExeFile
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(entry.szExeFile.len());
                let exe = String::from_utf16_lossy(&entry.szExeFile[..len]);
                if exe.eq_ignore_ascii_case(name) {
                    pids.push(entry.th32ProcessID);
                }
                if Process32NextW(snapshot, &mut entry) == 0 {
                    break;
                }
            }
        }
        CloseHandle(snapshot);
    }
    Ok(pids)
}

#[cfg(not(any(target_os = "linux", windows)))]
fn pids_by_name(_name: &str) -> Result<Vec<u32>> {
    bail!("process-name lookup is unsupported on this platform")
}

/// One mapped module of a target process.
pub struct MappedModule {
    pub base: usize,
    pub path: String,
}

#[cfg(target_os = "linux")]
pub fn list_modules(pid: u32) -> Result<Vec<MappedModule>> {
    let maps = std::fs::read_to_string(format!("/proc/{pid}/maps"))
        .with_context(|| format!("read maps of pid {pid}"))?;

    let mut modules: Vec<MappedModule> = Vec::new();
    for line in maps.lines() {
        let Some(path) = line.split_whitespace().nth(5) else { continue };
        if !path.starts_with('/') {
            continue;
        }
        let Some((start, _)) = line.split_once('-') else { continue };
        let Ok(base) = usize::from_str_radix(start, 16) else { continue };
        // maps is address-sorted, so the first line per file is its base.
        if modules.iter().any(|m| m.path == path) {
            continue;
        }
        modules.push(MappedModule {
            base,
            path: path.to_string(),
        });
    }
    Ok(modules)
}

#[cfg(windows)]
pub fn list_modules(pid: u32) -> Result<Vec<MappedModule>> {
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W,
        TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
    };

    let mut modules = Vec::new();
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid);
        if snapshot == INVALID_HANDLE_VALUE {
            bail!(
                "module snapshot of pid {pid} failed: {}",
                std::io::Error::last_os_error()
            );
        }
        let mut entry: MODULEENTRY32W = core::mem::zeroed();
        entry.dwSize = core::mem::size_of::<MODULEENTRY32W>() as u32;
        if Module32FirstW(snapshot, &mut entry) != 0 {
            loop {
                let len = entry
                    .szExePath
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(entry.szExePath.len());
                modules.push(MappedModule {
                    base: entry.modBaseAddr as usize,
                    path: String::from_utf16_lossy(&entry.szExePath[..len]),
                });
                if Module32NextW(snapshot, &mut entry) == 0 {
                    break;
                }
            }
        }
        CloseHandle(snapshot);
    }
    Ok(modules)
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn list_modules(_pid: u32) -> Result<Vec<MappedModule>> {
    bail!("module listing is unsupported on this platform")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_selector_is_taken_literally() {
        assert_eq!(resolve_targets("4242", false).unwrap(), vec![4242]);
        assert_eq!(resolve_targets("1", true).unwrap(), vec![1]);
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(resolve_targets("no-such-process-name-here", false).is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn own_process_lists_its_modules() {
        let modules = list_modules(std::process::id()).expect("own maps");
        assert!(!modules.is_empty());
        assert!(modules.iter().any(|m| m.path.contains("libc")));
    }
}
