//! Loaded-module enumeration for the current process.

/// One loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Enumerate all modules mapped in the current process.
#[cfg(target_os = "linux")]
pub fn enumerate() -> Vec<ModuleInfo> {
    use core::ffi::{c_void, CStr};

    struct Ctx {
        modules: Vec<ModuleInfo>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = &mut *(data as *mut Ctx);
        let info = &*info;

        let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            // The empty name is the main executable.
            match std::fs::read_link("/proc/self/exe") {
                Ok(p) => p.to_string_lossy().into_owned(),
                Err(_) => String::new(),
            }
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };

        // Module bounds from the PT_LOAD segments.
        let mut min_addr: Option<u64> = None;
        let mut max_addr: u64 = 0;
        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        for phdr in phdrs {
            if phdr.p_type == libc::PT_LOAD && phdr.p_memsz > 0 {
                let start = phdr.p_vaddr;
                min_addr = Some(min_addr.map(|m: u64| m.min(start)).unwrap_or(start));
                max_addr = max_addr.max(start + phdr.p_memsz);
            }
        }

        let base = info.dlpi_addr as usize + min_addr.unwrap_or(0) as usize;
        let size = min_addr.map(|m| (max_addr - m) as usize).unwrap_or(0);
        let name = if path.is_empty() {
            String::from("[unknown]")
        } else {
            basename(&path).to_string()
        };

        ctx.modules.push(ModuleInfo {
            name,
            path,
            base_address: base,
            size,
        });
        0
    }

    let mut ctx = Ctx { modules: Vec::new() };
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    }
    ctx.modules
}

/// Enumerate all modules mapped in the current process.
#[cfg(windows)]
pub fn enumerate() -> Vec<ModuleInfo> {
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W,
        TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
    };

    let mut modules = Vec::new();
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, 0);
        if snapshot == INVALID_HANDLE_VALUE {
            return modules;
        }

        let mut entry: MODULEENTRY32W = core::mem::zeroed();
        entry.dwSize = core::mem::size_of::<MODULEENTRY32W>() as u32;
        if Module32FirstW(snapshot, &mut entry) != 0 {
            loop {
                let wide_len = |buf: &[u16]| buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
                let name = String::from_utf16_lossy(&entry.szModule[..wide_len(&entry.szModule)]);
                let path = String::from_utf16_lossy(&entry.szExePath[..wide_len(&entry.szExePath)]);
                modules.push(ModuleInfo {
                    name,
                    path,
                    base_address: entry.modBaseAddr as usize,
                    size: entry.modBaseSize as usize,
                });
                if Module32NextW(snapshot, &mut entry) == 0 {
                    break;
                }
            }
        }
        CloseHandle(snapshot);
    }
    modules
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn enumerate() -> Vec<ModuleInfo> {
    Vec::new()
}

/// Find a module by basename or path suffix.
pub fn find_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate()
        .into_iter()
        .find(|m| m.name == name || m.path.ends_with(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn enumerates_self_and_libc() {
        let modules = enumerate();
        assert!(!modules.is_empty());
        assert!(
            modules.iter().any(|m| m.name.contains("libc")),
            "libc should be mapped in any test binary"
        );
        for m in &modules {
            assert!(m.size > 0 || m.path.is_empty());
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn find_by_name_matches_suffix() {
        let libc = enumerate()
            .into_iter()
            .find(|m| m.name.contains("libc"))
            .expect("libc mapped");
        assert_eq!(find_by_name(&libc.name).unwrap().base_address, libc.base_address);
    }
}
