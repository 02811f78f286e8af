//! Linux back end: ptrace register hijack.
//!
//! The target stays untouched on disk and gains no new threads. We attach,
//! save the thread's registers, make it call its own `mmap` and `dlopen`
//! by pointing the instruction pointer at the resolved entry with a
//! sentinel return address on the stack, and harvest the return value when
//! the thread faults at the sentinel. Registers are restored and the
//! attachment released on every path.

use crate::{InjectError, InjectOutcome};
use std::path::Path;
use std::time::Duration;

pub(crate) fn inject(pid: u32, library: &Path, timeout: Duration) -> Result<InjectOutcome, InjectError> {
    #[cfg(target_arch = "x86_64")]
    {
        x64::inject(pid, library, timeout)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (pid, library, timeout);
        Err(InjectError::Unsupported)
    }
}

#[cfg(target_arch = "x86_64")]
mod x64 {
    use super::*;
    use graft_image::ExeImage;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::time::Instant;

    /// Return address pushed for remote calls; returning to it faults, and
    /// the fault is our completion signal.
    const SENTINEL: u64 = 0;
    const SCRATCH_LEN: u64 = 0x1000;

    fn read_maps(pid: u32) -> io::Result<String> {
        std::fs::read_to_string(format!("/proc/{pid}/maps"))
    }

    fn library_mapped(maps: &str, library: &Path) -> bool {
        let lib = library.to_string_lossy();
        maps.lines()
            .any(|line| line.split_whitespace().nth(5) == Some(lib.as_ref()))
    }

    /// Base address and path of the target's libc, from its lowest mapping
    /// (`/proc/<pid>/maps` is sorted by address).
    fn find_libc(maps: &str) -> Option<(usize, String)> {
        for line in maps.lines() {
            let Some(path) = line.split_whitespace().nth(5) else { continue };
            let name = path.rsplit('/').next().unwrap_or(path);
            let is_libc = name.starts_with("libc.so")
                || (name.starts_with("libc-") && name.ends_with(".so"));
            if !is_libc {
                continue;
            }
            let Some((start, _)) = line.split_once('-') else { continue };
            let Ok(base) = usize::from_str_radix(start, 16) else { continue };
            return Some((base, path.to_string()));
        }
        None
    }

    fn resolve_remote(image: &ExeImage, base: usize, names: &[&str]) -> Option<usize> {
        names
            .iter()
            .find_map(|name| image.export(name))
            .map(|vaddr| base + vaddr)
    }

    /// Per-attempt attachment state. Never outlives one injection call; the
    /// drop impl is the last line of defense against a leaked attachment.
    struct InjectionSession {
        pid: libc::pid_t,
        attached: bool,
        saved_regs: Option<libc::user_regs_struct>,
    }

    impl InjectionSession {
        fn attach(pid: u32) -> Result<Self, InjectError> {
            let tracee = pid as libc::pid_t;
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_ATTACH,
                    tracee,
                    core::ptr::null_mut::<libc::c_void>(),
                    core::ptr::null_mut::<libc::c_void>(),
                )
            };
            if rc < 0 {
                return Err(InjectError::OpenProcess {
                    pid,
                    source: io::Error::last_os_error(),
                });
            }
            let mut status = 0;
            unsafe { libc::waitpid(tracee, &mut status, 0) };
            Ok(Self {
                pid: tracee,
                attached: true,
                saved_regs: None,
            })
        }

        fn get_regs(&self) -> io::Result<libc::user_regs_struct> {
            let mut regs: libc::user_regs_struct = unsafe { core::mem::zeroed() };
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_GETREGS,
                    self.pid,
                    core::ptr::null_mut::<libc::c_void>(),
                    &mut regs as *mut _ as *mut libc::c_void,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(regs)
        }

        fn set_regs(&self, regs: &libc::user_regs_struct) -> io::Result<()> {
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_SETREGS,
                    self.pid,
                    core::ptr::null_mut::<libc::c_void>(),
                    regs as *const _ as *mut libc::c_void,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn save_registers(&mut self) -> Result<(), InjectError> {
            let regs = self.get_regs().map_err(|source| InjectError::OpenProcess {
                pid: self.pid as u32,
                source,
            })?;
            self.saved_regs = Some(regs);
            Ok(())
        }

        fn restore_registers(&mut self) {
            if let Some(regs) = self.saved_regs.take() {
                if let Err(e) = self.set_regs(&regs) {
                    log::warn!("failed to restore hijacked registers: {e}");
                }
            }
        }

        fn poke(&self, addr: u64, word: u64) -> io::Result<()> {
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_POKEDATA,
                    self.pid,
                    addr as *mut libc::c_void,
                    word as *mut libc::c_void,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Word-wise copy into the target.
        fn write_bytes(&self, addr: u64, data: &[u8]) -> io::Result<()> {
            for (i, chunk) in data.chunks(8).enumerate() {
                let mut word = [0u8; 8];
                word[..chunk.len()].copy_from_slice(chunk);
                self.poke(addr + (i * 8) as u64, u64::from_le_bytes(word))?;
            }
            Ok(())
        }

        fn cont(&self, sig: libc::c_int) -> io::Result<()> {
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_CONT,
                    self.pid,
                    core::ptr::null_mut::<libc::c_void>(),
                    sig as usize as *mut libc::c_void,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Bring a running tracee back to a stop (used after a timed-out
        /// remote call, so registers can still be restored).
        fn interrupt(&self) {
            unsafe {
                libc::kill(self.pid, libc::SIGSTOP);
                let mut status = 0;
                libc::waitpid(self.pid, &mut status, 0);
            }
        }

        fn detach(&mut self) {
            if self.attached {
                unsafe {
                    libc::ptrace(
                        libc::PTRACE_DETACH,
                        self.pid,
                        core::ptr::null_mut::<libc::c_void>(),
                        core::ptr::null_mut::<libc::c_void>(),
                    );
                }
                self.attached = false;
            }
        }
    }

    impl Drop for InjectionSession {
        fn drop(&mut self) {
            self.detach();
        }
    }

    enum CallResult {
        Returned(u64),
        TimedOut,
        Faulted { rip: u64 },
    }

    /// Make the stopped tracee call `func(args...)` and wait for it to
    /// fault at the sentinel return address.
    fn remote_call(
        session: &InjectionSession,
        func: u64,
        args: &[u64],
        timeout: Duration,
    ) -> Result<CallResult, InjectError> {
        let saved = session
            .saved_regs
            .as_ref()
            .ok_or_else(|| InjectError::RemoteWrite("register state not saved".into()))?;
        let mut regs = *saved;

        // A fresh, 16-byte-aligned stack below the interrupted one; the
        // pushed sentinel leaves rsp ≡ 8 (mod 16), as after a CALL.
        let mut rsp = saved.rsp.wrapping_sub(0x200) & !0xf;
        rsp -= 8;
        session
            .poke(rsp, SENTINEL)
            .map_err(|e| InjectError::RemoteWrite(e.to_string()))?;

        regs.rip = func;
        regs.rsp = rsp;
        regs.rax = 0;
        // Prevent the kernel's syscall-restart fixup from rewinding the
        // hijacked instruction pointer.
        regs.orig_rax = u64::MAX;
        for (i, &arg) in args.iter().enumerate() {
            match i {
                0 => regs.rdi = arg,
                1 => regs.rsi = arg,
                2 => regs.rdx = arg,
                3 => regs.rcx = arg,
                4 => regs.r8 = arg,
                5 => regs.r9 = arg,
                _ => return Err(InjectError::RemoteWrite("too many remote-call arguments".into())),
            }
        }

        session
            .set_regs(&regs)
            .map_err(|e| InjectError::RemoteWrite(e.to_string()))?;
        session
            .cont(0)
            .map_err(|e| InjectError::RemoteWrite(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        loop {
            let mut status = 0;
            let rc = unsafe { libc::waitpid(session.pid, &mut status, libc::WNOHANG) };
            if rc < 0 {
                return Err(InjectError::OpenProcess {
                    pid: session.pid as u32,
                    source: io::Error::last_os_error(),
                });
            }
            if rc == 0 {
                if Instant::now() >= deadline {
                    return Ok(CallResult::TimedOut);
                }
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }

            if libc::WIFEXITED(status) {
                return Err(InjectError::OpenProcess {
                    pid: session.pid as u32,
                    source: io::Error::new(io::ErrorKind::Other, "target exited during remote call"),
                });
            }
            if !libc::WIFSTOPPED(status) {
                continue;
            }

            let sig = libc::WSTOPSIG(status);
            if sig == libc::SIGSEGV || sig == libc::SIGBUS {
                let regs = session.get_regs().map_err(|e| InjectError::OpenProcess {
                    pid: session.pid as u32,
                    source: e,
                })?;
                if regs.rip == SENTINEL {
                    return Ok(CallResult::Returned(regs.rax));
                }
                return Ok(CallResult::Faulted { rip: regs.rip });
            }

            // Unrelated stop (SIGCHLD, job control): pass it through.
            session
                .cont(if sig == libc::SIGSTOP { 0 } else { sig })
                .map_err(|e| InjectError::RemoteWrite(e.to_string()))?;
        }
    }

    pub(super) fn inject(
        pid: u32,
        library: &Path,
        timeout: Duration,
    ) -> Result<InjectOutcome, InjectError> {
        let maps = read_maps(pid).map_err(|source| InjectError::OpenProcess { pid, source })?;

        // Idempotence guard: /proc maps are authoritative here.
        if library_mapped(&maps, library) {
            return Err(InjectError::AlreadyLoaded(library.to_path_buf()));
        }

        // Pointer-width gate before any attachment.
        let exe = format!("/proc/{pid}/exe");
        let target_bits = graft_image::pointer_width_of(Path::new(&exe))
            .map(|bytes| bytes as u32 * 8)
            .map_err(|e| InjectError::OpenProcess {
                pid,
                source: io::Error::new(io::ErrorKind::Other, e.to_string()),
            })?;
        let own_bits = crate::own_pointer_width_bits();
        if target_bits != own_bits {
            return Err(InjectError::ArchMismatch {
                injector: own_bits,
                target: target_bits,
            });
        }

        // Resolve the loader inside the target's own libc: parse the libc
        // file the target has mapped and rebase its exports.
        let (libc_base, libc_path) = find_libc(&maps)
            .ok_or_else(|| InjectError::ResolveLoader("no libc mapping in target".into()))?;
        let image = ExeImage::from_file(Path::new(&libc_path))
            .map_err(|e| InjectError::ResolveLoader(e.to_string()))?;
        let dlopen = resolve_remote(&image, libc_base, &["dlopen", "__libc_dlopen_mode"])
            .ok_or_else(|| InjectError::ResolveLoader("dlopen not exported by target libc".into()))?;
        let mmap_fn = resolve_remote(&image, libc_base, &["mmap", "mmap64"])
            .ok_or_else(|| InjectError::ResolveLoader("mmap not exported by target libc".into()))?;
        let munmap_fn = resolve_remote(&image, libc_base, &["munmap"]);

        log::debug!(
            "target libc {libc_path} at {libc_base:#x}: dlopen {dlopen:#x}, mmap {mmap_fn:#x}"
        );

        let mut session = InjectionSession::attach(pid)?;
        session.save_registers()?;

        let outcome = drive(&session, library, dlopen as u64, mmap_fn as u64, munmap_fn, timeout);

        // Teardown runs for every outcome: a timed-out tracee is stopped
        // again first so its registers can be put back.
        if matches!(&outcome, Ok(InjectOutcome::TimedOut)) {
            session.interrupt();
        }
        session.restore_registers();
        session.detach();
        outcome
    }

    fn drive(
        session: &InjectionSession,
        library: &Path,
        dlopen: u64,
        mmap_fn: u64,
        munmap_fn: Option<usize>,
        timeout: Duration,
    ) -> Result<InjectOutcome, InjectError> {
        // Scratch allocation inside the target.
        let prot = (libc::PROT_READ | libc::PROT_WRITE) as u64;
        let flags = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
        let scratch = match remote_call(
            session,
            mmap_fn,
            &[0, SCRATCH_LEN, prot, flags, u64::MAX, 0],
            timeout,
        )? {
            CallResult::Returned(addr) if addr != 0 && addr != u64::MAX => addr,
            CallResult::Returned(addr) => {
                return Err(InjectError::RemoteAlloc(format!(
                    "remote mmap returned {addr:#x}"
                )))
            }
            CallResult::TimedOut => {
                log::warn!("remote mmap did not complete within the timeout");
                return Ok(InjectOutcome::TimedOut);
            }
            CallResult::Faulted { rip } => {
                return Err(InjectError::RemoteAlloc(format!(
                    "target faulted at {rip:#x} during allocation"
                )))
            }
        };

        // Absolute library path into the scratch block.
        let mut path_bytes = library.as_os_str().as_bytes().to_vec();
        path_bytes.push(0);
        session
            .write_bytes(scratch, &path_bytes)
            .map_err(|e| InjectError::RemoteWrite(e.to_string()))?;

        // The loader call itself.
        let result = remote_call(session, dlopen, &[scratch, libc::RTLD_NOW as u64], timeout)?;

        let release_scratch = |state: &str| {
            if let Some(munmap) = munmap_fn {
                if let Err(e) = remote_call(session, munmap as u64, &[scratch, SCRATCH_LEN], timeout)
                {
                    log::warn!("failed to release remote scratch ({state}): {e}");
                }
            }
        };

        match result {
            CallResult::Returned(0) => {
                release_scratch("loader failure");
                Err(InjectError::LoaderFailed(library.to_path_buf()))
            }
            CallResult::Returned(handle) => {
                release_scratch("loaded");
                log::info!("target loader returned handle {handle:#x}");
                Ok(InjectOutcome::Loaded { handle })
            }
            CallResult::TimedOut => {
                // The call may still be in flight; the scratch block stays,
                // since the loader could be reading from it.
                log::warn!("remote loader call did not complete within the timeout");
                Ok(InjectOutcome::TimedOut)
            }
            CallResult::Faulted { rip } => {
                release_scratch("loader fault");
                log::warn!("target faulted at {rip:#x} inside the loader call");
                Err(InjectError::LoaderFailed(library.to_path_buf()))
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::process::{Child, Command};

        fn own_libc_path() -> Option<String> {
            let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
            find_libc(&maps).map(|(_, path)| path)
        }

        /// Spawn a sleeping child and wait until its post-exec image (with
        /// libc mapped) is visible.
        fn spawn_sleeper() -> Child {
            let child = Command::new("sleep")
                .arg("30")
                .spawn()
                .expect("spawn sleep");
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if let Ok(maps) = read_maps(child.id()) {
                    if find_libc(&maps).is_some() {
                        break;
                    }
                }
                assert!(Instant::now() < deadline, "child never mapped libc");
                std::thread::sleep(Duration::from_millis(10));
            }
            child
        }

        #[test]
        fn second_injection_of_a_mapped_library_reports_already_loaded() {
            let Some(libc_path) = own_libc_path() else {
                eprintln!("no libc mapping found; skipping");
                return;
            };
            let mut child = spawn_sleeper();

            // The child has libc mapped already, so this must be refused
            // without attaching.
            let result = crate::inject(
                child.id(),
                Path::new(&libc_path),
                Duration::from_secs(5),
            );
            let _ = child.kill();
            let _ = child.wait();

            assert!(
                matches!(result, Err(InjectError::AlreadyLoaded(_))),
                "expected AlreadyLoaded, got {result:?}"
            );
        }

        #[test]
        fn injects_a_library_into_a_live_child() {
            let Some(libc_path) = own_libc_path() else {
                eprintln!("no libc mapping found; skipping");
                return;
            };
            let libm = Path::new(&libc_path)
                .parent()
                .map(|dir| dir.join("libm.so.6"))
                .filter(|p| p.exists());
            let Some(libm) = libm else {
                eprintln!("no libm.so.6 next to libc; skipping");
                return;
            };

            let mut child = spawn_sleeper();
            let result = crate::inject(child.id(), &libm, Duration::from_secs(10));

            let verify_maps = read_maps(child.id()).unwrap_or_default();
            let second = if matches!(&result, Ok(InjectOutcome::Loaded { .. })) {
                Some(crate::inject(child.id(), &libm, Duration::from_secs(10)))
            } else {
                None
            };
            let _ = child.kill();
            let _ = child.wait();

            match result {
                Ok(InjectOutcome::Loaded { handle }) => {
                    assert_ne!(handle, 0);
                    assert!(
                        verify_maps.lines().any(|l| l.contains("libm.so")),
                        "libm must appear in the target's mappings after injection"
                    );
                    // Injecting the same library again must refuse, not
                    // silently succeed twice.
                    assert!(
                        matches!(second, Some(Err(InjectError::AlreadyLoaded(_)))),
                        "second injection must report already-loaded, got {second:?}"
                    );
                }
                Ok(InjectOutcome::TimedOut) => {
                    eprintln!("remote call timed out; soft status accepted");
                }
                Err(InjectError::OpenProcess { source, .. }) => {
                    // Sandboxes commonly deny ptrace; that is an
                    // environment limitation, not a regression.
                    eprintln!("ptrace unavailable here ({source}); skipping");
                }
                Err(e) => panic!("injection failed hard: {e}"),
            }
        }

        #[test]
        fn sentinel_and_stack_layout_are_call_shaped() {
            // rsp after the sentinel push must be ≡ 8 (mod 16), matching
            // the ABI state right after a CALL instruction.
            let saved_rsp: u64 = 0x7fff_ffff_e000;
            let mut rsp = saved_rsp.wrapping_sub(0x200) & !0xf;
            rsp -= 8;
            assert_eq!(rsp % 16, 8);
        }
    }
}
