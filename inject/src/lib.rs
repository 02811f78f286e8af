//! graft-inject: force a foreign process to load a library.
//!
//! One observable contract over two back ends: the Windows back end spawns
//! a remote thread at the loader entry point, the Linux back end hijacks an
//! attached thread's registers with ptrace and resumes it until it faults
//! back to a sentinel return address. Failures are returned as data, never
//! thrown, and a timed-out wait is a distinguishable soft status because
//! the load may still have completed.

use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(windows)]
mod windows;

/// Default bound on the remote-execution wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("library not found: {0}")]
    FileNotFound(PathBuf),
    #[error("library already loaded in target: {0}")]
    AlreadyLoaded(PathBuf),
    #[error("architecture mismatch: injector is {injector}-bit, target is {target}-bit")]
    ArchMismatch { injector: u32, target: u32 },
    #[error("could not open target process {pid}: {source}")]
    OpenProcess {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("could not resolve the target's loader entry point: {0}")]
    ResolveLoader(String),
    #[error("remote scratch allocation failed: {0}")]
    RemoteAlloc(String),
    #[error("remote write failed: {0}")]
    RemoteWrite(String),
    #[error("target loader reported failure for {0}")]
    LoaderFailed(PathBuf),
    #[error("injection is unsupported on this platform")]
    Unsupported,
}

/// Successful (or soft-failed) injection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    /// The loader confirmed the module: its handle/cookie is non-null.
    Loaded { handle: u64 },
    /// The remote wait expired. The hijacked state was restored and the
    /// attachment released, but the load may still have completed inside
    /// the target.
    TimedOut,
}

/// Load `library` into the process `pid`, waiting up to `timeout` for the
/// remote loader call.
///
/// The library path is resolved to an absolute path first and the call
/// fails fast if it does not exist. Scratch allocations, register state,
/// and process attachments are released on every path.
pub fn inject(pid: u32, library: &Path, timeout: Duration) -> Result<InjectOutcome, InjectError> {
    let library = library
        .canonicalize()
        .map_err(|_| InjectError::FileNotFound(library.to_path_buf()))?;

    log::info!("injecting {} into pid {pid}", library.display());

    #[cfg(target_os = "linux")]
    {
        linux::inject(pid, &library, timeout)
    }

    #[cfg(windows)]
    {
        windows::inject(pid, &library, timeout)
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = (pid, library, timeout);
        Err(InjectError::Unsupported)
    }
}

/// Pointer width of the running injector, in bits.
#[cfg_attr(not(any(target_os = "linux", windows)), allow(dead_code))]
pub(crate) fn own_pointer_width_bits() -> u32 {
    (core::mem::size_of::<usize>() * 8) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_fails_fast_without_touching_the_target() {
        // The bogus pid is never opened: the path check comes first.
        let err = inject(u32::MAX - 1, Path::new("/definitely/not/here.so"), DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, InjectError::FileNotFound(_)));
    }
}
