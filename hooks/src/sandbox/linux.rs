//! Linux fault boundary: per-thread recovery frames captured with
//! `getcontext`; the signal handler rewrites the interrupted context's
//! general registers back to the snapshot and returns, so execution lands
//! at the capture point with the fault code recorded. Signals that no
//! active frame claims are forwarded to whatever action was installed
//! before ours.

use super::FaultCode;
use core::cell::Cell;
use core::ffi::{c_int, c_void};
use core::mem::{ManuallyDrop, MaybeUninit};
use std::sync::Once;

const GUARDED_SIGNALS: [c_int; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE];

struct FaultFrame {
    prev: *mut FaultFrame,
    env: libc::ucontext_t,
    code: Cell<FaultCode>,
    armed: Cell<bool>,
}

thread_local! {
    static TOP_FRAME: Cell<*mut FaultFrame> = const { Cell::new(core::ptr::null_mut()) };
}

/// Pops the boundary stack on scope exit, including unwinds: a panic in the
/// body must leave the thread's boundary stack consistent.
struct PopFrame {
    prev: *mut FaultFrame,
}

impl Drop for PopFrame {
    fn drop(&mut self) {
        TOP_FRAME.with(|t| t.set(self.prev));
    }
}

struct PrevActions(core::cell::UnsafeCell<[MaybeUninit<libc::sigaction>; 4]>);

// Written once under `INSTALL`, read only from the handler afterwards.
unsafe impl Sync for PrevActions {}

static PREV_ACTIONS: PrevActions =
    PrevActions(core::cell::UnsafeCell::new([MaybeUninit::uninit(); 4]));
static INSTALL: Once = Once::new();

fn install_handlers() {
    INSTALL.call_once(|| unsafe {
        for (i, &sig) in GUARDED_SIGNALS.iter().enumerate() {
            let mut sa: libc::sigaction = core::mem::zeroed();
            sa.sa_sigaction = fault_handler as usize;
            sa.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut sa.sa_mask);

            let mut prev: libc::sigaction = core::mem::zeroed();
            if libc::sigaction(sig, &sa, &mut prev) == 0 {
                (*PREV_ACTIONS.0.get())[i] = MaybeUninit::new(prev);
            } else {
                log::warn!("failed to install fault handler for signal {sig}");
                (*PREV_ACTIONS.0.get())[i] = MaybeUninit::new(core::mem::zeroed());
            }
        }
    });
}

unsafe extern "C" fn fault_handler(sig: c_int, info: *mut libc::siginfo_t, uctx: *mut c_void) {
    let top = TOP_FRAME.try_with(|t| t.get()).unwrap_or(core::ptr::null_mut());
    if !top.is_null() {
        let frame = &*top;
        if frame.armed.get() {
            frame.armed.set(false);
            frame.code.set(sig);
            // Send the thread back to the snapshot. Only the general
            // registers are rewritten; the kernel's sigreturn keeps the
            // interrupted signal mask, which is what we want.
            let uc = &mut *(uctx as *mut libc::ucontext_t);
            #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
            {
                uc.uc_mcontext.gregs = frame.env.uc_mcontext.gregs;
            }
            #[cfg(target_arch = "aarch64")]
            {
                uc.uc_mcontext.regs = frame.env.uc_mcontext.regs;
                uc.uc_mcontext.sp = frame.env.uc_mcontext.sp;
                uc.uc_mcontext.pc = frame.env.uc_mcontext.pc;
                uc.uc_mcontext.pstate = frame.env.uc_mcontext.pstate;
            }
            return;
        }
    }
    forward(sig, info, uctx);
}

/// Hand an unclaimed signal to the action that was installed before ours,
/// or re-arm the default action so the re-executed fault is fatal.
unsafe fn forward(sig: c_int, info: *mut libc::siginfo_t, uctx: *mut c_void) {
    let prev = GUARDED_SIGNALS
        .iter()
        .position(|&s| s == sig)
        .map(|i| (*PREV_ACTIONS.0.get())[i].assume_init());

    match prev {
        Some(act) if act.sa_sigaction == libc::SIG_IGN => {}
        Some(act) if act.sa_sigaction != libc::SIG_DFL => {
            if act.sa_flags & libc::SA_SIGINFO != 0 {
                let h: unsafe extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
                    core::mem::transmute(act.sa_sigaction);
                h(sig, info, uctx);
            } else {
                let h: unsafe extern "C" fn(c_int) = core::mem::transmute(act.sa_sigaction);
                h(sig);
            }
        }
        _ => {
            let mut dfl: libc::sigaction = core::mem::zeroed();
            dfl.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut dfl.sa_mask);
            libc::sigaction(sig, &dfl, core::ptr::null_mut());
        }
    }
}

pub(super) fn run_guarded<F, H>(body: F, on_fault: H)
where
    F: FnOnce(),
    H: FnOnce(FaultCode),
{
    install_handlers();

    let mut body = ManuallyDrop::new(body);
    let mut on_fault = ManuallyDrop::new(on_fault);

    unsafe {
        let mut frame = FaultFrame {
            prev: TOP_FRAME.with(|t| t.get()),
            env: core::mem::zeroed(),
            code: Cell::new(0),
            armed: Cell::new(false),
        };
        let frame_ptr: *mut FaultFrame = &mut frame;
        TOP_FRAME.with(|t| t.set(frame_ptr));
        let _pop = PopFrame { prev: (*frame_ptr).prev };

        let _ = libc::getcontext(&mut (*frame_ptr).env);

        // A caught fault resumes here with `code` set; the body's partially
        // executed scope has been abandoned without cleanup.
        let code = (*frame_ptr).code.get();
        if code != 0 {
            let handler = ManuallyDrop::take(&mut on_fault);
            handler(code);
            return;
        }

        (*frame_ptr).armed.set(true);
        let body = ManuallyDrop::take(&mut body);
        body();
        (*frame_ptr).armed.set(false);

        // Clean completion: the handler closure is simply discarded.
        ManuallyDrop::drop(&mut on_fault);
    }
}
