//! Windows fault boundary: one vectored exception handler plus per-thread
//! recovery frames captured with `RtlCaptureContext`. The handler rewrites
//! the exception's `ContextRecord` to the snapshot and continues execution,
//! landing back at the capture point with the fault code recorded.

use super::FaultCode;
use core::cell::Cell;
use core::mem::ManuallyDrop;
use std::sync::Once;
use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, RtlCaptureContext, CONTEXT, EXCEPTION_POINTERS,
};

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// Hardware fault codes this boundary claims. Anything else — Rust panics
/// travel as a language-level SEH exception, guard-page and single-step
/// faults belong to the hook manager — is passed on untouched.
const HARDWARE_FAULTS: [u32; 10] = [
    0xc000_0005, // access violation
    0xc000_0006, // in-page error
    0xc000_008c, // array bounds exceeded
    0xc000_008e, // float divide by zero
    0xc000_0090, // float invalid operation
    0xc000_0091, // float overflow
    0xc000_0093, // float underflow
    0xc000_0094, // integer divide by zero
    0xc000_001d, // illegal instruction
    0xc000_0096, // privileged instruction
];

#[repr(C)]
struct FaultFrame {
    prev: *mut FaultFrame,
    env: CONTEXT,
    code: Cell<FaultCode>,
    armed: Cell<bool>,
}

thread_local! {
    static TOP_FRAME: Cell<*mut FaultFrame> = const { Cell::new(core::ptr::null_mut()) };
}

struct PopFrame {
    prev: *mut FaultFrame,
}

impl Drop for PopFrame {
    fn drop(&mut self) {
        TOP_FRAME.with(|t| t.set(self.prev));
    }
}

static INSTALL: Once = Once::new();

fn install_handler() {
    INSTALL.call_once(|| unsafe {
        // First-position handler; unclaimed exceptions continue the search
        // into later handlers and SEH.
        if AddVectoredExceptionHandler(1, Some(veh_handler)).is_null() {
            log::warn!("failed to install vectored exception handler");
        }
    });
}

unsafe extern "system" fn veh_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    if info.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let record = (*info).ExceptionRecord;
    let context = (*info).ContextRecord;
    if record.is_null() || context.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let code = (*record).ExceptionCode as u32;
    if !HARDWARE_FAULTS.contains(&code) {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let top = TOP_FRAME.try_with(|t| t.get()).unwrap_or(core::ptr::null_mut());
    if top.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let frame = &*top;
    if !frame.armed.get() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    frame.armed.set(false);
    frame.code.set(code as i32);
    *context = frame.env;
    EXCEPTION_CONTINUE_EXECUTION
}

pub(super) fn run_guarded<F, H>(body: F, on_fault: H)
where
    F: FnOnce(),
    H: FnOnce(FaultCode),
{
    install_handler();

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

        RtlCaptureContext(&mut (*frame_ptr).env);

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

        ManuallyDrop::drop(&mut on_fault);
    }
}
