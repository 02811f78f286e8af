//! Guard-page hooking: many address-level hooks multiplexed over a smaller
//! set of hardware-guarded pages, with zero code modification at the hook
//! sites.
//!
//! State machine per page: `Unguarded` <-> `Guarded`. A fault on a guarded
//! page records the faulting address, lifts the guard, and arms single-step;
//! exactly one instruction later the step fault either keeps stepping (the
//! instruction pointer is still inside a tracked page) or re-arms the guard
//! and stops. Execute-kind faults additionally dispatch the callback
//! registered at the exact faulting address with a private [`CpuContext`]
//! copy whose mutations are written back before resuming.
//!
//! The registry lock covers metadata only; callbacks run outside it and may
//! execute concurrently on different pages. A fault inside a callback is the
//! callback author's problem — wrap the body with the fault sandbox if that
//! risk is unacceptable.

use crate::hook::Hook;
use crate::types::{GuardHandler, HookError};
use core::ffi::c_void;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// One physical page, `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub begin: usize,
    pub end: usize,
}

impl PageRange {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }
}

/// Platform capability behind the manager: page arithmetic, the guard
/// protection transitions, and fault-handler installation. A counting
/// implementation makes the refcount discipline directly testable.
pub trait PageProtector: Send + Sync {
    fn page_bounds(&self, addr: usize) -> PageRange;

    /// Apply guard protection. Called only on the page's 0 -> 1 refcount
    /// transition.
    fn guard(&self, page: &PageRange) -> Result<(), HookError>;

    /// Restore normal protection. Called from the fault path, where the
    /// guard must be lifted for the access to complete.
    fn unguard(&self, page: &PageRange) -> Result<(), HookError>;

    /// Prove the page is unguarded before its bookkeeping is dropped.
    /// Called without the registry lock held.
    fn ensure_unguarded(&self, page: &PageRange) -> Result<(), HookError> {
        self.unguard(page)
    }

    fn install_fault_handler(&self) -> Result<(), HookError> {
        Ok(())
    }

    fn remove_fault_handler(&self) {}
}

struct GuardedPage {
    begin: usize,
    end: usize,
    ref_count: usize,
}

#[derive(Default)]
struct Registry {
    hooks: HashMap<usize, GuardHandler>,
    pages: BTreeMap<usize, GuardedPage>,
}

impl Registry {
    fn page_containing(&self, addr: usize) -> Option<PageRange> {
        self.pages.range(..=addr).next_back().and_then(|(_, p)| {
            (addr < p.end).then_some(PageRange {
                begin: p.begin,
                end: p.end,
            })
        })
    }
}

/// Process-wide guard-page hook registry.
///
/// The hooking façade receives this as an injected dependency; only the
/// platform fault handlers reach for the process singleton directly.
pub struct GuardPageHooks {
    registry: Mutex<Registry>,
    protector: Box<dyn PageProtector>,
}

static INSTANCE: OnceLock<GuardPageHooks> = OnceLock::new();

impl GuardPageHooks {
    /// Build a manager over an explicit protector (tests use this with a
    /// counting protector; no platform handler gets involved).
    pub fn with_protector(protector: Box<dyn PageProtector>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            protector,
        }
    }

    /// The process-wide manager wired to the platform protector.
    pub fn instance() -> &'static GuardPageHooks {
        INSTANCE.get_or_init(|| Self::with_protector(Box::new(PlatformProtector)))
    }

    fn global() -> Option<&'static GuardPageHooks> {
        INSTANCE.get()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `callback` at `address`, guarding the containing page on
    /// its first hook and installing the fault handler on the process's
    /// first hook.
    pub fn add_hook(&self, address: usize, callback: GuardHandler) -> Result<(), HookError> {
        if address == 0 {
            return Err(HookError::InvalidArgument("null hook address"));
        }

        let mut reg = self.lock();
        if reg.hooks.contains_key(&address) {
            return Err(HookError::AlreadyHooked(address));
        }

        let first_hook = reg.hooks.is_empty();
        if first_hook {
            self.protector.install_fault_handler()?;
        }

        let range = self.protector.page_bounds(address);
        match reg.pages.get_mut(&range.begin) {
            Some(page) => page.ref_count += 1,
            None => {
                if let Err(e) = self.protector.guard(&range) {
                    if first_hook {
                        self.protector.remove_fault_handler();
                    }
                    return Err(e);
                }
                reg.pages.insert(
                    range.begin,
                    GuardedPage {
                        begin: range.begin,
                        end: range.end,
                        ref_count: 1,
                    },
                );
            }
        }

        reg.hooks.insert(address, callback);
        log::debug!("guard-page hook added at {address:#x} (page {:#x})", range.begin);
        Ok(())
    }

    /// Deregister the hook at `address`. Idempotent: removing an unknown or
    /// already-removed address is a no-op.
    pub fn remove_hook(&self, address: usize) {
        let mut reg = self.lock();
        if reg.hooks.remove(&address).is_none() {
            return;
        }

        let range = self.protector.page_bounds(address);
        let mut freed_page = None;
        if let Some(page) = reg.pages.get_mut(&range.begin) {
            page.ref_count -= 1;
            if page.ref_count == 0 {
                freed_page = Some(PageRange {
                    begin: page.begin,
                    end: page.end,
                });
            }
        }

        if let Some(free) = freed_page {
            reg.pages.remove(&free.begin);
            // The proof step may provoke one more guard fault, and the
            // fault handler takes this lock; release it around the probe.
            drop(reg);
            if let Err(e) = self.protector.ensure_unguarded(&free) {
                log::warn!("failed to clear guard on page {:#x}: {e}", free.begin);
            }
            reg = self.lock();
        }

        if reg.hooks.is_empty() {
            self.protector.remove_fault_handler();
        }
        log::debug!("guard-page hook removed at {address:#x}");
    }

    /// Snapshot the page and callback state for a fault at `addr`.
    #[cfg_attr(not(any(all(target_os = "linux", target_arch = "x86_64"), all(windows, target_arch = "x86_64"))), allow(dead_code))]
    fn fault_lookup(&self, addr: usize) -> (Option<PageRange>, Option<GuardHandler>) {
        let reg = self.lock();
        (reg.page_containing(addr), reg.hooks.get(&addr).copied())
    }
}

/// Handle for one guard-page hook installed through the process singleton.
pub struct GuardPageHook {
    address: usize,
    manager: &'static GuardPageHooks,
}

impl GuardPageHook {
    pub(crate) fn from_parts(address: usize, manager: &'static GuardPageHooks) -> Self {
        Self { address, manager }
    }

    /// Hook execution of the instruction at `address`.
    ///
    /// # Safety
    /// `address` must be the first byte of an instruction in executable
    /// memory. The callback runs in fault-handler context.
    pub unsafe fn install(address: *mut c_void, callback: GuardHandler) -> Result<Self, HookError> {
        let manager = GuardPageHooks::instance();
        manager.add_hook(address as usize, callback)?;
        Ok(Self {
            address: address as usize,
            manager,
        })
    }
}

impl Hook for GuardPageHook {
    fn location(&self) -> usize {
        self.address
    }
}

impl Drop for GuardPageHook {
    fn drop(&mut self) {
        self.manager.remove_hook(self.address);
    }
}

// ── Linux platform backing ───────────────────────────────────────────
//
// There is no hardware guard bit to borrow on Linux, so "guarded" means
// PROT_NONE and the fault handler lifts/reapplies it around the single
// step. TF in the interrupted context's flags drives the step.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod platform {
    use super::*;
    use crate::types::CpuContext;
    use core::cell::Cell;
    use core::ffi::{c_int, c_void};
    use core::mem::MaybeUninit;
    use std::sync::Once;

    const TRAP_FLAG: i64 = 0x100;
    /// Page-fault error-code bit: the access was an instruction fetch.
    const PF_INSTR: u64 = 0x10;

    thread_local! {
        static LAST_GUARD_FAULT: Cell<usize> = const { Cell::new(0) };
    }

    pub(super) struct PlatformProtector;

    impl PageProtector for PlatformProtector {
        fn page_bounds(&self, addr: usize) -> PageRange {
            let page = page_size();
            let begin = addr & !(page - 1);
            PageRange {
                begin,
                end: begin + page,
            }
        }

        fn guard(&self, page: &PageRange) -> Result<(), HookError> {
            protect(page, libc::PROT_NONE)
        }

        fn unguard(&self, page: &PageRange) -> Result<(), HookError> {
            protect(page, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
        }

        // `ensure_unguarded` inherits the default: mprotect is synchronous,
        // so restoring protection already is the proof.

        fn install_fault_handler(&self) -> Result<(), HookError> {
            install_handlers();
            Ok(())
        }

        fn remove_fault_handler(&self) {
            // Signal dispositions are process-global and later-installed
            // handlers may have saved ours as their predecessor, so the
            // chain cannot be unlinked safely. With an empty registry the
            // handler forwards everything, which is the observable
            // equivalent of teardown.
            log::debug!("guard-page fault handler deactivated (registry empty)");
        }
    }

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn protect(page: &PageRange, prot: c_int) -> Result<(), HookError> {
        let rc = unsafe {
            libc::mprotect(page.begin as *mut libc::c_void, page.end - page.begin, prot)
        };
        if rc != 0 {
            return Err(HookError::ProtectionFailed);
        }
        Ok(())
    }

    struct PrevActions(core::cell::UnsafeCell<[MaybeUninit<libc::sigaction>; 2]>);
    unsafe impl Sync for PrevActions {}

    static PREV_ACTIONS: PrevActions =
        PrevActions(core::cell::UnsafeCell::new([MaybeUninit::uninit(); 2]));
    static INSTALL: Once = Once::new();

    fn install_handlers() {
        INSTALL.call_once(|| unsafe {
            for (i, (sig, handler)) in [
                (libc::SIGSEGV, segv_handler as usize),
                (libc::SIGTRAP, trap_handler as usize),
            ]
            .into_iter()
            .enumerate()
            {
                let mut sa: libc::sigaction = core::mem::zeroed();
                sa.sa_sigaction = handler;
                sa.sa_flags = libc::SA_SIGINFO;
                libc::sigemptyset(&mut sa.sa_mask);

                let mut prev: libc::sigaction = core::mem::zeroed();
                if libc::sigaction(sig, &sa, &mut prev) == 0 {
                    (*PREV_ACTIONS.0.get())[i] = MaybeUninit::new(prev);
                } else {
                    log::warn!("failed to install guard-page handler for signal {sig}");
                    (*PREV_ACTIONS.0.get())[i] = MaybeUninit::new(core::mem::zeroed());
                }
            }
        });
    }

    unsafe fn forward(slot: usize, sig: c_int, info: *mut libc::siginfo_t, uctx: *mut c_void) {
        let act = (*PREV_ACTIONS.0.get())[slot].assume_init();
        if act.sa_sigaction == libc::SIG_IGN {
            return;
        }
        if act.sa_sigaction != libc::SIG_DFL {
            if act.sa_flags & libc::SA_SIGINFO != 0 {
                let h: unsafe extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
                    core::mem::transmute(act.sa_sigaction);
                h(sig, info, uctx);
            } else {
                let h: unsafe extern "C" fn(c_int) = core::mem::transmute(act.sa_sigaction);
                h(sig);
            }
            return;
        }
        let mut dfl: libc::sigaction = core::mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut dfl.sa_mask);
        libc::sigaction(sig, &dfl, core::ptr::null_mut());
    }

    fn context_from_gregs(gregs: &[libc::greg_t; 23]) -> CpuContext {
        CpuContext {
            rip: gregs[libc::REG_RIP as usize] as u64,
            rsp: gregs[libc::REG_RSP as usize] as u64,
            rflags: gregs[libc::REG_EFL as usize] as u64,
            rax: gregs[libc::REG_RAX as usize] as u64,
            rbx: gregs[libc::REG_RBX as usize] as u64,
            rcx: gregs[libc::REG_RCX as usize] as u64,
            rdx: gregs[libc::REG_RDX as usize] as u64,
            rsi: gregs[libc::REG_RSI as usize] as u64,
            rdi: gregs[libc::REG_RDI as usize] as u64,
            rbp: gregs[libc::REG_RBP as usize] as u64,
            r8: gregs[libc::REG_R8 as usize] as u64,
            r9: gregs[libc::REG_R9 as usize] as u64,
            r10: gregs[libc::REG_R10 as usize] as u64,
            r11: gregs[libc::REG_R11 as usize] as u64,
            r12: gregs[libc::REG_R12 as usize] as u64,
            r13: gregs[libc::REG_R13 as usize] as u64,
            r14: gregs[libc::REG_R14 as usize] as u64,
            r15: gregs[libc::REG_R15 as usize] as u64,
        }
    }

    fn store_context(ctx: &CpuContext, gregs: &mut [libc::greg_t; 23]) {
        gregs[libc::REG_RIP as usize] = ctx.rip as libc::greg_t;
        gregs[libc::REG_RSP as usize] = ctx.rsp as libc::greg_t;
        gregs[libc::REG_EFL as usize] = ctx.rflags as libc::greg_t;
        gregs[libc::REG_RAX as usize] = ctx.rax as libc::greg_t;
        gregs[libc::REG_RBX as usize] = ctx.rbx as libc::greg_t;
        gregs[libc::REG_RCX as usize] = ctx.rcx as libc::greg_t;
        gregs[libc::REG_RDX as usize] = ctx.rdx as libc::greg_t;
        gregs[libc::REG_RSI as usize] = ctx.rsi as libc::greg_t;
        gregs[libc::REG_RDI as usize] = ctx.rdi as libc::greg_t;
        gregs[libc::REG_RBP as usize] = ctx.rbp as libc::greg_t;
        gregs[libc::REG_R8 as usize] = ctx.r8 as libc::greg_t;
        gregs[libc::REG_R9 as usize] = ctx.r9 as libc::greg_t;
        gregs[libc::REG_R10 as usize] = ctx.r10 as libc::greg_t;
        gregs[libc::REG_R11 as usize] = ctx.r11 as libc::greg_t;
        gregs[libc::REG_R12 as usize] = ctx.r12 as libc::greg_t;
        gregs[libc::REG_R13 as usize] = ctx.r13 as libc::greg_t;
        gregs[libc::REG_R14 as usize] = ctx.r14 as libc::greg_t;
        gregs[libc::REG_R15 as usize] = ctx.r15 as libc::greg_t;
    }

    unsafe extern "C" fn segv_handler(sig: c_int, info: *mut libc::siginfo_t, uctx: *mut c_void) {
        let Some(mgr) = GuardPageHooks::global() else {
            return forward(0, sig, info, uctx);
        };

        let addr = (*info).si_addr() as usize;
        let (page, callback) = mgr.fault_lookup(addr);
        let Some(range) = page else {
            // Not one of ours: let outer handlers or the default see it.
            return forward(0, sig, info, uctx);
        };

        // Lift the guard so the access completes, then step one
        // instruction so the trap handler can re-arm it.
        let _ = mgr.protector.unguard(&range);
        LAST_GUARD_FAULT.with(|l| l.set(addr));

        let uc = &mut *(uctx as *mut libc::ucontext_t);
        uc.uc_mcontext.gregs[libc::REG_EFL as usize] |= TRAP_FLAG;

        let is_execute = (uc.uc_mcontext.gregs[libc::REG_ERR as usize] as u64) & PF_INSTR != 0;
        if is_execute {
            if let Some(cb) = callback {
                let mut ctx = context_from_gregs(&uc.uc_mcontext.gregs);
                cb(&mut ctx);
                store_context(&ctx, &mut uc.uc_mcontext.gregs);
            }
        }
    }

    unsafe extern "C" fn trap_handler(sig: c_int, info: *mut libc::siginfo_t, uctx: *mut c_void) {
        let last = LAST_GUARD_FAULT.try_with(|l| l.get()).unwrap_or(0);
        let Some(mgr) = GuardPageHooks::global() else {
            return forward(1, sig, info, uctx);
        };
        if last == 0 {
            return forward(1, sig, info, uctx);
        }

        let uc = &mut *(uctx as *mut libc::ucontext_t);
        let rip = uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
        let (page_at_rip, callback) = mgr.fault_lookup(rip);

        if page_at_rip.is_some() {
            // Still inside a tracked page: keep single-step granularity so
            // hooks on consecutive instructions are not lost.
            uc.uc_mcontext.gregs[libc::REG_EFL as usize] |= TRAP_FLAG;
            if let Some(cb) = callback {
                let mut ctx = context_from_gregs(&uc.uc_mcontext.gregs);
                cb(&mut ctx);
                store_context(&ctx, &mut uc.uc_mcontext.gregs);
            }
        } else {
            // Stepped out: restore the guard on the page the fault came
            // from, if it is still tracked, and stop stepping.
            let (page, _) = mgr.fault_lookup(last);
            if let Some(range) = page {
                let _ = mgr.protector.guard(&range);
            }
            uc.uc_mcontext.gregs[libc::REG_EFL as usize] &= !TRAP_FLAG;
            LAST_GUARD_FAULT.with(|l| l.set(0));
        }
    }
}

// ── Windows platform backing ─────────────────────────────────────────
//
// PAGE_GUARD is the real thing: the OS clears it on the first touch and
// raises STATUS_GUARD_PAGE_VIOLATION, so the handler only has to arm TF
// and re-apply the guard after the single step. Removal proves the guard
// bit is gone by touching the page once with the handler primed to treat
// that fault as cleanup.

#[cfg(all(windows, target_arch = "x86_64"))]
mod platform {
    use super::*;
    use crate::types::CpuContext;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use windows_sys::Win32::System::Diagnostics::Debug::{
        AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, CONTEXT, EXCEPTION_POINTERS,
    };
    use windows_sys::Win32::System::Memory::{
        VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_GUARD,
    };
    use windows_sys::Win32::System::SystemInformation::GetSystemInfo;

    const STATUS_GUARD_PAGE_VIOLATION: u32 = 0x8000_0001;
    const STATUS_SINGLE_STEP: u32 = 0x8000_0004;
    const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;
    const TRAP_FLAG: u32 = 0x100;
    const ACCESS_EXECUTE: usize = 8;

    thread_local! {
        static LAST_GUARD_FAULT: Cell<usize> = const { Cell::new(0) };
    }

    /// Page currently being probed by `ensure_unguarded`; the handler
    /// swallows a guard fault on this page without arming single-step.
    static CLEANUP_PROBE: AtomicUsize = AtomicUsize::new(0);

    /// Live VEH registration handle.
    static VEH_HANDLE: AtomicUsize = AtomicUsize::new(0);

    pub(super) struct PlatformProtector;

    impl PageProtector for PlatformProtector {
        fn page_bounds(&self, addr: usize) -> PageRange {
            let page = page_size();
            let begin = addr & !(page - 1);
            PageRange {
                begin,
                end: begin + page,
            }
        }

        fn guard(&self, page: &PageRange) -> Result<(), HookError> {
            protect(page, PAGE_EXECUTE_READWRITE | PAGE_GUARD)
        }

        fn unguard(&self, page: &PageRange) -> Result<(), HookError> {
            protect(page, PAGE_EXECUTE_READWRITE)
        }

        fn ensure_unguarded(&self, page: &PageRange) -> Result<(), HookError> {
            // Touch the page with the handler primed: if the guard bit is
            // still armed this raises one last fault, which the handler
            // recognizes as cleanup and swallows, and the OS clears the
            // bit before resuming us.
            CLEANUP_PROBE.store(page.begin, Ordering::SeqCst);
            unsafe {
                core::ptr::read_volatile(page.begin as *const u8);
            }
            CLEANUP_PROBE.store(0, Ordering::SeqCst);
            self.unguard(page)
        }

        fn install_fault_handler(&self) -> Result<(), HookError> {
            let handle = unsafe { AddVectoredExceptionHandler(1, Some(guard_veh_handler)) };
            if handle.is_null() {
                return Err(HookError::ProtectionFailed);
            }
            VEH_HANDLE.store(handle as usize, Ordering::SeqCst);
            Ok(())
        }

        fn remove_fault_handler(&self) {
            let handle = VEH_HANDLE.swap(0, Ordering::SeqCst);
            if handle != 0 {
                unsafe {
                    RemoveVectoredExceptionHandler(handle as *mut core::ffi::c_void);
                }
            }
        }
    }

    fn page_size() -> usize {
        static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
        let cached = PAGE_SIZE.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        let size = unsafe {
            let mut si = core::mem::zeroed();
            GetSystemInfo(&mut si);
            si.dwPageSize as usize
        };
        PAGE_SIZE.store(size, Ordering::Relaxed);
        size
    }

    fn protect(page: &PageRange, protection: u32) -> Result<(), HookError> {
        let mut old = 0u32;
        let ok = unsafe {
            VirtualProtect(
                page.begin as *const core::ffi::c_void,
                page.end - page.begin,
                protection,
                &mut old,
            )
        };
        if ok == 0 {
            return Err(HookError::ProtectionFailed);
        }
        Ok(())
    }

    fn context_from(ctx: &CONTEXT) -> CpuContext {
        CpuContext {
            rip: ctx.Rip,
            rsp: ctx.Rsp,
            rflags: ctx.EFlags as u64,
            rax: ctx.Rax,
            rbx: ctx.Rbx,
            rcx: ctx.Rcx,
            rdx: ctx.Rdx,
            rsi: ctx.Rsi,
            rdi: ctx.Rdi,
            rbp: ctx.Rbp,
            r8: ctx.R8,
            r9: ctx.R9,
            r10: ctx.R10,
            r11: ctx.R11,
            r12: ctx.R12,
            r13: ctx.R13,
            r14: ctx.R14,
            r15: ctx.R15,
        }
    }

    fn store_context(cpu: &CpuContext, ctx: &mut CONTEXT) {
        ctx.Rip = cpu.rip;
        ctx.Rsp = cpu.rsp;
        ctx.EFlags = cpu.rflags as u32;
        ctx.Rax = cpu.rax;
        ctx.Rbx = cpu.rbx;
        ctx.Rcx = cpu.rcx;
        ctx.Rdx = cpu.rdx;
        ctx.Rsi = cpu.rsi;
        ctx.Rdi = cpu.rdi;
        ctx.Rbp = cpu.rbp;
        ctx.R8 = cpu.r8;
        ctx.R9 = cpu.r9;
        ctx.R10 = cpu.r10;
        ctx.R11 = cpu.r11;
        ctx.R12 = cpu.r12;
        ctx.R13 = cpu.r13;
        ctx.R14 = cpu.r14;
        ctx.R15 = cpu.r15;
    }

    unsafe extern "system" fn guard_veh_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
        if info.is_null() {
            return EXCEPTION_CONTINUE_SEARCH;
        }
        let record = (*info).ExceptionRecord;
        let context = (*info).ContextRecord;
        if record.is_null() || context.is_null() {
            return EXCEPTION_CONTINUE_SEARCH;
        }

        match (*record).ExceptionCode as u32 {
            STATUS_GUARD_PAGE_VIOLATION => {
                let access_kind = (*record).ExceptionInformation[0];
                let fault_addr = (*record).ExceptionInformation[1] as usize;

                // Removal probe: the OS already cleared the guard bit by
                // delivering this fault; nothing to step.
                let probe = CLEANUP_PROBE.load(Ordering::SeqCst);
                if probe != 0 && fault_addr & !(page_size() - 1) == probe {
                    return EXCEPTION_CONTINUE_EXECUTION;
                }

                let Some(mgr) = GuardPageHooks::global() else {
                    return EXCEPTION_CONTINUE_SEARCH;
                };
                let (page, callback) = mgr.fault_lookup(fault_addr);
                if page.is_none() {
                    return EXCEPTION_CONTINUE_SEARCH;
                }

                LAST_GUARD_FAULT.with(|l| l.set(fault_addr));
                (*context).EFlags |= TRAP_FLAG;

                if access_kind == ACCESS_EXECUTE {
                    if let Some(cb) = callback {
                        let mut cpu = context_from(&*context);
                        cb(&mut cpu);
                        store_context(&cpu, &mut *context);
                    }
                }
                EXCEPTION_CONTINUE_EXECUTION
            }
            STATUS_SINGLE_STEP => {
                let last = LAST_GUARD_FAULT.try_with(|l| l.get()).unwrap_or(0);
                if last == 0 {
                    return EXCEPTION_CONTINUE_SEARCH;
                }
                let Some(mgr) = GuardPageHooks::global() else {
                    return EXCEPTION_CONTINUE_SEARCH;
                };

                let rip = (*context).Rip as usize;
                let (page_at_rip, callback) = mgr.fault_lookup(rip);
                if page_at_rip.is_some() {
                    (*context).EFlags |= TRAP_FLAG;
                    if let Some(cb) = callback {
                        let mut cpu = context_from(&*context);
                        cb(&mut cpu);
                        store_context(&cpu, &mut *context);
                    }
                } else {
                    let (page, _) = mgr.fault_lookup(last);
                    if let Some(range) = page {
                        let _ = mgr.protector.guard(&range);
                    }
                    (*context).EFlags &= !TRAP_FLAG;
                    LAST_GUARD_FAULT.with(|l| l.set(0));
                }
                EXCEPTION_CONTINUE_EXECUTION
            }
            _ => EXCEPTION_CONTINUE_SEARCH,
        }
    }
}

#[cfg(not(any(all(target_os = "linux", target_arch = "x86_64"), all(windows, target_arch = "x86_64"))))]
mod platform {
    use super::*;

    pub(super) struct PlatformProtector;

    impl PageProtector for PlatformProtector {
        fn page_bounds(&self, addr: usize) -> PageRange {
            let begin = addr & !0xfff;
            PageRange {
                begin,
                end: begin + 0x1000,
            }
        }

        fn guard(&self, _page: &PageRange) -> Result<(), HookError> {
            Err(HookError::Unsupported)
        }

        fn unguard(&self, _page: &PageRange) -> Result<(), HookError> {
            Err(HookError::Unsupported)
        }
    }
}

use platform::PlatformProtector;

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        guards: AtomicUsize,
        unguards: AtomicUsize,
        installs: AtomicUsize,
        removes: AtomicUsize,
    }

    struct CountingProtector(Arc<Counters>);

    impl PageProtector for CountingProtector {
        fn page_bounds(&self, addr: usize) -> PageRange {
            let begin = addr & !0xfff;
            PageRange {
                begin,
                end: begin + 0x1000,
            }
        }

        fn guard(&self, _page: &PageRange) -> Result<(), HookError> {
            self.0.guards.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn unguard(&self, _page: &PageRange) -> Result<(), HookError> {
            self.0.unguards.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn install_fault_handler(&self) -> Result<(), HookError> {
            self.0.installs.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn remove_fault_handler(&self) {
            self.0.removes.fetch_add(1, Ordering::Relaxed);
        }
    }

    unsafe fn noop_handler(_ctx: &mut crate::types::CpuContext) {}

    fn counting_manager() -> (GuardPageHooks, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let mgr = GuardPageHooks::with_protector(Box::new(CountingProtector(counters.clone())));
        (mgr, counters)
    }

    #[test]
    fn one_page_two_hooks_one_protection_pair() {
        let (mgr, counts) = counting_manager();

        mgr.add_hook(0x7000_1010, noop_handler).unwrap();
        mgr.add_hook(0x7000_1ff0, noop_handler).unwrap();
        assert_eq!(counts.guards.load(Ordering::Relaxed), 1, "same page guards once");

        mgr.remove_hook(0x7000_1010);
        assert_eq!(counts.unguards.load(Ordering::Relaxed), 0, "page still referenced");

        mgr.remove_hook(0x7000_1ff0);
        assert_eq!(counts.guards.load(Ordering::Relaxed), 1);
        assert_eq!(counts.unguards.load(Ordering::Relaxed), 1, "exactly one unguard at refcount zero");
    }

    #[test]
    fn distinct_pages_guard_independently() {
        let (mgr, counts) = counting_manager();

        mgr.add_hook(0x7000_1000, noop_handler).unwrap();
        mgr.add_hook(0x7000_3000, noop_handler).unwrap();
        assert_eq!(counts.guards.load(Ordering::Relaxed), 2);

        mgr.remove_hook(0x7000_3000);
        assert_eq!(counts.unguards.load(Ordering::Relaxed), 1);
        mgr.remove_hook(0x7000_1000);
        assert_eq!(counts.unguards.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn handler_lifecycle_tracks_first_and_last_hook() {
        let (mgr, counts) = counting_manager();

        mgr.add_hook(0x7000_1000, noop_handler).unwrap();
        mgr.add_hook(0x7000_3000, noop_handler).unwrap();
        assert_eq!(counts.installs.load(Ordering::Relaxed), 1, "installed on first hook only");

        mgr.remove_hook(0x7000_1000);
        assert_eq!(counts.removes.load(Ordering::Relaxed), 0);
        mgr.remove_hook(0x7000_3000);
        assert_eq!(counts.removes.load(Ordering::Relaxed), 1, "removed with last hook");
    }

    #[test]
    fn duplicate_add_rejected_and_remove_idempotent() {
        let (mgr, counts) = counting_manager();

        mgr.add_hook(0x7000_1000, noop_handler).unwrap();
        assert!(matches!(
            mgr.add_hook(0x7000_1000, noop_handler),
            Err(HookError::AlreadyHooked(_))
        ));

        mgr.remove_hook(0x7000_1000);
        mgr.remove_hook(0x7000_1000); // second removal is a no-op
        mgr.remove_hook(0xdead_0000); // unknown address is a no-op
        assert_eq!(counts.unguards.load(Ordering::Relaxed), 1);
        assert_eq!(counts.removes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn null_address_rejected_before_any_state_change() {
        let (mgr, counts) = counting_manager();
        assert!(matches!(
            mgr.add_hook(0, noop_handler),
            Err(HookError::InvalidArgument(_))
        ));
        assert_eq!(counts.installs.load(Ordering::Relaxed), 0);
        assert_eq!(counts.guards.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn interval_lookup_resolves_addresses_inside_pages() {
        let (mgr, _counts) = counting_manager();
        mgr.add_hook(0x7000_1004, noop_handler).unwrap();

        let reg = mgr.lock();
        assert!(reg.page_containing(0x7000_1000).is_some());
        assert!(reg.page_containing(0x7000_1fff).is_some());
        assert!(reg.page_containing(0x7000_2000).is_none());
        assert!(reg.page_containing(0x7000_0fff).is_none());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    mod live {
        use super::*;
        use crate::code::allocator::CodeAllocator;
        use crate::types::CpuContext;
        use core::sync::atomic::AtomicU32;

        type UnaryFn = extern "C" fn(i64) -> i64;

        /// mov rax, rdi; add rax, 5; ret
        const ADD5_CODE: [u8; 8] = [0x48, 0x89, 0xf8, 0x48, 0x83, 0xc0, 0x05, 0xc3];

        fn make_add5() -> (crate::code::allocator::CodeSlice, UnaryFn) {
            let mut alloc = CodeAllocator::default();
            let slice = alloc.alloc_any().expect("alloc");
            unsafe {
                core::ptr::copy_nonoverlapping(ADD5_CODE.as_ptr(), slice.data, ADD5_CODE.len());
                alloc.make_executable(&slice).expect("rx");
                let f: UnaryFn = core::mem::transmute(slice.pc);
                (slice, f)
            }
        }

        static HITS: AtomicU32 = AtomicU32::new(0);

        unsafe fn counting_handler(_ctx: &mut CpuContext) {
            HITS.fetch_add(1, Ordering::Relaxed);
        }

        unsafe fn arg_bumping_handler(ctx: &mut CpuContext) {
            HITS.fetch_add(1, Ordering::Relaxed);
            ctx.rdi = ctx.rdi.wrapping_add(10);
        }

        #[test]
        fn execution_fault_dispatches_callback_every_call() {
            let _g = crate::lock_hook_tests();

            let (_mem, f) = make_add5();
            assert_eq!(f(1), 6, "sanity before hooking");

            HITS.store(0, Ordering::Relaxed);
            let mgr = GuardPageHooks::instance();
            mgr.add_hook(f as usize, counting_handler).unwrap();

            let f = std::hint::black_box(f);
            assert_eq!(f(1), 6, "hooked function still computes its result");
            assert_eq!(HITS.load(Ordering::Relaxed), 1);

            // The page was re-guarded after the single step: a second call
            // must fault (and count) again.
            assert_eq!(f(2), 7);
            assert_eq!(HITS.load(Ordering::Relaxed), 2);

            mgr.remove_hook(f as usize);
            assert_eq!(f(3), 8, "unhooked function runs untouched");
            assert_eq!(HITS.load(Ordering::Relaxed), 2);
        }

        #[test]
        fn callback_context_mutations_alter_resumed_execution() {
            let _g = crate::lock_hook_tests();

            let (_mem, f) = make_add5();
            HITS.store(0, Ordering::Relaxed);
            let mgr = GuardPageHooks::instance();
            mgr.add_hook(f as usize, arg_bumping_handler).unwrap();

            let f = std::hint::black_box(f);
            // The callback rewrites the first argument: (1 + 10) + 5.
            assert_eq!(f(1), 16);
            assert_eq!(HITS.load(Ordering::Relaxed), 1);

            mgr.remove_hook(f as usize);
            assert_eq!(f(1), 6);
        }

        #[test]
        fn read_access_passes_through_without_dispatch() {
            let _g = crate::lock_hook_tests();

            let (_mem, f) = make_add5();
            HITS.store(0, Ordering::Relaxed);
            let mgr = GuardPageHooks::instance();
            mgr.add_hook(f as usize, counting_handler).unwrap();

            // A data read of the hooked page faults, single-steps, and
            // re-guards, but must not invoke the callback.
            let byte = unsafe { core::ptr::read_volatile(f as *const u8) };
            assert_eq!(byte, 0x48);
            assert_eq!(HITS.load(Ordering::Relaxed), 0);

            // Execution afterwards still dispatches.
            let f = std::hint::black_box(f);
            assert_eq!(f(4), 9);
            assert_eq!(HITS.load(Ordering::Relaxed), 1);

            mgr.remove_hook(f as usize);
        }
    }
}
