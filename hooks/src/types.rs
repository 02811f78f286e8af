#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    /// Null or degenerate inputs, rejected before any memory is touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("code buffer allocation failed")]
    AllocationFailed,
    #[error("address {0:#x} is already hooked")]
    AlreadyHooked(usize),
    #[error("unsupported on this platform")]
    Unsupported,
}

/// 64-bit general-purpose register snapshot.
///
/// Passed mutably into hook callbacks; the guard-page manager copies any
/// mutations back into the platform register structure before resuming.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86_64CpuContext {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[cfg(target_arch = "x86_64")]
impl X86_64CpuContext {
    pub fn instruction_pointer(&self) -> usize {
        self.rip as usize
    }

    pub fn set_instruction_pointer(&mut self, ip: usize) {
        self.rip = ip as u64;
    }

    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }

    /// Integer argument `n` under the platform C calling convention.
    pub fn argument(&self, n: usize) -> Option<u64> {
        #[cfg(windows)]
        let regs = [self.rcx, self.rdx, self.r8, self.r9];
        #[cfg(not(windows))]
        let regs = [self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9];
        regs.get(n).copied()
    }

    /// Rewrite integer argument `n` under the platform C calling convention.
    pub fn set_argument(&mut self, n: usize, value: u64) {
        #[cfg(windows)]
        let regs = [&mut self.rcx, &mut self.rdx, &mut self.r8, &mut self.r9];
        #[cfg(not(windows))]
        let regs = [
            &mut self.rdi,
            &mut self.rsi,
            &mut self.rdx,
            &mut self.rcx,
            &mut self.r8,
            &mut self.r9,
        ];
        if let Some(slot) = regs.into_iter().nth(n) {
            *slot = value;
        }
    }
}

/// 32-bit general-purpose register snapshot. Arguments live on the stack
/// under the 32-bit C conventions, so only pointer accessors are offered.
#[cfg(target_arch = "x86")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86CpuContext {
    pub eip: u32,
    pub esp: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
}

#[cfg(target_arch = "x86")]
impl X86CpuContext {
    pub fn instruction_pointer(&self) -> usize {
        self.eip as usize
    }

    pub fn set_instruction_pointer(&mut self, ip: usize) {
        self.eip = ip as u32;
    }

    pub fn stack_pointer(&self) -> usize {
        self.esp as usize
    }
}

/// AArch64 general-purpose register snapshot.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm64CpuContext {
    pub pc: u64,
    pub sp: u64,
    pub pstate: u64,
    /// x0-x28.
    pub x: [u64; 29],
    /// x29.
    pub fp: u64,
    /// x30.
    pub lr: u64,
}

#[cfg(target_arch = "aarch64")]
impl Arm64CpuContext {
    pub fn instruction_pointer(&self) -> usize {
        self.pc as usize
    }

    pub fn set_instruction_pointer(&mut self, ip: usize) {
        self.pc = ip as u64;
    }

    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }

    pub fn argument(&self, n: usize) -> Option<u64> {
        (n < 8).then(|| self.x[n])
    }

    pub fn set_argument(&mut self, n: usize, value: u64) {
        if n < 8 {
            self.x[n] = value;
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub type CpuContext = X86_64CpuContext;

#[cfg(target_arch = "x86")]
pub type CpuContext = X86CpuContext;

#[cfg(target_arch = "aarch64")]
pub type CpuContext = Arm64CpuContext;

/// Callback invoked by the guard-page manager with a private register
/// snapshot for the faulting thread.
///
/// # Safety
/// Runs in fault-handler context: no heap allocation, no re-entrant
/// hooking. Mutating the context alters resumed execution.
pub type GuardHandler = unsafe fn(&mut CpuContext);
