//! Minimal x86-64 code emission: the JMP and NOP shapes the detour and
//! patch stubs are built from. graft never relocates instructions, so the
//! writer carries no general encoder.

/// Near JMP (E9 rel32): 5 bytes.
pub const NEAR_JMP_SIZE: usize = 5;

/// Far JMP (FF 25 00 00 00 00; .quad addr) plus a UD2 pad: 16 bytes.
pub const FAR_JMP_SIZE: usize = 16;

/// Maximum displacement a near JMP rel32 can cover (±2 GiB).
pub const NEAR_RANGE: usize = 0x7fff_ffff;

#[derive(Debug)]
pub struct X86_64Writer {
    base: *mut u8,
    code: *mut u8,
    pc: u64,
    size: usize,
}

impl X86_64Writer {
    /// # Safety
    /// `buffer` must be writable for `size` bytes; `pc` is the address the
    /// emitted code will execute at.
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self {
            base: buffer,
            code: buffer,
            pc,
            size,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        (self.code as usize).saturating_sub(self.base as usize)
    }

    fn can_write(&self, bytes: usize) -> bool {
        self.offset() + bytes <= self.size
    }

    unsafe fn emit(&mut self, byte: u8) {
        debug_assert!(self.can_write(1));
        self.code.write(byte);
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(1);
    }

    unsafe fn emit_u32_le(&mut self, val: u32) {
        debug_assert!(self.can_write(4));
        (self.code as *mut u32).write_unaligned(val);
        self.code = self.code.add(4);
        self.pc = self.pc.wrapping_add(4);
    }

    unsafe fn emit_u64_le(&mut self, val: u64) {
        debug_assert!(self.can_write(8));
        (self.code as *mut u64).write_unaligned(val);
        self.code = self.code.add(8);
        self.pc = self.pc.wrapping_add(8);
    }

    /// Copy raw bytes through the writer, advancing pc.
    ///
    /// # Safety
    /// The buffer must have room.
    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.can_write(bytes.len()));
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, bytes.len());
        self.code = self.code.add(bytes.len());
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }

    /// `jmp rel32` — E9 cd (5 bytes). `target` is absolute.
    ///
    /// # Safety
    /// The displacement must fit in `i32` (see [`near_jmp_reachable`]).
    pub unsafe fn put_jmp_near(&mut self, target: u64) {
        self.emit(0xe9);
        let rel = (target as i64) - (self.pc as i64 + 4);
        self.emit_u32_le(rel as u32);
    }

    /// Far absolute jump: `jmp [rip+0]; .quad addr`, with a UD2 between the
    /// instruction and the literal so a fall-through traps (16 bytes).
    ///
    /// # Safety
    /// The buffer must have room.
    pub unsafe fn put_jmp_far(&mut self, target: u64) {
        // FF /4 = JMP r/m64; ModRM mod=00 reg=4 rm=5 (RIP+disp32)
        self.emit(0xff);
        self.emit(0x25);
        self.emit_u32_le(0x02); // skip over the UD2
        self.emit(0x0f);
        self.emit(0x0b); // ud2
        self.emit_u64_le(target);
    }

    /// Auto-select near (5 B) vs far (16 B) jump to an absolute address.
    ///
    /// # Safety
    /// The buffer must have room for the far form.
    pub unsafe fn put_jmp_address(&mut self, target: u64) {
        if near_jmp_reachable(self.pc, target) {
            self.put_jmp_near(target);
        } else {
            self.put_jmp_far(target);
        }
    }

    /// Pad with single-byte NOPs.
    ///
    /// # Safety
    /// The buffer must have room.
    pub unsafe fn put_nop_n(&mut self, n: usize) {
        for _ in 0..n {
            self.emit(0x90);
        }
    }
}

/// Whether a near JMP emitted at `pc` can reach `target`.
pub fn near_jmp_reachable(pc: u64, target: u64) -> bool {
    let rel = (target as i64).wrapping_sub(pc as i64 + NEAR_JMP_SIZE as i64);
    rel >= i32::MIN as i64 && rel <= i32::MAX as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_jmp_encodes_forward_displacement() {
        let mut buf = [0u8; 8];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x1000);
            w.put_jmp_near(0x1105);
            assert_eq!(w.offset(), NEAR_JMP_SIZE);
        }
        // E9, then rel32 = 0x1105 - (0x1000 + 5) = 0x100
        assert_eq!(buf[..5], [0xe9, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn far_jmp_carries_literal_target() {
        let mut buf = [0u8; 16];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0);
            w.put_jmp_far(0xdead_beef_cafe_f00d);
            assert_eq!(w.offset(), FAR_JMP_SIZE);
        }
        assert_eq!(buf[..8], [0xff, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0f, 0x0b]);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn reachability_matches_selection() {
        assert!(near_jmp_reachable(0x1000, 0x7fff_0000));
        assert!(!near_jmp_reachable(0x1000, 0xffff_ffff_ffff));

        let mut buf = [0u8; 16];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x1000);
            w.put_jmp_address(0xffff_ffff_ffff);
            assert_eq!(w.offset(), FAR_JMP_SIZE);
        }
    }
}
