use crate::shil::{self, RegId};

/// SH-4 status register, split so that generated code can address the
/// T bit and the mode bits independently.
#[repr(C)]
#[derive(Default)]
pub struct StatusRegister {
    /// T condition bit (0 or 1).
    pub t: u32,
    /// Remaining SR bits (MD, RB, BL, FD, IMASK, ...). Bit 15 is FD.
    pub status: u32,
}

/// SR.FD — FPU disable bit, tested by compiled blocks containing FPU ops.
pub const SR_FD_BIT: u32 = 0x8000;

/// FPU disable exception event, and its delay-slot variant.
pub const SH4_EX_FPU_DISABLED: u32 = 0x800;
pub const SH4_EX_SLOT_FPU_DISABLED: u32 = 0x820;
/// Illegal instruction event, and its delay-slot variant.
pub const SH4_EX_ILLEGAL_INSTR: u32 = 0x180;
pub const SH4_EX_SLOT_ILLEGAL_INSTR: u32 = 0x1A0;

/// A guest exception raised by an interpreter fallback or a store-queue
/// write under MMU. Staged on the context (no host unwinding crosses
/// generated frames); the recompiler glue picks it up and long-jumps
/// back to the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sh4ThrownException {
    /// Guest pc at the faulting instruction.
    pub epc: u32,
    /// Exception event code.
    pub evn: u32,
}

impl Sh4ThrownException {
    /// Rebias an exception that originated in a delay slot: the pc moves
    /// back onto the branch and slot-specific event codes apply.
    pub fn adjust_delay_slot(&mut self) {
        self.epc = self.epc.wrapping_sub(2);
        match self.evn {
            SH4_EX_FPU_DISABLED => self.evn = SH4_EX_SLOT_FPU_DISABLED,
            SH4_EX_ILLEGAL_INSTR => self.evn = SH4_EX_SLOT_ILLEGAL_INSTR,
            _ => {}
        }
    }
}

/// SH-4 CPU context.
///
/// Generated code addresses individual fields by absolute pointer, so
/// the struct must not move while any compiled block is live. `fr` and
/// `xf` sit at 64-byte-aligned offsets because the `frswap` lowering
/// swaps them with aligned vector moves (up to one zmm per bank).
#[repr(C, align(64))]
pub struct Sh4Context {
    /// General registers r0..r15 (current bank view).
    pub r: [u32; 16],
    /// Floating registers fr0..fr15 (front bank, 64 bytes).
    pub fr: [f32; 16],
    /// Floating registers xf0..xf15 (back bank, 64 bytes).
    pub xf: [f32; 16],
    pub sr: StatusRegister,
    pub fpscr: u32,
    pub pc: u32,
    /// Dynamic branch target staging slot.
    pub jdyn: u32,
    /// Remaining cycles in the current time slice; signed, blocks debit it.
    pub cycle_counter: i32,
    /// Run flag polled by the dispatch loop.
    pub cpu_running: u32,
    /// Store-queue scratch (SQ0 + SQ1).
    pub sq_buffer: [u8; 64],
    /// Store-queue flush routine; called indirectly from generated code.
    pub do_sq_write: Option<extern "C" fn(u32, *mut Sh4Context)>,
    /// Host SH-4 core exception entry (`Do_Exception(pc, evn)`).
    pub do_exception: Option<extern "C" fn(u32, u32)>,
    /// Generated long-jump trampoline; null until the recompiler reset.
    pub handle_exception: *const u8,
    /// Staged guest exception (`pend_evn == 0` means none).
    pub pend_epc: u32,
    pub pend_evn: u32,
}

impl Default for Sh4Context {
    fn default() -> Self {
        Self {
            r: [0; 16],
            fr: [0.0; 16],
            xf: [0.0; 16],
            sr: StatusRegister::default(),
            fpscr: 0,
            pc: 0,
            jdyn: 0,
            cycle_counter: 0,
            cpu_running: 0,
            sq_buffer: [0; 64],
            do_sq_write: None,
            do_exception: None,
            handle_exception: std::ptr::null(),
            pend_epc: 0,
            pend_evn: 0,
        }
    }
}

impl Sh4Context {
    /// Address of a guest register slot, for embedding into generated
    /// code and for memory-resident IR parameters.
    pub fn reg_ptr(&self, id: RegId) -> *mut u32 {
        match id {
            shil::REG_R0..=shil::REG_R15 => &self.r[id as usize] as *const u32 as *mut u32,
            shil::REG_FR0..=shil::REG_FR15 => {
                &self.fr[(id - shil::REG_FR0) as usize] as *const f32 as *mut u32
            }
            shil::REG_XF0..=shil::REG_XF15 => {
                &self.xf[(id - shil::REG_XF0) as usize] as *const f32 as *mut u32
            }
            _ => panic!("reg_ptr: invalid register id {id}"),
        }
    }

    pub fn addr(&self) -> u64 {
        self as *const Self as u64
    }

    pub fn pc_addr(&self) -> u64 {
        &self.pc as *const u32 as u64
    }

    pub fn sr_t_addr(&self) -> u64 {
        &self.sr.t as *const u32 as u64
    }

    pub fn sr_status_addr(&self) -> u64 {
        &self.sr.status as *const u32 as u64
    }

    pub fn jdyn_addr(&self) -> u64 {
        &self.jdyn as *const u32 as u64
    }

    pub fn cycle_counter_addr(&self) -> u64 {
        &self.cycle_counter as *const i32 as u64
    }

    pub fn cpu_running_addr(&self) -> u64 {
        &self.cpu_running as *const u32 as u64
    }

    pub fn sq_buffer_addr(&self) -> u64 {
        self.sq_buffer.as_ptr() as u64
    }

    /// Address of the `do_sq_write` slot itself (for `call qword [..]`).
    pub fn do_sq_write_slot_addr(&self) -> u64 {
        &self.do_sq_write as *const _ as u64
    }

    /// Stage a guest exception for the recompiler glue to pick up.
    pub fn set_pending_exception(&mut self, ex: Sh4ThrownException) {
        self.pend_epc = ex.epc;
        self.pend_evn = ex.evn;
    }

    pub fn take_pending_exception(&mut self) -> Option<Sh4ThrownException> {
        if self.pend_evn == 0 {
            return None;
        }
        let ex = Sh4ThrownException {
            epc: self.pend_epc,
            evn: self.pend_evn,
        };
        self.pend_epc = 0;
        self.pend_evn = 0;
        Some(ex)
    }
}
