/// x86-64 general-purpose register indices.
///
/// Encoding matches the x86-64 ModR/M and REX register numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding (for ModR/M).
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register requires a REX prefix (R8-R15).
    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }

    /// Whether the low-byte form needs a REX prefix to reach sil/dil/
    /// bpl/spl instead of the legacy ah/ch/dh/bh encodings.
    #[inline]
    pub const fn byte_needs_rex(self) -> bool {
        matches!(self, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi)
    }
}

/// SSE register indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }
}

/// Host calling-convention description, fixed once per target triple.
/// The compiler body stays ABI-agnostic and reads everything from here.
pub struct HostAbi {
    /// Integer argument registers, in order.
    pub call_regs: [Reg; 4],
    /// XMM argument registers, in order.
    pub call_regs_xmm: [Xmm; 4],
    /// Per-block stack adjustment: shadow space + realignment on
    /// Windows, plain realignment elsewhere.
    pub stack_align: u32,
    pub windows: bool,
}

#[cfg(windows)]
pub const HOST_ABI: HostAbi = HostAbi {
    call_regs: [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
    call_regs_xmm: [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3],
    // 32-byte shadow space + 8 byte alignment
    stack_align: 0x28,
    windows: true,
};

#[cfg(not(windows))]
pub const HOST_ABI: HostAbi = HostAbi {
    call_regs: [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx],
    call_regs_xmm: [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3],
    stack_align: 8,
    windows: false,
};

/// Callee-saved registers pushed by the dispatch-loop prologue, in push
/// order.
#[cfg(windows)]
pub const MAINLOOP_SAVED: &[Reg] = &[
    Reg::Rbx,
    Reg::Rbp,
    Reg::Rdi,
    Reg::Rsi,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

#[cfg(not(windows))]
pub const MAINLOOP_SAVED: &[Reg] = &[
    Reg::Rbx,
    Reg::Rbp,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// Registers the block allocator may hand out for guest GPRs. All are
/// callee-saved, so they survive host calls made from inside a block
/// and are restored to the embedder by the dispatch-loop epilogue.
pub const ALLOC_GPRS: &[Reg] = &[Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// XMM registers handed out for guest floating singles. Callee-saved on
/// Windows; elsewhere they get spilled to the save band around calls.
pub const ALLOC_XMMS: &[Xmm] = &[Xmm::Xmm8, Xmm::Xmm9, Xmm::Xmm10, Xmm::Xmm11];

/// Scratch register for far calls/jumps to host functions. Never an
/// argument register on either ABI and never allocated.
pub const FAR_SCRATCH: Reg = Reg::R10;

/// Scratch base register for the XMM save band; avoids clobbering rax,
/// which may hold an indirect-call target.
pub const XMM_SAVE_SCRATCH: Reg = Reg::R11;
