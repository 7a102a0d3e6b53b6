//! Decoded SH-4 intermediate representation.
//!
//! The decoder (out of tree) lowers guest basic blocks into a flat list
//! of `ShilOpcode` records. Each op names up to three sources and two
//! destinations; parameters are immediates, register references, or
//! null. The backend only ever sees this form.

use crate::sh4ctx::Sh4Context;

/// Guest register identifier. General registers, front floating bank
/// and back floating bank occupy disjoint ranges.
pub type RegId = u32;

pub const REG_R0: RegId = 0;
pub const REG_R15: RegId = 15;
pub const REG_FR0: RegId = 16;
pub const REG_FR15: RegId = 31;
pub const REG_XF0: RegId = 32;
pub const REG_XF15: RegId = 47;

pub fn is_gpr(id: RegId) -> bool {
    id <= REG_R15
}

pub fn is_fpu(id: RegId) -> bool {
    (REG_FR0..=REG_XF15).contains(&id)
}

/// One IR operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShilParam {
    #[default]
    Null,
    Imm(u32),
    /// Single 32-bit register (general or floating).
    Reg(RegId),
    /// 64-bit floating pair starting at an even floating register.
    RegPair(RegId),
}

impl ShilParam {
    pub fn is_null(&self) -> bool {
        matches!(self, ShilParam::Null)
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, ShilParam::Imm(_))
    }

    pub fn is_reg(&self) -> bool {
        matches!(self, ShilParam::Reg(_) | ShilParam::RegPair(_))
    }

    /// 64-bit floating register pair?
    pub fn is_r64f(&self) -> bool {
        matches!(self, ShilParam::RegPair(_))
    }

    pub fn imm_value(&self) -> u32 {
        match self {
            ShilParam::Imm(v) => *v,
            _ => panic!("imm_value on non-immediate param"),
        }
    }

    pub fn reg(&self) -> RegId {
        match self {
            ShilParam::Reg(r) | ShilParam::RegPair(r) => *r,
            _ => panic!("reg on non-register param"),
        }
    }

    /// Address of the register slot inside the context. For pairs this
    /// is the low half; the high half lives at `+4`.
    pub fn reg_ptr(&self, ctx: &Sh4Context) -> *mut u32 {
        ctx.reg_ptr(self.reg())
    }
}

/// IR opcode kinds. The specially-lowered subset matches the original
/// recompiler; the rest goes through the base generator or the
/// canonical-call fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShilOp {
    Mov32,
    Mov64,
    Readm,
    Writem,
    /// Interpreter fallback: rs3 = raw opcode, rs1 = set-pc flag,
    /// rs2 = pc value to set.
    Ifb,
    Jdyn,
    Jcond,
    SyncSr,
    SyncFpscr,

    Add,
    Sub,
    And,
    Or,
    Xor,
    Neg,
    Not,
    Shl,
    Shr,
    Sar,
    Ror,
    /// rd = rs1 + rs2 + rs3(carry); rd2 = carry out.
    Adc,
    /// rd = rs1 - rs2 - rs3(carry); rd2 = borrow out.
    Sbc,
    /// rd = -rs1 - rs2; rd2 = borrow out.
    Negc,
    ExtS8,
    ExtS16,
    MulU16,
    MulS16,
    MulI32,
    MulU64,
    MulS64,
    Test,
    Seteq,
    Setge,
    Setgt,
    Setae,
    Setab,

    Pref,
    Frswap,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fabs,
    Fneg,
    Fsqrt,
    Fmac,
    Fseteq,
    Fsetgt,
    CvtF2iT,
    CvtI2f,
    Fsrra,
    Fsca,
    Shad,
    Shld,
}

impl ShilOp {
    /// Ops whose lowering reads or writes context register slots behind
    /// the register allocator's back.
    pub fn bypasses_regalloc(&self) -> bool {
        matches!(
            self,
            ShilOp::Ifb
                | ShilOp::SyncSr
                | ShilOp::SyncFpscr
                | ShilOp::Frswap
                | ShilOp::Fsrra
                | ShilOp::Fsca
                | ShilOp::MulU64
                | ShilOp::Shad
                | ShilOp::Shld
        )
    }
}

/// One decoded IR operation.
#[derive(Debug, Clone)]
pub struct ShilOpcode {
    pub op: ShilOp,
    pub rd: ShilParam,
    pub rd2: ShilParam,
    pub rs1: ShilParam,
    pub rs2: ShilParam,
    pub rs3: ShilParam,
    /// Transfer size in bytes for readm/writem (1/2/4/8).
    pub size: u8,
    /// Offset of the guest instruction from the block start, in bytes.
    pub guest_offs: u16,
    pub delay_slot: bool,
}

impl ShilOpcode {
    pub fn new(op: ShilOp) -> Self {
        Self {
            op,
            rd: ShilParam::Null,
            rd2: ShilParam::Null,
            rs1: ShilParam::Null,
            rs2: ShilParam::Null,
            rs3: ShilParam::Null,
            size: 0,
            guest_offs: 0,
            delay_slot: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_queries() {
        assert!(ShilParam::Null.is_null());
        assert!(ShilParam::Imm(3).is_imm());
        assert!(ShilParam::Reg(REG_R0).is_reg());
        assert!(ShilParam::RegPair(REG_FR0).is_r64f());
        assert!(!ShilParam::Reg(REG_FR0).is_r64f());
    }

    #[test]
    fn reg_ptr_resolves_into_context() {
        let ctx = Box::<Sh4Context>::default();
        let p = ShilParam::Reg(3);
        assert_eq!(p.reg_ptr(&ctx) as u64, &ctx.r[3] as *const u32 as u64);
        let f = ShilParam::Reg(REG_FR0 + 2);
        assert_eq!(f.reg_ptr(&ctx) as u64, &ctx.fr[2] as *const f32 as u64);
    }
}
