//! Runtime block descriptors.

use crate::shil::ShilOpcode;

/// How a block ends; drives the successor-pc store emitted at the tail
/// of the compiled block. The conditional kinds rely on their low bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockEndType {
    StaticJump = 0,
    StaticCall = 1,
    Cond0 = 2,
    Cond1 = 3,
    DynamicJump = 4,
    DynamicCall = 5,
    DynamicRet = 6,
    StaticIntr = 7,
    DynamicIntr = 8,
}

impl BlockEndType {
    /// Taken-condition value for the conditional kinds.
    pub fn cond_bit(self) -> u32 {
        self as u32 & 1
    }
}

/// A decoded guest basic block plus, after compilation, its host entry.
pub struct RuntimeBlockInfo {
    /// Guest physical address.
    pub addr: u32,
    /// Guest virtual address.
    pub vaddr: u32,
    pub oplist: Vec<ShilOpcode>,
    pub guest_cycles: u32,
    /// Guest code size in bytes, for the self-modifying-code guard.
    pub sh4_code_size: u32,
    pub end: BlockEndType,
    /// Fallthrough successor (virtual).
    pub next_block: u32,
    /// Branch successor (virtual).
    pub branch_block: u32,
    pub has_fpu_op: bool,
    /// Conditional end tests `jdyn` instead of `sr.T`.
    pub has_jcond: bool,

    /// Host entry point; null until compiled.
    pub code: *const u8,
    pub host_code_size: usize,
}

impl RuntimeBlockInfo {
    pub fn new(addr: u32, vaddr: u32) -> Self {
        Self {
            addr,
            vaddr,
            oplist: Vec::new(),
            guest_cycles: 0,
            sh4_code_size: 0,
            end: BlockEndType::StaticJump,
            next_block: 0,
            branch_block: 0,
            has_fpu_op: false,
            has_jcond: false,
            code: std::ptr::null(),
            host_code_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_bits() {
        assert_eq!(BlockEndType::Cond0.cond_bit(), 0);
        assert_eq!(BlockEndType::Cond1.cond_bit(), 1);
    }
}
