//! The three-tier memory-access ladder.
//!
//! A 3 × 4 × 2 grid of generated trampolines: Fast (TLB-less direct
//! RAM), StoreQueue (wide writes into the SQ scratch), Slow (generic
//! host handlers). Compiled blocks call the Fast or Slow row depending
//! on the optimise flag; the fault rewriter retargets Fast call sites
//! into the other rows after an access violation.

use crate::x86_64::emitter::{ArithOp, Cc, Emitter, ShiftOp};
use crate::x86_64::regs::{Reg, HOST_ABI};
use sh4_core::AddrSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MemType {
    Fast = 0,
    StoreQueue = 1,
    Slow = 2,
}

pub const MEM_TYPE_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum MemSize {
    S8 = 0,
    S16 = 1,
    S32 = 2,
    S64 = 3,
}

pub const MEM_SIZE_COUNT: usize = 4;

impl MemSize {
    pub fn from_bytes(bytes: u8) -> MemSize {
        match bytes {
            1 => MemSize::S8,
            2 => MemSize::S16,
            4 => MemSize::S32,
            8 => MemSize::S64,
            _ => panic!("invalid transfer size {bytes}"),
        }
    }

    pub fn from_index(i: usize) -> MemSize {
        [MemSize::S8, MemSize::S16, MemSize::S32, MemSize::S64][i]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MemOp {
    R = 0,
    W = 1,
}

pub const MEM_OP_COUNT: usize = 2;

impl MemOp {
    pub fn from_index(i: usize) -> MemOp {
        [MemOp::R, MemOp::W][i]
    }
}

/// The generated grid plus its contiguous byte extent, written once per
/// recompiler reset and read-only afterwards.
pub struct MemHandlerTable {
    handlers: [[[*const u8; MEM_OP_COUNT]; MEM_SIZE_COUNT]; MEM_TYPE_COUNT],
    start: *const u8,
    end: *const u8,
}

impl MemHandlerTable {
    pub fn empty() -> Self {
        Self {
            handlers: [[[std::ptr::null(); MEM_OP_COUNT]; MEM_SIZE_COUNT]; MEM_TYPE_COUNT],
            start: std::ptr::null(),
            end: std::ptr::null(),
        }
    }

    pub fn get(&self, ty: MemType, size: MemSize, op: MemOp) -> *const u8 {
        self.handlers[ty as usize][size as usize][op as usize]
    }

    pub fn start(&self) -> *const u8 {
        self.start
    }

    pub fn end(&self) -> *const u8 {
        self.end
    }

    /// Is this host pc inside the grid's byte extent?
    pub fn contains(&self, pc: usize) -> bool {
        !self.start.is_null() && pc >= self.start as usize && pc < self.end as usize
    }
}

/// Emit the whole grid. `sq_buffer_addr` is the address of the context's
/// store-queue scratch.
pub fn gen_mem_handlers(
    em: &mut Emitter,
    sq_buffer_addr: u64,
    aspace: &AddrSpace,
) -> MemHandlerTable {
    let arg0 = HOST_ABI.call_regs[0];
    let arg1 = HOST_ABI.call_regs[1];
    let mut table = MemHandlerTable::empty();
    table.start = em.current_ptr();

    for ty_i in 0..MEM_TYPE_COUNT {
        for size_i in 0..MEM_SIZE_COUNT {
            for op_i in 0..MEM_OP_COUNT {
                let size = MemSize::from_index(size_i);
                let op = MemOp::from_index(op_i);
                table.handlers[ty_i][size_i][op_i] = em.current_ptr();

                if ty_i == MemType::Fast as usize && aspace.virtmem_enabled {
                    // host address = ram_base + (guest & 0x1FFFFFFF);
                    // the unmasked guest address parks in r9 so the
                    // fault rewriter can recover it.
                    em.mov_ri(Reg::Rax, aspace.ram_base as u64);
                    em.mov_rr(true, Reg::R9, arg0);
                    em.arith_ri(ArithOp::And, false, arg0, 0x1FFF_FFFF);

                    match (size, op) {
                        (MemSize::S8, MemOp::R) => em.load_sx8_sib(Reg::Rax, Reg::Rax, arg0),
                        (MemSize::S8, MemOp::W) => em.store8_sib(arg1, Reg::Rax, arg0),
                        (MemSize::S16, MemOp::R) => em.load_sx16_sib(Reg::Rax, Reg::Rax, arg0),
                        (MemSize::S16, MemOp::W) => em.store16_sib(arg1, Reg::Rax, arg0),
                        (MemSize::S32, MemOp::R) => em.load_sib(false, Reg::Rax, Reg::Rax, arg0),
                        (MemSize::S32, MemOp::W) => em.store_sib(false, arg1, Reg::Rax, arg0),
                        (MemSize::S64, MemOp::R) => em.load_sib(true, Reg::Rax, Reg::Rax, arg0),
                        (MemSize::S64, MemOp::W) => em.store_sib(true, arg1, Reg::Rax, arg0),
                    }
                } else if ty_i == MemType::StoreQueue as usize {
                    // Only wide writes get a real handler; the other
                    // slots alias whatever comes next, same as the
                    // fallthrough in the reference grid.
                    if op != MemOp::W || size < MemSize::S32 {
                        continue;
                    }
                    let no_sqw = em.new_label();
                    em.mov_rr(false, Reg::R9, arg0);
                    em.shift_ri(ShiftOp::Shr, false, Reg::R9, 26);
                    em.arith_ri(ArithOp::Cmp, false, Reg::R9, 0x38);
                    em.jcc_short(Cc::Ne, no_sqw);
                    em.mov_ri(Reg::Rax, sq_buffer_addr);
                    em.arith_ri(ArithOp::And, false, arg0, 0x3F);
                    if size == MemSize::S32 {
                        em.store_sib(false, arg1, Reg::Rax, arg0);
                    } else {
                        em.store_sib(true, arg1, Reg::Rax, arg0);
                    }
                    em.ret();
                    em.bind(no_sqw);
                    if size == MemSize::S32 {
                        em.jmp_ptr(aspace.write32 as *const u8); // tail call
                    } else {
                        em.jmp_ptr(aspace.write64 as *const u8); // tail call
                    }
                    continue;
                } else {
                    // Slow path
                    if op == MemOp::R {
                        match size {
                            MemSize::S8 => {
                                em.arith_ri(ArithOp::Sub, true, Reg::Rsp, HOST_ABI.stack_align as i32);
                                em.call_ptr(aspace.read8 as *const u8);
                                em.movsx8_rr(Reg::Rax, Reg::Rax);
                                em.arith_ri(ArithOp::Add, true, Reg::Rsp, HOST_ABI.stack_align as i32);
                            }
                            MemSize::S16 => {
                                em.arith_ri(ArithOp::Sub, true, Reg::Rsp, HOST_ABI.stack_align as i32);
                                em.call_ptr(aspace.read16 as *const u8);
                                em.movsx16_rr(Reg::Rax, Reg::Rax);
                                em.arith_ri(ArithOp::Add, true, Reg::Rsp, HOST_ABI.stack_align as i32);
                            }
                            MemSize::S32 => {
                                em.jmp_ptr(aspace.read32 as *const u8); // tail call
                                continue;
                            }
                            MemSize::S64 => {
                                em.jmp_ptr(aspace.read64 as *const u8); // tail call
                                continue;
                            }
                        }
                    } else {
                        let target = match size {
                            MemSize::S8 => aspace.write8 as *const u8,
                            MemSize::S16 => aspace.write16 as *const u8,
                            MemSize::S32 => aspace.write32 as *const u8,
                            MemSize::S64 => aspace.write64 as *const u8,
                        };
                        em.jmp_ptr(target); // tail call
                        continue;
                    }
                }
                em.ret();
            }
        }
    }

    table.end = em.current_ptr();
    table
}
