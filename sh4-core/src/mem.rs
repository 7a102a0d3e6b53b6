//! Host contracts consumed by the backend.
//!
//! The recompiler never owns guest memory, the interpreter, or the MMU;
//! it reaches them through the function-pointer tables below. Every
//! pointer that ends up inside generated code must use the C ABI.

use crate::sh4ctx::Sh4Context;

/// Interpreter handler for one raw SH-4 opcode.
pub type OpCallFp = extern "C" fn(*mut Sh4Context, u16);

/// Result of the immediate-address oracle: either a direct RAM pointer
/// (`isram`) or an MMIO handler plus the resolved physical address.
#[derive(Debug, Clone, Copy)]
pub struct ImmMemRef {
    pub ptr: *mut u8,
    pub isram: bool,
    pub addr: u32,
}

/// Guest address space, as seen by generated code.
///
/// `read8..write64` are the generic slow handlers the memory-access
/// ladder tail-calls into. `ram_base` backs the TLB-less fast tier:
/// host address = `ram_base + (guest & 0x1FFF_FFFF)`.
pub struct AddrSpace {
    pub ram_base: *mut u8,
    /// Fast tier is only emitted when the host has the guest RAM
    /// mirror-mapped; otherwise every Fast slot degrades to Slow.
    pub virtmem_enabled: bool,

    pub read8: extern "C" fn(u32) -> u8,
    pub read16: extern "C" fn(u32) -> u16,
    pub read32: extern "C" fn(u32) -> u32,
    pub read64: extern "C" fn(u32) -> u64,
    pub write8: extern "C" fn(u32, u8),
    pub write16: extern "C" fn(u32, u16),
    pub write32: extern "C" fn(u32, u32),
    pub write64: extern "C" fn(u32, u64),

    /// Compile-time pointer into the guest code image, used to snapshot
    /// block bytes for the SMC guard. Null when `addr` is not plain RAM.
    pub mem_ptr: fn(addr: u32, size: u32) -> *const u8,
    /// Immediate-address oracles; `None` result means "take the generic
    /// path". MMIO handler pointers returned here are 32-bit handlers.
    pub read_mem_immediate: fn(addr: u32, size: u32) -> Option<ImmMemRef>,
    pub write_mem_immediate: fn(addr: u32, size: u32) -> Option<ImmMemRef>,
}

/// Host operations invoked from generated code or at compile time.
pub struct HostOps {
    /// Block-manager lookup used by the slice loop.
    pub get_code_by_vaddr: extern "C" fn(u32) -> *const u8,
    /// End-of-slice system update (timers, interrupt controller).
    pub update_system_intc: extern "C" fn(*mut Sh4Context),
    /// Interrupt check after Intr block ends.
    pub update_intc: extern "C" fn(*mut Sh4Context),
    pub update_sr: extern "C" fn(*mut Sh4Context),
    pub update_fpscr: extern "C" fn(*mut Sh4Context),
    /// SMC guard failure: discards the block and returns to the
    /// dispatch loop. Reached by a tail jump, never a call.
    pub block_check_fail: extern "C" fn(u32),
    /// Interpreter handler lookup for `ifb`, keyed by raw opcode.
    pub op_handler: fn(u16) -> OpCallFp,
    /// MMU miss path: `(vaddr, is_write, pc) -> paddr`.
    pub mmu_lookup: extern "C" fn(u32, u32, u32) -> u32,
    /// Page-indexed virtual→physical LUT for the inline MMU fast path;
    /// null when the MMU is off.
    pub mmu_address_lut: *const u32,
}
