//! Shared host environment for backend tests: guest RAM, memory
//! handlers, dispatch hooks, and a mainloop-driven block runner.
//!
//! Generated blocks clobber callee-saved registers by design, so tests
//! only ever enter them through the generated dispatch trampoline.
//! Hook functions are extern "C" and reach the environment through
//! statics; the global lock serializes tests that execute code.

#![allow(dead_code)]

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use sh4_core::{
    AddrSpace, BlockEndType, HostOps, ImmMemRef, OpCallFp, RuntimeBlockInfo, Sh4Context,
    ShilOpcode,
};
use sh4_dynarec::code_buffer::CodeBuffer;
use sh4_dynarec::{RecConfig, Sh4Dynarec, X64Dynarec};

pub const RAM_SIZE: usize = 0x20000;
const RAM_MASK: usize = RAM_SIZE - 1;

static TEST_LOCK: Mutex<()> = Mutex::new(());

static RAM_BASE: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());
static CTX_PTR: AtomicPtr<Sh4Context> = AtomicPtr::new(std::ptr::null_mut());
static BLOCK_PTR: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());
static BLOCK_PC: AtomicU32 = AtomicU32::new(0);

pub static UPDATE_INTC_CALLS: AtomicUsize = AtomicUsize::new(0);
pub static UPDATE_SR_CALLS: AtomicUsize = AtomicUsize::new(0);
pub static UPDATE_FPSCR_CALLS: AtomicUsize = AtomicUsize::new(0);
pub static BLOCK_CHECK_FAILS: AtomicUsize = AtomicUsize::new(0);
pub static LAST_CHECK_FAIL_PC: AtomicU32 = AtomicU32::new(0);
pub static DO_EXCEPTION_CALLS: AtomicUsize = AtomicUsize::new(0);
pub static LAST_EXCEPTION_PC: AtomicU32 = AtomicU32::new(0);
pub static LAST_EXCEPTION_EVN: AtomicU32 = AtomicU32::new(0);
pub static SQ_WRITES: AtomicUsize = AtomicUsize::new(0);
pub static LAST_SQ_ADDR: AtomicU32 = AtomicU32::new(0);

fn ram() -> *mut u8 {
    RAM_BASE.load(Ordering::Relaxed)
}

// -- address-space handlers (the Slow tier ends up here) --

pub extern "C" fn host_read8(addr: u32) -> u8 {
    unsafe { ram().add(addr as usize & RAM_MASK).read() }
}

pub extern "C" fn host_read16(addr: u32) -> u16 {
    unsafe { (ram().add(addr as usize & RAM_MASK) as *const u16).read_unaligned() }
}

pub extern "C" fn host_read32(addr: u32) -> u32 {
    unsafe { (ram().add(addr as usize & RAM_MASK) as *const u32).read_unaligned() }
}

pub extern "C" fn host_read64(addr: u32) -> u64 {
    unsafe { (ram().add(addr as usize & RAM_MASK) as *const u64).read_unaligned() }
}

pub extern "C" fn host_write8(addr: u32, val: u8) {
    unsafe { ram().add(addr as usize & RAM_MASK).write(val) }
}

pub extern "C" fn host_write16(addr: u32, val: u16) {
    unsafe { (ram().add(addr as usize & RAM_MASK) as *mut u16).write_unaligned(val) }
}

pub extern "C" fn host_write32(addr: u32, val: u32) {
    unsafe { (ram().add(addr as usize & RAM_MASK) as *mut u32).write_unaligned(val) }
}

pub extern "C" fn host_write64(addr: u32, val: u64) {
    unsafe { (ram().add(addr as usize & RAM_MASK) as *mut u64).write_unaligned(val) }
}

fn mem_ptr(addr: u32, size: u32) -> *const u8 {
    if (addr as usize) + size as usize <= RAM_SIZE {
        unsafe { ram().add(addr as usize) }
    } else {
        std::ptr::null()
    }
}

fn read_mem_imm(addr: u32, _size: u32) -> Option<ImmMemRef> {
    if (addr as usize) < RAM_SIZE {
        Some(ImmMemRef {
            ptr: unsafe { ram().add(addr as usize) },
            isram: true,
            addr,
        })
    } else {
        None
    }
}

fn write_mem_imm(addr: u32, _size: u32) -> Option<ImmMemRef> {
    read_mem_imm(addr, _size)
}

// -- dispatch / system hooks --

pub extern "C" fn get_code_by_vaddr(pc: u32) -> *const u8 {
    assert_eq!(pc, BLOCK_PC.load(Ordering::Relaxed), "unexpected dispatch pc");
    BLOCK_PTR.load(Ordering::Relaxed)
}

pub extern "C" fn update_system_intc(ctx: *mut Sh4Context) {
    unsafe { (*ctx).cpu_running = 0 };
}

pub extern "C" fn update_intc(_ctx: *mut Sh4Context) {
    UPDATE_INTC_CALLS.fetch_add(1, Ordering::Relaxed);
}

pub extern "C" fn update_sr(_ctx: *mut Sh4Context) {
    UPDATE_SR_CALLS.fetch_add(1, Ordering::Relaxed);
}

pub extern "C" fn update_fpscr(_ctx: *mut Sh4Context) {
    UPDATE_FPSCR_CALLS.fetch_add(1, Ordering::Relaxed);
}

pub extern "C" fn block_check_fail(pc: u32) {
    BLOCK_CHECK_FAILS.fetch_add(1, Ordering::Relaxed);
    LAST_CHECK_FAIL_PC.store(pc, Ordering::Relaxed);
    // Returns to the slice loop; drain the slice so the run ends
    // instead of re-dispatching the stale block forever.
    let ctx = CTX_PTR.load(Ordering::Relaxed);
    unsafe { (*ctx).cycle_counter = 0 };
}

pub extern "C" fn do_exception(pc: u32, evn: u32) {
    DO_EXCEPTION_CALLS.fetch_add(1, Ordering::Relaxed);
    LAST_EXCEPTION_PC.store(pc, Ordering::Relaxed);
    LAST_EXCEPTION_EVN.store(evn, Ordering::Relaxed);
    let ctx = CTX_PTR.load(Ordering::Relaxed);
    unsafe { (*ctx).cycle_counter = 0 };
}

pub extern "C" fn do_sq_write(addr: u32, ctx: *mut Sh4Context) {
    SQ_WRITES.fetch_add(1, Ordering::Relaxed);
    LAST_SQ_ADDR.store(addr, Ordering::Relaxed);
    unsafe {
        (*ctx).sq_buffer[(addr & 0x3F) as usize] = 0xAB;
    }
}

/// `ifb` interpreter handler: tags r0 with the raw opcode.
pub extern "C" fn ifb_handler(ctx: *mut Sh4Context, op: u16) {
    unsafe { (*ctx).r[0] = (*ctx).r[0].wrapping_add(op as u32) };
}

fn op_handler(_op: u16) -> OpCallFp {
    ifb_handler
}

pub extern "C" fn mmu_lookup_identity(addr: u32, _write: u32, _pc: u32) -> u32 {
    addr
}

// -- environment --

pub struct TestEnv {
    pub dyna: X64Dynarec,
    pub ctx: Box<Sh4Context>,
    ram: Box<[u8]>,
    _guard: MutexGuard<'static, ()>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(RecConfig::default())
    }

    pub fn with_config(cfg: RecConfig) -> Self {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        reset_counters();

        let mut ram = vec![0u8; RAM_SIZE].into_boxed_slice();
        RAM_BASE.store(ram.as_mut_ptr(), Ordering::Relaxed);

        let mut ctx = Box::new(Sh4Context::default());
        ctx.do_exception = Some(do_exception);
        ctx.do_sq_write = Some(do_sq_write);
        CTX_PTR.store(&mut *ctx, Ordering::Relaxed);

        let hooks = HostOps {
            get_code_by_vaddr,
            update_system_intc,
            update_intc,
            update_sr,
            update_fpscr,
            block_check_fail,
            op_handler,
            mmu_lookup: mmu_lookup_identity,
            mmu_address_lut: std::ptr::null(),
        };
        let aspace = AddrSpace {
            ram_base: ram.as_mut_ptr(),
            virtmem_enabled: true,
            read8: host_read8,
            read16: host_read16,
            read32: host_read32,
            read64: host_read64,
            write8: host_write8,
            write16: host_write16,
            write32: host_write32,
            write64: host_write64,
            mem_ptr,
            read_mem_immediate: read_mem_imm,
            write_mem_immediate: write_mem_imm,
        };

        let mut dyna = X64Dynarec::new(hooks, aspace, cfg);
        dyna.init(&mut *ctx, CodeBuffer::new(1 << 20).unwrap());
        dyna.reset().unwrap();

        TestEnv {
            dyna,
            ctx,
            ram,
            _guard: guard,
        }
    }

    pub fn compile(&mut self, block: &mut RuntimeBlockInfo, smc_checks: bool, optimise: bool) {
        self.dyna.compile(block, smc_checks, optimise).unwrap();
        assert!(!block.code.is_null());
    }

    /// Execute one compiled block under the dispatch trampoline.
    pub fn run_block(&mut self, block: &RuntimeBlockInfo) {
        BLOCK_PC.store(block.vaddr, Ordering::Relaxed);
        BLOCK_PTR.store(block.code as *mut u8, Ordering::Relaxed);
        self.ctx.pc = block.vaddr;
        self.ctx.cycle_counter = 1;
        self.ctx.cpu_running = 1;
        self.dyna.mainloop().unwrap();
    }

    pub fn ram_write(&mut self, addr: u32, bytes: &[u8]) {
        self.ram[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
    }

    pub fn ram_read32(&self, addr: u32) -> u32 {
        u32::from_le_bytes(
            self.ram[addr as usize..addr as usize + 4]
                .try_into()
                .unwrap(),
        )
    }
}

fn reset_counters() {
    for c in [
        &UPDATE_INTC_CALLS,
        &UPDATE_SR_CALLS,
        &UPDATE_FPSCR_CALLS,
        &BLOCK_CHECK_FAILS,
        &DO_EXCEPTION_CALLS,
        &SQ_WRITES,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}

/// Single-op block with the given end kind.
pub fn block_with(vaddr: u32, end: BlockEndType, ops: Vec<ShilOpcode>) -> RuntimeBlockInfo {
    let mut b = RuntimeBlockInfo::new(vaddr & 0x1FFF_FFFF, vaddr);
    b.oplist = ops;
    b.guest_cycles = 1;
    b.sh4_code_size = (b.oplist.len().max(1) * 2) as u32;
    b.end = end;
    b
}

/// Find the offset (within the block's code) of the 5-byte call that
/// targets `handler`.
pub fn find_call_site(block: &RuntimeBlockInfo, handler: *const u8) -> Option<usize> {
    let code = unsafe { std::slice::from_raw_parts(block.code, block.host_code_size) };
    for off in 0..code.len().saturating_sub(4) {
        if code[off] != 0xE8 {
            continue;
        }
        let disp = i32::from_le_bytes(code[off + 1..off + 5].try_into().unwrap());
        let target = block.code as i64 + off as i64 + 5 + disp as i64;
        if target == handler as i64 {
            return Some(off);
        }
    }
    None
}
