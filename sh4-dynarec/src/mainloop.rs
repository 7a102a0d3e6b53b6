//! Dispatch trampoline generation.
//!
//! Emits, once per recompiler reset and in one contiguous stretch of
//! the buffer: the outer prologue, the run loop (poll CpuRunning), the
//! slice loop (lookup → call block → check cycles), the epilogue, the
//! guest-exception long-jump target, and the memory-handler grid. The
//! last 128 bytes of the buffer are reserved for the exception
//! trampoline's unwind descriptor.

use crate::mem_handlers::{gen_mem_handlers, MemHandlerTable};
use crate::unwind::UnwindPublisher;
use crate::code_buffer::CodeBuffer;
use crate::x86_64::emitter::{ArithOp, Cc, EmitError, Emitter};
use crate::x86_64::regs::{Reg, HOST_ABI, MAINLOOP_SAVED};
use sh4_core::{AddrSpace, HostOps, Sh4Context};

/// Guest cycles per dispatch slice.
pub const SH4_TIMESLICE: u32 = 448;

/// Reserved tail for the exception trampoline's unwind descriptor.
pub const UNWIND_TAIL: usize = 128;

pub struct Mainloop {
    pub entry: *const u8,
    pub handle_exception: *const u8,
    pub mem_handlers: MemHandlerTable,
}

pub fn gen_mainloop(
    buf: &mut CodeBuffer,
    ctx: &Sh4Context,
    hooks: &HostOps,
    aspace: &AddrSpace,
    unwinder: &mut UnwindPublisher,
    jmp_rsp_addr: u64,
) -> Result<Mainloop, EmitError> {
    let abi = &HOST_ABI;
    let mut em = Emitter::new(buf);
    let entry = em.current_ptr();

    unwinder.start(entry);
    for &reg in MAINLOOP_SAVED {
        em.push(reg);
        unwinder.push_reg(em.size(), reg);
    }
    em.arith_ri(ArithOp::Sub, true, Reg::Rsp, abi.stack_align as i32);
    unwinder.alloc_stack(em.size(), abi.stack_align);
    unwinder.end_prolog(em.size());

    // Publish the dispatch stack pointer; handleException restores it.
    em.mov_ri(Reg::Rax, jmp_rsp_addr);
    em.store(true, Reg::Rsp, Reg::Rax, 0);

    let run_loop = em.new_label();
    let end_run_loop = em.new_label();

    em.bind(run_loop);
    em.mov_ri(Reg::Rax, ctx.cpu_running_addr());
    em.load(false, Reg::Rdx, Reg::Rax, 0);
    em.test_rr(false, Reg::Rdx, Reg::Rdx);
    em.jcc_near(Cc::E, end_run_loop);

    let slice_loop = em.new_label();
    em.bind(slice_loop);
    em.mov_ri(Reg::Rax, ctx.pc_addr());
    em.load(false, abi.call_regs[0], Reg::Rax, 0);
    em.call_ptr(hooks.get_code_by_vaddr as *const u8);
    em.call_reg(Reg::Rax);
    em.mov_ri(Reg::Rax, ctx.cycle_counter_addr());
    em.load(false, Reg::Rcx, Reg::Rax, 0);
    em.test_rr(false, Reg::Rcx, Reg::Rcx);
    em.jcc_near(Cc::G, slice_loop);

    em.arith_ri(ArithOp::Add, false, Reg::Rcx, SH4_TIMESLICE as i32);
    em.store(false, Reg::Rcx, Reg::Rax, 0);
    em.mov_ri(abi.call_regs[0], ctx.addr());
    em.call_ptr(hooks.update_system_intc as *const u8);
    em.jmp_near(run_loop);

    em.bind(end_run_loop);
    em.arith_ri(ArithOp::Add, true, Reg::Rsp, abi.stack_align as i32);
    for &reg in MAINLOOP_SAVED.iter().rev() {
        em.pop(reg);
    }
    em.ret();
    let main_code_size = em.size();
    unwinder.end(&mut em, main_code_size);

    // -- exception long-jump target, with its own unwind region --

    let region_start_offset = em.current_offset();
    unwinder.start(em.current_ptr());
    // The trampoline runs on frames that only carried the per-block
    // stack bracket.
    unwinder.alloc_stack(0, if abi.windows { 40 } else { 8 });
    unwinder.end_prolog(0);

    let handle_exception = em.current_ptr();
    em.mov_ri(Reg::Rax, jmp_rsp_addr);
    em.load(true, Reg::Rsp, Reg::Rax, 0);
    em.jmp_near(run_loop);

    let mem_handlers = gen_mem_handlers(&mut em, ctx.sq_buffer_addr(), aspace);

    // Lay the descriptor down in the reserved tail at the buffer end.
    let saved_offset = em.current_offset();
    let region_size = saved_offset - region_start_offset;
    em.set_offset(em.capacity() - UNWIND_TAIL);
    let unwind_size = unwinder.end(&mut em, region_size);
    assert!(unwind_size <= UNWIND_TAIL, "unwind descriptor overflow");
    em.set_offset(saved_offset);

    em.ready()?;
    Ok(Mainloop {
        entry,
        handle_exception,
        mem_handlers,
    })
}
