//! Fast-path fault rewriting.
//!
//! When a speculative Fast-tier access faults, the host signal handler
//! hands over a pre-extracted context. The faulted call site is found
//! through the return address on the stack, matched against the Fast
//! row of the handler grid, and overwritten in place with a call to the
//! correct StoreQueue or Slow handler. Execution resumes at the
//! rewritten call as if the slower tier had been used all along.

use crate::code_buffer::CodeBuffer;
use crate::mem_handlers::{MemHandlerTable, MemOp, MemSize, MemType, MEM_OP_COUNT, MEM_SIZE_COUNT};
use crate::x86_64::emitter::Emitter;

/// Host register state extracted by the signal/SEH handler. `arg0` is
/// the first integer argument register of the host ABI (rdi on System V,
/// rcx on Windows).
#[derive(Debug, Clone, Copy)]
pub struct HostContext {
    pub pc: usize,
    pub rsp: usize,
    pub r9: u64,
    pub arg0: u64,
}

/// Patch the faulted Fast call site. Returns true when the site was
/// rewritten and the context updated for resumption. The caller holds
/// the W^X write bracket.
pub fn rewrite_mem_access(
    buf: &mut CodeBuffer,
    mem: &MemHandlerTable,
    virtmem_enabled: bool,
    context: &mut HostContext,
) -> bool {
    if !virtmem_enabled {
        return false;
    }
    if !mem.contains(context.pc) {
        return false;
    }

    // The faulted call pushed its return address; the rel32 call's
    // displacement sits in the 4 bytes before it.
    let ret_addr = unsafe { *(context.rsp as *const usize) } as *const u8;
    let disp = unsafe { (ret_addr.sub(4) as *const i32).read_unaligned() };
    let callee = (ret_addr as i64 + disp as i64) as *const u8;

    for size_i in 0..MEM_SIZE_COUNT {
        for op_i in 0..MEM_OP_COUNT {
            let size = MemSize::from_index(size_i);
            let op = MemOp::from_index(op_i);
            if mem.get(MemType::Fast, size, op) != callee {
                continue;
            }

            // found!
            let mem_address = context.r9 as u32;
            let target = if op == MemOp::W && size >= MemSize::S32 && mem_address >> 26 == 0x38 {
                mem.get(MemType::StoreQueue, size, MemOp::W)
            } else {
                mem.get(MemType::Slow, size, op)
            };

            let site = ret_addr.wrapping_sub(5);
            let Some(site_offset) = buf.offset_of(site) else {
                return false;
            };
            let saved_offset = buf.offset();
            let mut em = Emitter::at_offset(&mut *buf, site_offset);
            em.call_rel32(target);
            assert!(em.size() == 5, "fast call sites are exactly 5 bytes");
            let ok = em.ready().is_ok();
            buf.set_offset(saved_offset);
            if !ok {
                return false;
            }

            context.pc = site as usize;
            // remove the faulted call's return address from the stack
            context.rsp += 8;
            // the guest address survives in r9; make arg0 valid again
            context.arg0 = mem_address as u64;
            return true;
        }
    }
    tracing::error!(
        "rewrite_mem_access: code not found, host pc {:#x}",
        context.pc
    );
    false
}
