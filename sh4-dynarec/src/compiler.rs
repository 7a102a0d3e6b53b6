//! Block compiler: lowers one decoded block into x86-64 code.
//!
//! Pipeline per block: entry SMC/MMU guard, stack bracket, FPU-disabled
//! trap, cycle debit, register preload, per-op lowering, writeback,
//! block-end pc resolution, epilogue. Memory accesses go through the
//! handler grid; immediate addresses get inlined when the host oracle
//! allows it.

use crate::code_buffer::CodeBuffer;
use crate::mem_handlers::{MemHandlerTable, MemOp, MemSize, MemType};
use crate::regalloc::X64RegAlloc;
use crate::x86_64::emitter::{ArithOp, Cc, EmitError, Emitter, Label, ShiftOp};
use crate::x86_64::regs::{Reg, Xmm, HOST_ABI, XMM_SAVE_SCRATCH};
use crate::RecConfig;
use sh4_core::sh4ctx::{Sh4ThrownException, SH4_EX_FPU_DISABLED};
use sh4_core::{AddrSpace, HostOps, OpCallFp, RuntimeBlockInfo, Sh4Context, ShilOp, ShilOpcode, ShilParam};

/// Host vector capabilities, sampled once.
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    pub avx512f: bool,
    pub avx: bool,
    pub fma: bool,
}

impl CpuFeatures {
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self {
                avx512f: std::arch::is_x86_feature_detected!("avx512f"),
                avx: std::arch::is_x86_feature_detected!("avx"),
                fma: std::arch::is_x86_feature_detected!("fma"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self {
                avx512f: false,
                avx: false,
                fma: false,
            }
        }
    }
}

/// Canonical parameter kinds for ABI-agnostic opcode lowerers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalParamType {
    U32,
    F32,
    Ptr,
    Sh4Ctx,
    U32Rv,
    U64RvL,
    U64RvH,
    F32Rv,
}

const NO_OPID: usize = usize::MAX;

pub struct BlockCompiler<'a> {
    em: Emitter<'a>,
    ctx: &'a Sh4Context,
    hooks: &'a HostOps,
    aspace: &'a AddrSpace,
    cfg: &'a RecConfig,
    mem: &'a MemHandlerTable,
    xmm_save_addr: u64,
    features: CpuFeatures,
    regalloc: X64RegAlloc,
    current_opid: usize,
    exit_block: Label,
    cc_pars: Vec<(CanonicalParamType, ShilParam)>,
}

impl<'a> BlockCompiler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buf: &'a mut CodeBuffer,
        ctx: &'a Sh4Context,
        hooks: &'a HostOps,
        aspace: &'a AddrSpace,
        cfg: &'a RecConfig,
        mem: &'a MemHandlerTable,
        xmm_save_addr: u64,
    ) -> Self {
        let mut em = Emitter::new(buf);
        let exit_block = em.new_label();
        Self {
            em,
            ctx,
            hooks,
            aspace,
            cfg,
            mem,
            xmm_save_addr,
            features: CpuFeatures::detect(),
            regalloc: X64RegAlloc::new(cfg.alloc_f64),
            current_opid: NO_OPID,
            exit_block,
            cc_pars: Vec::new(),
        }
    }

    pub fn compile(
        &mut self,
        block: &mut RuntimeBlockInfo,
        smc_checks: bool,
        optimise: bool,
    ) -> Result<(), EmitError> {
        let abi = &HOST_ABI;
        self.current_opid = NO_OPID;

        self.check_block(smc_checks, block);

        self.em
            .arith_ri(ArithOp::Sub, true, Reg::Rsp, abi.stack_align as i32);

        if self.cfg.mmu_enabled && block.has_fpu_op {
            let fpu_enabled = self.em.new_label();
            self.em.mov_ri(Reg::Rax, self.ctx.sr_status_addr());
            self.em.test_mi32(Reg::Rax, 0, 0x8000); // SR.FD
            self.em.jcc_near(Cc::E, fpu_enabled);
            self.em.mov_ri(abi.call_regs[0], block.vaddr as u64);
            self.em.mov_ri(abi.call_regs[1], SH4_EX_FPU_DISABLED as u64);
            let do_ex = self.ctx.do_exception.expect("do_exception hook not set");
            self.gen_call(do_ex as *const u8, false);
            self.em.jmp_near(self.exit_block);
            self.em.bind(fpu_enabled);
        }

        self.em.mov_ri(Reg::Rax, self.ctx.cycle_counter_addr());
        self.em
            .arith_mi32(ArithOp::Sub, Reg::Rax, 0, block.guest_cycles);

        self.regalloc.do_alloc(block);
        for (reg, host) in self.regalloc.preloads().to_vec() {
            self.reg_preload(reg, host);
        }
        for (reg, x) in self.regalloc.fpu_preloads().to_vec() {
            self.reg_preload_fpu(reg, x);
        }

        for opid in 0..block.oplist.len() {
            let op = block.oplist[opid].clone();
            self.current_opid = opid;
            self.regalloc.op_begin(&op, opid);

            match op.op {
                ShilOp::Ifb => self.gen_ifb(&op, block),
                ShilOp::Mov64 => self.gen_mov64(&op),
                ShilOp::Readm => self.gen_readm(&op, block, optimise),
                ShilOp::Writem => self.gen_writem(&op, block, optimise),
                ShilOp::SyncSr => {
                    self.em.mov_ri(abi.call_regs[0], self.ctx.addr());
                    self.gen_call(self.hooks.update_sr as *const u8, false);
                }
                ShilOp::SyncFpscr => {
                    self.em.mov_ri(abi.call_regs[0], self.ctx.addr());
                    self.gen_call(self.hooks.update_fpscr as *const u8, false);
                }
                ShilOp::Negc => self.gen_negc(&op),
                ShilOp::MulS64 => self.gen_mul_s64(&op),
                ShilOp::Pref => self.gen_pref(&op, block),
                ShilOp::Frswap => self.gen_frswap(&op),
                ShilOp::Fmac => self.gen_fmac(&op),
                _ => {
                    if !self.gen_base_opcode(&op) {
                        self.canon_fallback(&op);
                    }
                }
            }

            self.regalloc.op_end(&op);
        }
        self.current_opid = NO_OPID;

        for (reg, host) in self.regalloc.writebacks() {
            self.reg_writeback(reg, host);
        }
        for (reg, x) in self.regalloc.fpu_writebacks() {
            self.reg_writeback_fpu(reg, x);
        }

        self.gen_block_end(block);

        self.em.bind(self.exit_block);
        self.em
            .arith_ri(ArithOp::Add, true, Reg::Rsp, abi.stack_align as i32);
        self.em.ret();

        self.em.ready()?;

        block.code = unsafe { self.em.base_ptr().add(self.em.start()) };
        block.host_code_size = self.em.size();
        Ok(())
    }

    /// Offset where this compilation started (for error rewind).
    pub fn start_offset(&self) -> usize {
        self.em.start()
    }

    // -- entry guards --

    fn check_block(&mut self, force_checks: bool, block: &RuntimeBlockInfo) {
        let abi = &HOST_ABI;
        if self.cfg.mmu_enabled || force_checks {
            self.em.mov_ri(abi.call_regs[0], block.addr as u64);
        }

        // Under MMU the decoder's pc assumptions only hold when the live
        // pc still matches the block's virtual address.
        if self.cfg.mmu_enabled {
            self.em.mov_ri(Reg::Rax, self.ctx.pc_addr());
            self.em.arith_mi32(ArithOp::Cmp, Reg::Rax, 0, block.vaddr);
            self.em
                .jcc_ptr(Cc::Ne, self.hooks.block_check_fail as *const u8);
        }

        if !force_checks {
            return;
        }

        let mut sz = block.sh4_code_size as i64;
        let mut sa = block.addr;
        let mut ptr = (self.aspace.mem_ptr)(sa, if sz > 8 { 8 } else { sz as u32 });
        if ptr.is_null() {
            return;
        }
        while sz > 0 {
            let uintptr = ptr as u64;
            self.em.mov_ri(Reg::Rax, uintptr);

            if sz >= 8 && uintptr & 7 == 0 {
                let val = unsafe { (ptr as *const u64).read() };
                self.em.mov_ri(Reg::Rdx, val);
                self.em.arith_mr(ArithOp::Cmp, true, Reg::Rax, 0, Reg::Rdx);
                sz -= 8;
                sa += 8;
            } else if sz >= 4 && uintptr & 3 == 0 {
                let val = unsafe { (ptr as *const u32).read() };
                self.em.mov_ri(Reg::Rdx, val as u64);
                self.em.arith_mr(ArithOp::Cmp, false, Reg::Rax, 0, Reg::Rdx);
                sz -= 4;
                sa += 4;
            } else {
                let val = unsafe { (ptr as *const u16).read() };
                self.em.mov_ri(Reg::Rdx, val as u64);
                self.em.arith16_mr(ArithOp::Cmp, Reg::Rax, 0, Reg::Rdx);
                sz -= 2;
                sa += 2;
            }
            self.em
                .jcc_ptr(Cc::Ne, self.hooks.block_check_fail as *const u8);
            ptr = (self.aspace.mem_ptr)(sa, if sz > 8 { 8 } else { sz as u32 });
            if ptr.is_null() {
                return;
            }
        }
    }

    // -- register allocator hooks --

    fn reg_preload(&mut self, reg: u32, host: Reg) {
        self.em.mov_ri(Reg::Rax, self.ctx.reg_ptr(reg) as u64);
        self.em.load(false, host, Reg::Rax, 0);
    }

    fn reg_writeback(&mut self, reg: u32, host: Reg) {
        self.em.mov_ri(Reg::Rax, self.ctx.reg_ptr(reg) as u64);
        self.em.store(false, host, Reg::Rax, 0);
    }

    fn reg_preload_fpu(&mut self, reg: u32, x: Xmm) {
        self.em.mov_ri(Reg::Rax, self.ctx.reg_ptr(reg) as u64);
        self.em.movss_load(x, Reg::Rax, 0);
    }

    fn reg_writeback_fpu(&mut self, reg: u32, x: Xmm) {
        self.em.mov_ri(Reg::Rax, self.ctx.reg_ptr(reg) as u64);
        self.em.movss_store(Reg::Rax, 0, x);
    }

    // -- parameter plumbing --

    /// Materialize a 32-bit parameter into a host register.
    fn shil_param_to_host_reg(&mut self, prm: &ShilParam, host: Reg) {
        assert!(host != Reg::Rax, "rax is the address scratch");
        match prm {
            ShilParam::Imm(v) => self.em.mov_ri(host, *v as u64),
            _ if self.regalloc.is_allocg(prm) => {
                let src = self.regalloc.map_register(prm);
                self.em.mov_rr(false, host, src);
            }
            _ if self.regalloc.is_allocf(prm) && !prm.is_r64f() => {
                let src = self.regalloc.map_x_register(prm);
                self.em.movd_rx(host, src);
            }
            ShilParam::Reg(_) => {
                self.em.mov_ri(Reg::Rax, prm.reg_ptr(self.ctx) as u64);
                self.em.load(false, host, Reg::Rax, 0);
            }
            _ => panic!("cannot load param {prm:?}"),
        }
    }

    /// Store a 32-bit host register into a destination parameter.
    fn host_reg_to_shil_param(&mut self, prm: &ShilParam, host: Reg) {
        assert!(host != Reg::Rax, "rax is the address scratch");
        if self.regalloc.is_allocg(prm) {
            let dst = self.regalloc.map_register(prm);
            self.em.mov_rr(false, dst, host);
        } else if self.regalloc.is_allocf(prm) && !prm.is_r64f() {
            let dst = self.regalloc.map_x_register(prm);
            self.em.movd_xr(dst, host);
        } else {
            self.em.mov_ri(Reg::Rax, prm.reg_ptr(self.ctx) as u64);
            self.em.store(false, host, Reg::Rax, 0);
        }
    }

    /// Store a scalar float result into a destination parameter.
    fn host_xmm_to_shil_param(&mut self, prm: &ShilParam, x: Xmm) {
        if self.regalloc.is_allocf(prm) && !prm.is_r64f() {
            let dst = self.regalloc.map_x_register(prm);
            self.em.movss_rr(dst, x);
        } else {
            self.em.mov_ri(Reg::Rax, prm.reg_ptr(self.ctx) as u64);
            self.em.movss_store(Reg::Rax, 0, x);
        }
    }

    /// Float source: the mapped XMM, or the value loaded into `scratch`.
    fn param_to_xmm(&mut self, prm: &ShilParam, scratch: Xmm) -> Xmm {
        match prm {
            _ if self.regalloc.is_allocf(prm) && !prm.is_r64f() => {
                self.regalloc.map_x_register(prm)
            }
            ShilParam::Imm(v) => {
                self.em.mov_ri(Reg::Rax, *v as u64);
                self.em.movd_xr(scratch, Reg::Rax);
                scratch
            }
            ShilParam::Reg(_) => {
                self.em.mov_ri(Reg::Rax, prm.reg_ptr(self.ctx) as u64);
                self.em.movss_load(scratch, Reg::Rax, 0);
                scratch
            }
            _ => panic!("cannot load float param {prm:?}"),
        }
    }

    /// Float source copied into `scratch` unconditionally, so writing
    /// the destination cannot clobber it.
    fn param_to_xmm_copy(&mut self, prm: &ShilParam, scratch: Xmm) -> Xmm {
        let src = self.param_to_xmm(prm, scratch);
        if src != scratch {
            self.em.movss_rr(scratch, src);
        }
        scratch
    }

    /// Destination GPR: the mapped register, or a scratch that
    /// `store_dest_gpr` flushes afterwards.
    fn dest_gpr(&self, prm: &ShilParam) -> (Reg, bool) {
        match self.regalloc.mapg(prm) {
            Some(r) => (r, false),
            None => (Reg::Rdx, true),
        }
    }

    fn store_dest_gpr(&mut self, prm: &ShilParam, reg: Reg, spill: bool) {
        if spill {
            self.em.mov_ri(Reg::Rax, prm.reg_ptr(self.ctx) as u64);
            self.em.store(false, reg, Reg::Rax, 0);
        }
    }

    fn dest_xmm(&self, prm: &ShilParam, scratch: Xmm) -> (Xmm, bool) {
        if self.regalloc.is_allocf(prm) && !prm.is_r64f() {
            (self.regalloc.map_x_register(prm), false)
        } else {
            (scratch, true)
        }
    }

    fn store_dest_xmm(&mut self, prm: &ShilParam, x: Xmm, spill: bool) {
        if spill {
            self.em.mov_ri(Reg::Rax, prm.reg_ptr(self.ctx) as u64);
            self.em.movss_store(Reg::Rax, 0, x);
        }
    }

    // -- host calls --

    /// Save the low singles of any mapped caller-saved XMMs into the
    /// save band. No-op on Windows (xmm8..xmm11 are callee-saved) and
    /// outside op lowering.
    fn save_xmm_registers(&mut self) {
        if HOST_ABI.windows || self.current_opid == NO_OPID {
            return;
        }
        let mapped: Vec<(i32, Xmm)> = [Xmm::Xmm8, Xmm::Xmm9, Xmm::Xmm10, Xmm::Xmm11]
            .into_iter()
            .enumerate()
            .filter(|(_, x)| self.regalloc.is_mapped_xmm(*x))
            .map(|(i, x)| (i as i32 * 4, x))
            .collect();
        if mapped.is_empty() {
            return;
        }
        self.em.mov_ri(XMM_SAVE_SCRATCH, self.xmm_save_addr);
        for (disp, x) in mapped {
            self.em.movd_store(XMM_SAVE_SCRATCH, disp, x);
        }
    }

    fn restore_xmm_registers(&mut self) {
        if HOST_ABI.windows || self.current_opid == NO_OPID {
            return;
        }
        let mapped: Vec<(i32, Xmm)> = [Xmm::Xmm8, Xmm::Xmm9, Xmm::Xmm10, Xmm::Xmm11]
            .into_iter()
            .enumerate()
            .filter(|(_, x)| self.regalloc.is_mapped_xmm(*x))
            .map(|(i, x)| (i as i32 * 4, x))
            .collect();
        if mapped.is_empty() {
            return;
        }
        self.em.mov_ri(XMM_SAVE_SCRATCH, self.xmm_save_addr);
        for (disp, x) in mapped {
            self.em.movd_load(x, XMM_SAVE_SCRATCH, disp);
        }
    }

    fn gen_call(&mut self, target: *const u8, skip_floats: bool) {
        if !skip_floats {
            self.save_xmm_registers();
        }
        self.em.call_ptr(target);
        if !skip_floats {
            self.restore_xmm_registers();
        }
    }

    // -- specially lowered opcodes --

    fn gen_ifb(&mut self, op: &ShilOpcode, block: &RuntimeBlockInfo) {
        let abi = &HOST_ABI;
        let raw_op = op.rs3.imm_value();
        if self.cfg.mmu_enabled {
            let handler = (self.hooks.op_handler)(raw_op as u16);
            self.em.mov_ri(abi.call_regs[2], handler as u64);
            let pc = block.vaddr + op.guest_offs as u32 - if op.delay_slot { 1 } else { 0 };
            self.em.mov_ri(abi.call_regs[3], pc as u64);
        }

        let set_pc = matches!(op.rs1, ShilParam::Imm(v) if v != 0);
        if set_pc {
            self.em.mov_ri(Reg::Rax, self.ctx.pc_addr());
            self.em.store_imm32(Reg::Rax, 0, op.rs2.imm_value());
        }

        self.em.mov_ri(abi.call_regs[1], raw_op as u64);
        self.em.mov_ri(abi.call_regs[0], self.ctx.addr());

        if !self.cfg.mmu_enabled {
            let handler = (self.hooks.op_handler)(raw_op as u16);
            self.gen_call(handler as *const u8, false);
        } else {
            self.gen_call(interpreter_fallback as *const u8, false);
        }
    }

    fn gen_mov64(&mut self, op: &ShilOpcode) {
        assert!(op.rd.is_r64f());
        assert!(op.rs1.is_r64f());

        let rd_alloc = self.cfg.alloc_f64 && self.regalloc.is_allocf(&op.rd);
        let rs_alloc = self.cfg.alloc_f64 && self.regalloc.is_allocf(&op.rs1);

        if rd_alloc && rs_alloc {
            let rd0 = self.regalloc.map_x_register_half(&op.rd, 0);
            let rs0 = self.regalloc.map_x_register_half(&op.rs1, 0);
            let rd1 = self.regalloc.map_x_register_half(&op.rd, 1);
            let rs1 = self.regalloc.map_x_register_half(&op.rs1, 1);
            if rd0 == rs1 {
                self.em.movss_rr(Xmm::Xmm0, rd0);
                self.em.movss_rr(rd0, rs0);
                self.em.movss_rr(rd1, Xmm::Xmm0);
            } else {
                self.em.movss_rr(rd0, rs0);
                self.em.movss_rr(rd1, rs1);
            }
        } else if rd_alloc {
            let rd0 = self.regalloc.map_x_register_half(&op.rd, 0);
            let rd1 = self.regalloc.map_x_register_half(&op.rd, 1);
            self.em.mov_ri(Reg::Rax, op.rs1.reg_ptr(self.ctx) as u64);
            self.em.movss_load(rd0, Reg::Rax, 0);
            self.em.movss_load(rd1, Reg::Rax, 4);
        } else if rs_alloc {
            let rs0 = self.regalloc.map_x_register_half(&op.rs1, 0);
            let rs1 = self.regalloc.map_x_register_half(&op.rs1, 1);
            self.em.mov_ri(Reg::Rax, op.rd.reg_ptr(self.ctx) as u64);
            self.em.movss_store(Reg::Rax, 0, rs0);
            self.em.movss_store(Reg::Rax, 4, rs1);
        } else {
            self.em.mov_ri(Reg::Rax, op.rs1.reg_ptr(self.ctx) as u64);
            self.em.load(true, Reg::Rax, Reg::Rax, 0);
            self.em.mov_ri(Reg::Rcx, op.rd.reg_ptr(self.ctx) as u64);
            self.em.store(true, Reg::Rax, Reg::Rcx, 0);
        }
    }

    fn gen_readm(&mut self, op: &ShilOpcode, block: &RuntimeBlockInfo, optimise: bool) {
        if self.gen_read_mem_immediate(op) {
            return;
        }
        let abi = &HOST_ABI;

        self.shil_param_to_host_reg(&op.rs1.clone(), abi.call_regs[0]);
        self.gen_addr_displacement(op, abi.call_regs[0]);
        self.gen_mmu_lookup(block, op, 0);

        let size = MemSize::from_bytes(op.size);
        let ty = if optimise { MemType::Fast } else { MemType::Slow };
        let handler = self.mem.get(ty, size, MemOp::R);
        assert!(!handler.is_null(), "memory handlers not generated");
        self.gen_call(handler, self.cfg.mmu_enabled);

        if size == MemSize::S64 {
            self.store_result64(&op.rd.clone());
        } else {
            self.em.mov_rr(true, Reg::Rcx, Reg::Rax);
            self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
        }
    }

    fn gen_writem(&mut self, op: &ShilOpcode, block: &RuntimeBlockInfo, optimise: bool) {
        if self.gen_write_mem_immediate(op) {
            return;
        }
        let abi = &HOST_ABI;

        self.shil_param_to_host_reg(&op.rs1.clone(), abi.call_regs[0]);
        self.gen_addr_displacement(op, abi.call_regs[0]);
        self.gen_mmu_lookup(block, op, 1);

        if op.size == 8 {
            if self.cfg.alloc_f64 && self.regalloc.is_allocf(&op.rs2) {
                let lo = self.regalloc.map_x_register_half(&op.rs2, 0);
                let hi = self.regalloc.map_x_register_half(&op.rs2, 1);
                self.em.movd_rx(abi.call_regs[1], lo);
                self.em.movd_rx(Reg::Rax, hi);
                self.em.shift_ri(ShiftOp::Shl, true, Reg::Rax, 32);
                self.em.arith_rr(ArithOp::Or, true, abi.call_regs[1], Reg::Rax);
            } else {
                self.em.mov_ri(Reg::Rax, op.rs2.reg_ptr(self.ctx) as u64);
                self.em.load(true, abi.call_regs[1], Reg::Rax, 0);
            }
        } else {
            self.shil_param_to_host_reg(&op.rs2.clone(), abi.call_regs[1]);
        }

        let size = MemSize::from_bytes(op.size);
        let ty = if optimise { MemType::Fast } else { MemType::Slow };
        let handler = self.mem.get(ty, size, MemOp::W);
        assert!(!handler.is_null(), "memory handlers not generated");
        self.gen_call(handler, self.cfg.mmu_enabled);
    }

    /// Optional rs3 displacement on a memory access address.
    fn gen_addr_displacement(&mut self, op: &ShilOpcode, addr_reg: Reg) {
        if op.rs3.is_null() {
            return;
        }
        if let ShilParam::Imm(v) = op.rs3 {
            self.em.arith_ri(ArithOp::Add, false, addr_reg, v as i32);
        } else if self.regalloc.is_allocg(&op.rs3) {
            let r = self.regalloc.map_register(&op.rs3);
            self.em.arith_rr(ArithOp::Add, false, addr_reg, r);
        } else {
            self.em.mov_ri(Reg::Rax, op.rs3.reg_ptr(self.ctx) as u64);
            self.em.arith_rm(ArithOp::Add, false, addr_reg, Reg::Rax, 0);
        }
    }

    /// 64-bit read result (in rax) into the destination pair.
    fn store_result64(&mut self, rd: &ShilParam) {
        if self.cfg.alloc_f64 && self.regalloc.is_allocf(rd) {
            let lo = self.regalloc.map_x_register_half(rd, 0);
            let hi = self.regalloc.map_x_register_half(rd, 1);
            self.em.movd_xr(lo, Reg::Rax);
            self.em.mov_rr(true, Reg::Rcx, Reg::Rax);
            self.em.shift_ri(ShiftOp::Shr, true, Reg::Rcx, 32);
            self.em.movd_xr(hi, Reg::Rcx);
        } else {
            self.em.mov_ri(Reg::Rcx, rd.reg_ptr(self.ctx) as u64);
            self.em.store(true, Reg::Rax, Reg::Rcx, 0);
        }
    }

    fn gen_mmu_lookup(&mut self, block: &RuntimeBlockInfo, op: &ShilOpcode, write: u32) {
        if !self.cfg.mmu_enabled {
            return;
        }
        let abi = &HOST_ABI;
        let pc = block.vaddr + op.guest_offs as u32 - if op.delay_slot { 2 } else { 0 };
        let lut = self.hooks.mmu_address_lut;

        if self.cfg.fast_mmu {
            let in_cache = self.em.new_label();
            let done = self.em.new_label();

            self.em.mov_rr(false, Reg::Rax, abi.call_regs[0]);
            self.em.shift_ri(ShiftOp::Shr, false, Reg::Rax, 12);
            if lut as u64 >> 32 != 0 {
                self.em.mov_ri(Reg::R9, lut as u64);
                self.em.load_sib_scale4(Reg::Rax, Reg::R9, Reg::Rax);
            } else {
                self.em.load_abs_index4(Reg::Rax, Reg::Rax, lut as u32);
            }
            self.em.test_rr(false, Reg::Rax, Reg::Rax);
            self.em.jcc_near(Cc::Ne, in_cache);

            self.em.mov_ri(abi.call_regs[1], write as u64);
            self.em.mov_ri(abi.call_regs[2], pc as u64);
            self.gen_call(self.hooks.mmu_lookup as *const u8, false);
            self.em.mov_rr(false, abi.call_regs[0], Reg::Rax);
            self.em.jmp_short(done);

            self.em.bind(in_cache);
            self.em.arith_ri(ArithOp::And, false, abi.call_regs[0], 0xFFF);
            self.em.arith_rr(ArithOp::Or, false, abi.call_regs[0], Reg::Rax);
            self.em.bind(done);
        } else {
            self.em.mov_ri(abi.call_regs[1], write as u64);
            self.em.mov_ri(abi.call_regs[2], pc as u64);
            self.gen_call(self.hooks.mmu_lookup as *const u8, false);
            self.em.mov_rr(false, abi.call_regs[0], Reg::Rax);
        }
    }

    fn gen_read_mem_immediate(&mut self, op: &ShilOpcode) -> bool {
        let ShilParam::Imm(addr) = op.rs1 else {
            return false;
        };
        let Some(mm) = (self.aspace.read_mem_immediate)(addr, op.size as u32) else {
            return false;
        };
        let rd = op.rd.clone();

        if mm.isram {
            // Immediate pointer to RAM: direct access at full width.
            self.em.mov_ri(Reg::Rax, mm.ptr as u64);
            match op.size {
                1 => {
                    if self.regalloc.is_allocg(&rd) {
                        let r = self.regalloc.map_register(&rd);
                        self.em.load_sx8(r, Reg::Rax, 0);
                    } else {
                        self.em.load_sx8(Reg::Rax, Reg::Rax, 0);
                        self.em.mov_ri(Reg::Rcx, rd.reg_ptr(self.ctx) as u64);
                        self.em.store(false, Reg::Rax, Reg::Rcx, 0);
                    }
                }
                2 => {
                    if self.regalloc.is_allocg(&rd) {
                        let r = self.regalloc.map_register(&rd);
                        self.em.load_sx16(r, Reg::Rax, 0);
                    } else {
                        self.em.load_sx16(Reg::Rax, Reg::Rax, 0);
                        self.em.mov_ri(Reg::Rcx, rd.reg_ptr(self.ctx) as u64);
                        self.em.store(false, Reg::Rax, Reg::Rcx, 0);
                    }
                }
                4 => {
                    if self.regalloc.is_allocg(&rd) {
                        let r = self.regalloc.map_register(&rd);
                        self.em.load(false, r, Reg::Rax, 0);
                    } else if self.regalloc.is_allocf(&rd) && !rd.is_r64f() {
                        let x = self.regalloc.map_x_register(&rd);
                        self.em.movd_load(x, Reg::Rax, 0);
                    } else {
                        self.em.load(false, Reg::Rax, Reg::Rax, 0);
                        self.em.mov_ri(Reg::Rcx, rd.reg_ptr(self.ctx) as u64);
                        self.em.store(false, Reg::Rax, Reg::Rcx, 0);
                    }
                }
                8 => {
                    if self.cfg.alloc_f64 && self.regalloc.is_allocf(&rd) {
                        let lo = self.regalloc.map_x_register_half(&rd, 0);
                        let hi = self.regalloc.map_x_register_half(&rd, 1);
                        self.em.movd_load(lo, Reg::Rax, 0);
                        self.em.movd_load(hi, Reg::Rax, 4);
                    } else {
                        self.em.load(true, Reg::Rcx, Reg::Rax, 0);
                        self.em.mov_ri(Reg::Rax, rd.reg_ptr(self.ctx) as u64);
                        self.em.store(true, Reg::Rcx, Reg::Rax, 0);
                    }
                }
                _ => panic!("invalid immediate read size {}", op.size),
            }
        } else {
            // Not RAM: the returned pointer is a 32-bit memory handler.
            let abi = &HOST_ABI;
            if op.size == 8 {
                // 64-bit MMIO: call the handler twice.
                self.em.mov_ri(abi.call_regs[0], mm.addr as u64);
                self.gen_call(mm.ptr, false);
                if self.cfg.alloc_f64 && self.regalloc.is_allocf(&rd) {
                    let lo = self.regalloc.map_x_register_half(&rd, 0);
                    self.em.movd_xr(lo, Reg::Rax);
                } else {
                    self.em.mov_ri(Reg::Rcx, rd.reg_ptr(self.ctx) as u64);
                    self.em.store(false, Reg::Rax, Reg::Rcx, 0);
                }

                self.em.mov_ri(abi.call_regs[0], mm.addr as u64 + 4);
                self.gen_call(mm.ptr, false);
                if self.cfg.alloc_f64 && self.regalloc.is_allocf(&rd) {
                    let hi = self.regalloc.map_x_register_half(&rd, 1);
                    self.em.movd_xr(hi, Reg::Rax);
                } else {
                    self.em
                        .mov_ri(Reg::Rcx, rd.reg_ptr(self.ctx) as u64 + 4);
                    self.em.store(false, Reg::Rax, Reg::Rcx, 0);
                }
            } else {
                self.em.mov_ri(abi.call_regs[0], mm.addr as u64);
                self.gen_call(mm.ptr, false);
                match op.size {
                    1 => self.em.movsx8_rr(Reg::Rax, Reg::Rax),
                    2 => self.em.movsx16_rr(Reg::Rax, Reg::Rax),
                    4 => {}
                    _ => panic!("invalid immediate read size {}", op.size),
                }
                self.em.mov_rr(true, Reg::Rcx, Reg::Rax);
                self.host_reg_to_shil_param(&rd, Reg::Rcx);
            }
        }
        true
    }

    fn gen_write_mem_immediate(&mut self, op: &ShilOpcode) -> bool {
        let ShilParam::Imm(addr) = op.rs1 else {
            return false;
        };
        let Some(mm) = (self.aspace.write_mem_immediate)(addr, op.size as u32) else {
            return false;
        };
        let rs2 = op.rs2.clone();

        if mm.isram {
            self.em.mov_ri(Reg::Rax, mm.ptr as u64);
            match op.size {
                1 => {
                    if self.regalloc.is_allocg(&rs2) {
                        let r = self.regalloc.map_register(&rs2);
                        self.em.store8(r, Reg::Rax, 0);
                    } else if let ShilParam::Imm(v) = rs2 {
                        self.em.store_imm8(Reg::Rax, 0, v as u8);
                    } else {
                        self.em.mov_ri(Reg::Rcx, rs2.reg_ptr(self.ctx) as u64);
                        self.em.load_zx8(Reg::Rcx, Reg::Rcx, 0);
                        self.em.store8(Reg::Rcx, Reg::Rax, 0);
                    }
                }
                2 => {
                    if self.regalloc.is_allocg(&rs2) {
                        let r = self.regalloc.map_register(&rs2);
                        self.em.store16(r, Reg::Rax, 0);
                    } else if let ShilParam::Imm(v) = rs2 {
                        self.em.store_imm16(Reg::Rax, 0, v as u16);
                    } else {
                        self.em.mov_ri(Reg::Rcx, rs2.reg_ptr(self.ctx) as u64);
                        self.em.load_zx16(Reg::Rcx, Reg::Rcx, 0);
                        self.em.store16(Reg::Rcx, Reg::Rax, 0);
                    }
                }
                4 => {
                    if self.regalloc.is_allocg(&rs2) {
                        let r = self.regalloc.map_register(&rs2);
                        self.em.store(false, r, Reg::Rax, 0);
                    } else if self.regalloc.is_allocf(&rs2) && !rs2.is_r64f() {
                        let x = self.regalloc.map_x_register(&rs2);
                        self.em.movd_store(Reg::Rax, 0, x);
                    } else if let ShilParam::Imm(v) = rs2 {
                        self.em.store_imm32(Reg::Rax, 0, v);
                    } else {
                        self.em.mov_ri(Reg::Rcx, rs2.reg_ptr(self.ctx) as u64);
                        self.em.load(false, Reg::Rcx, Reg::Rcx, 0);
                        self.em.store(false, Reg::Rcx, Reg::Rax, 0);
                    }
                }
                8 => {
                    if self.cfg.alloc_f64 && self.regalloc.is_allocf(&rs2) {
                        let lo = self.regalloc.map_x_register_half(&rs2, 0);
                        let hi = self.regalloc.map_x_register_half(&rs2, 1);
                        self.em.movd_store(Reg::Rax, 0, lo);
                        self.em.movd_store(Reg::Rax, 4, hi);
                    } else {
                        self.em.mov_ri(Reg::Rcx, rs2.reg_ptr(self.ctx) as u64);
                        self.em.load(true, Reg::Rcx, Reg::Rcx, 0);
                        self.em.store(true, Reg::Rcx, Reg::Rax, 0);
                    }
                }
                _ => panic!("invalid immediate write size {}", op.size),
            }
        } else {
            let abi = &HOST_ABI;
            self.em.mov_ri(abi.call_regs[0], mm.addr as u64);
            self.shil_param_to_host_reg(&rs2, abi.call_regs[1]);
            self.gen_call(mm.ptr, false);
        }
        true
    }

    fn gen_negc(&mut self, op: &ShilOpcode) {
        // rd = -rs1 - rs2 in 64-bit arithmetic; rd2 = borrow (bit 63).
        let mut rs2_reg: Option<Reg> = None;
        if op.rs2.is_reg() {
            let r = if self.regalloc.is_allocg(&op.rs2) {
                let m = self.regalloc.map_register(&op.rs2);
                if self.regalloc.mapg(&op.rd) == Some(m) {
                    self.em.mov_rr(false, Reg::Rcx, m);
                    Reg::Rcx
                } else {
                    m
                }
            } else {
                self.em.mov_ri(Reg::Rax, op.rs2.reg_ptr(self.ctx) as u64);
                self.em.load(false, Reg::Rcx, Reg::Rax, 0);
                Reg::Rcx
            };
            rs2_reg = Some(r);
        }

        let (rd, spill) = self.dest_gpr(&op.rd);
        if let ShilParam::Imm(v) = op.rs1 {
            self.em.mov_ri(rd, v as u64);
        } else if self.regalloc.mapg(&op.rd) != self.regalloc.mapg(&op.rs1)
            || self.regalloc.mapg(&op.rd).is_none()
        {
            self.shil_param_to_host_reg(&op.rs1.clone(), rd);
        }
        self.em.neg(true, rd);
        if let ShilParam::Imm(v) = op.rs2 {
            self.em.arith_ri(ArithOp::Sub, true, rd, v as i32);
        } else {
            self.em.arith_rr(ArithOp::Sub, true, rd, rs2_reg.unwrap());
        }

        let (rd2, spill2) = match self.regalloc.mapg(&op.rd2) {
            Some(r) => (r, false),
            None => (Reg::Rcx, true),
        };
        self.em.mov_rr(true, rd2, rd);
        self.em.shift_ri(ShiftOp::Shr, true, rd2, 63);
        self.store_dest_gpr(&op.rd2.clone(), rd2, spill2);
        self.store_dest_gpr(&op.rd.clone(), rd, spill);
    }

    fn gen_mul_s64(&mut self, op: &ShilOpcode) {
        // Sign-extend both operands, 64-bit multiply; low half to rd,
        // high half to rd2.
        if self.regalloc.is_allocg(&op.rs1) {
            let r = self.regalloc.map_register(&op.rs1);
            self.em.movsxd(Reg::Rax, r);
        } else if let ShilParam::Imm(v) = op.rs1 {
            self.em.mov_ri(Reg::Rax, v as i32 as i64 as u64);
        } else {
            self.em.mov_ri(Reg::Rax, op.rs1.reg_ptr(self.ctx) as u64);
            self.em.load(false, Reg::Rax, Reg::Rax, 0);
            self.em.movsxd(Reg::Rax, Reg::Rax);
        }
        if self.regalloc.is_allocg(&op.rs2) {
            let r = self.regalloc.map_register(&op.rs2);
            self.em.movsxd(Reg::Rcx, r);
        } else if let ShilParam::Imm(v) = op.rs2 {
            self.em.mov_ri(Reg::Rcx, v as i32 as i64 as u64);
        } else {
            self.em.mov_ri(Reg::Rcx, op.rs2.reg_ptr(self.ctx) as u64);
            self.em.load(false, Reg::Rcx, Reg::Rcx, 0);
            self.em.movsxd(Reg::Rcx, Reg::Rcx);
        }
        self.em.mul(true, Reg::Rcx);

        if self.regalloc.is_allocg(&op.rd) {
            let r = self.regalloc.map_register(&op.rd);
            self.em.mov_rr(false, r, Reg::Rax);
        } else {
            self.em.mov_ri(Reg::Rcx, op.rd.reg_ptr(self.ctx) as u64);
            self.em.store(false, Reg::Rax, Reg::Rcx, 0);
        }
        self.em.shift_ri(ShiftOp::Shr, true, Reg::Rax, 32);
        if self.regalloc.is_allocg(&op.rd2) {
            let r = self.regalloc.map_register(&op.rd2);
            self.em.mov_rr(false, r, Reg::Rax);
        } else {
            self.em.mov_ri(Reg::Rcx, op.rd2.reg_ptr(self.ctx) as u64);
            self.em.store(false, Reg::Rax, Reg::Rcx, 0);
        }
    }

    fn gen_pref(&mut self, op: &ShilOpcode, block: &RuntimeBlockInfo) {
        let abi = &HOST_ABI;
        let no_sqw = self.em.new_label();

        match op.rs1 {
            ShilParam::Imm(v) => {
                // this test shouldn't be necessary
                if v & 0xFC00_0000 != 0xE000_0000 {
                    return;
                }
                self.em.mov_ri(abi.call_regs[0], v as u64);
            }
            _ => {
                let rn = if self.regalloc.is_allocg(&op.rs1) {
                    self.regalloc.map_register(&op.rs1)
                } else {
                    self.em.mov_ri(Reg::Rax, op.rs1.reg_ptr(self.ctx) as u64);
                    self.em.load(false, Reg::Rax, Reg::Rax, 0);
                    Reg::Rax
                };
                self.em.mov_rr(false, Reg::Rcx, rn);
                self.em.shift_ri(ShiftOp::Shr, false, Reg::Rcx, 26);
                self.em.arith_ri(ArithOp::Cmp, false, Reg::Rcx, 0x38);
                self.em.jcc_near(Cc::Ne, no_sqw);
                self.em.mov_rr(false, abi.call_regs[0], rn);
            }
        }

        self.em.mov_ri(abi.call_regs[1], self.ctx.addr());
        if self.cfg.mmu_enabled {
            let pc = block.vaddr + op.guest_offs as u32 - if op.delay_slot { 1 } else { 0 };
            self.em.mov_ri(abi.call_regs[2], pc as u64);
            self.gen_call(do_sqw_mmu_no_ex as *const u8, false);
        } else {
            self.em.mov_ri(Reg::Rax, self.ctx.do_sq_write_slot_addr());
            self.save_xmm_registers();
            self.em.call_mem(Reg::Rax, 0);
            self.restore_xmm_registers();
        }
        self.em.bind(no_sqw);
    }

    fn gen_frswap(&mut self, op: &ShilOpcode) {
        // Exchange the two 64-byte floating banks.
        self.em.mov_ri(Reg::Rax, op.rs1.reg_ptr(self.ctx) as u64);
        self.em.mov_ri(Reg::Rcx, op.rd.reg_ptr(self.ctx) as u64);
        if self.features.avx512f {
            self.em.vmovaps512_load(Xmm::Xmm0, Reg::Rax);
            self.em.vmovaps512_load(Xmm::Xmm1, Reg::Rcx);
            self.em.vmovaps512_store(Reg::Rax, Xmm::Xmm1);
            self.em.vmovaps512_store(Reg::Rcx, Xmm::Xmm0);
        } else if self.features.avx {
            self.em.vmovaps256_load(Xmm::Xmm0, Reg::Rax, 0);
            self.em.vmovaps256_load(Xmm::Xmm1, Reg::Rcx, 0);
            self.em.vmovaps256_store(Reg::Rax, 0, Xmm::Xmm1);
            self.em.vmovaps256_store(Reg::Rcx, 0, Xmm::Xmm0);

            self.em.vmovaps256_load(Xmm::Xmm0, Reg::Rax, 32);
            self.em.vmovaps256_load(Xmm::Xmm1, Reg::Rcx, 32);
            self.em.vmovaps256_store(Reg::Rax, 32, Xmm::Xmm1);
            self.em.vmovaps256_store(Reg::Rcx, 32, Xmm::Xmm0);
        } else {
            for i in 0..4 {
                let disp = i * 16;
                self.em.movaps_load(Xmm::Xmm0, Reg::Rax, disp);
                self.em.movaps_load(Xmm::Xmm1, Reg::Rcx, disp);
                self.em.movaps_store(Reg::Rax, disp, Xmm::Xmm1);
                self.em.movaps_store(Reg::Rcx, disp, Xmm::Xmm0);
            }
        }
    }

    fn gen_fmac(&mut self, op: &ShilOpcode) {
        // rd = rs1 + rs2 * rs3, rd seeded from rs1.
        let (rd, spill) = self.dest_xmm(&op.rd, Xmm::Xmm3);
        let mut rs2 = self.param_to_xmm(&op.rs2.clone(), Xmm::Xmm1);
        if rs2 == rd {
            self.em.movss_rr(Xmm::Xmm1, rs2);
            rs2 = Xmm::Xmm1;
        }
        let mut rs3 = self.param_to_xmm(&op.rs3.clone(), Xmm::Xmm2);
        if rs3 == rd {
            self.em.movss_rr(Xmm::Xmm2, rs3);
            rs3 = Xmm::Xmm2;
        }

        match op.rs1 {
            ShilParam::Imm(v) => {
                self.em.mov_ri(Reg::Rax, v as u64);
                self.em.movd_xr(rd, Reg::Rax);
            }
            _ => {
                if self.regalloc.is_allocf(&op.rs1) && !op.rs1.is_r64f() {
                    let rs1 = self.regalloc.map_x_register(&op.rs1);
                    self.em.movss_rr(rd, rs1);
                } else {
                    self.em.mov_ri(Reg::Rax, op.rs1.reg_ptr(self.ctx) as u64);
                    self.em.movss_load(rd, Reg::Rax, 0);
                }
            }
        }

        if self.features.fma && !self.cfg.avoid_fma {
            self.em.vfmadd231ss(rd, rs2, rs3);
        } else {
            self.em.movss_rr(Xmm::Xmm0, rs2);
            self.em.mulss(Xmm::Xmm0, rs3);
            self.em.addss(rd, Xmm::Xmm0);
        }
        self.store_dest_xmm(&op.rd.clone(), rd, spill);
    }

    // -- base opcode generator --

    /// Shared lowering for the common ALU/FPU opcodes. Returns false
    /// when the op needs the canonical-call fallback.
    fn gen_base_opcode(&mut self, op: &ShilOpcode) -> bool {
        match op.op {
            ShilOp::Mov32 => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Jdyn => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                if let ShilParam::Imm(v) = op.rs2 {
                    self.em.arith_ri(ArithOp::Add, false, Reg::Rcx, v as i32);
                }
                self.em.mov_ri(Reg::Rax, self.ctx.jdyn_addr());
                self.em.store(false, Reg::Rcx, Reg::Rax, 0);
            }
            ShilOp::Jcond => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.em.mov_ri(Reg::Rax, self.ctx.jdyn_addr());
                self.em.store(false, Reg::Rcx, Reg::Rax, 0);
            }
            ShilOp::Add | ShilOp::Sub | ShilOp::And | ShilOp::Or | ShilOp::Xor => {
                let aop = match op.op {
                    ShilOp::Add => ArithOp::Add,
                    ShilOp::Sub => ArithOp::Sub,
                    ShilOp::And => ArithOp::And,
                    ShilOp::Or => ArithOp::Or,
                    _ => ArithOp::Xor,
                };
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.gen_arith_rhs(aop, &op.rs2.clone(), Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Neg => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.em.neg(false, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Not => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.em.not(false, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Shl | ShilOp::Shr | ShilOp::Sar | ShilOp::Ror => {
                let sop = match op.op {
                    ShilOp::Shl => ShiftOp::Shl,
                    ShilOp::Shr => ShiftOp::Shr,
                    ShilOp::Sar => ShiftOp::Sar,
                    _ => ShiftOp::Ror,
                };
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rdx);
                if let ShilParam::Imm(v) = op.rs2 {
                    self.em.shift_ri(sop, false, Reg::Rdx, v as u8);
                } else {
                    self.shil_param_to_host_reg(&op.rs2.clone(), Reg::Rcx);
                    self.em.shift_cl(sop, false, Reg::Rdx);
                }
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rdx);
            }
            ShilOp::Adc => {
                // 64-bit chain of zero-extended operands; carry in bit 32.
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rdx);
                self.shil_param_to_host_reg(&op.rs2.clone(), Reg::Rcx);
                self.em.arith_rr(ArithOp::Add, true, Reg::Rdx, Reg::Rcx);
                self.shil_param_to_host_reg(&op.rs3.clone(), Reg::Rcx);
                self.em.arith_rr(ArithOp::Add, true, Reg::Rdx, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rdx);
                self.em.shift_ri(ShiftOp::Shr, true, Reg::Rdx, 32);
                self.host_reg_to_shil_param(&op.rd2.clone(), Reg::Rdx);
            }
            ShilOp::Sbc => {
                // Borrow surfaces as the 64-bit sign bit.
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rdx);
                self.shil_param_to_host_reg(&op.rs2.clone(), Reg::Rcx);
                self.em.arith_rr(ArithOp::Sub, true, Reg::Rdx, Reg::Rcx);
                self.shil_param_to_host_reg(&op.rs3.clone(), Reg::Rcx);
                self.em.arith_rr(ArithOp::Sub, true, Reg::Rdx, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rdx);
                self.em.shift_ri(ShiftOp::Shr, true, Reg::Rdx, 63);
                self.host_reg_to_shil_param(&op.rd2.clone(), Reg::Rdx);
            }
            ShilOp::ExtS8 => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.em.movsx8_rr(Reg::Rcx, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::ExtS16 => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.em.movsx16_rr(Reg::Rcx, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::MulU16 => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.em.movzx16_rr(Reg::Rcx, Reg::Rcx);
                self.shil_param_to_host_reg(&op.rs2.clone(), Reg::Rdx);
                self.em.movzx16_rr(Reg::Rdx, Reg::Rdx);
                self.em.imul_rr(false, Reg::Rcx, Reg::Rdx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::MulS16 => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.em.movsx16_rr(Reg::Rcx, Reg::Rcx);
                self.shil_param_to_host_reg(&op.rs2.clone(), Reg::Rdx);
                self.em.movsx16_rr(Reg::Rdx, Reg::Rdx);
                self.em.imul_rr(false, Reg::Rcx, Reg::Rdx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::MulI32 => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.shil_param_to_host_reg(&op.rs2.clone(), Reg::Rdx);
                self.em.imul_rr(false, Reg::Rcx, Reg::Rdx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Test => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.gen_arith_rhs(ArithOp::And, &op.rs2.clone(), Reg::Rcx);
                self.em.setcc(Cc::E, Reg::Rcx);
                self.em.movzx8_rr(Reg::Rcx, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Seteq | ShilOp::Setge | ShilOp::Setgt | ShilOp::Setae | ShilOp::Setab => {
                let cc = match op.op {
                    ShilOp::Seteq => Cc::E,
                    ShilOp::Setge => Cc::Ge,
                    ShilOp::Setgt => Cc::G,
                    ShilOp::Setae => Cc::Ae,
                    _ => Cc::A,
                };
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.gen_arith_rhs(ArithOp::Cmp, &op.rs2.clone(), Reg::Rcx);
                self.em.setcc(cc, Reg::Rcx);
                self.em.movzx8_rr(Reg::Rcx, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Fadd | ShilOp::Fsub | ShilOp::Fmul | ShilOp::Fdiv => {
                let src = self.param_to_xmm_copy(&op.rs2.clone(), Xmm::Xmm1);
                let (d, spill) = self.dest_xmm(&op.rd, Xmm::Xmm0);
                self.load_xmm_from_param(&op.rs1.clone(), d);
                match op.op {
                    ShilOp::Fadd => self.em.addss(d, src),
                    ShilOp::Fsub => self.em.subss(d, src),
                    ShilOp::Fmul => self.em.mulss(d, src),
                    _ => self.em.divss(d, src),
                }
                self.store_dest_xmm(&op.rd.clone(), d, spill);
            }
            ShilOp::Fabs => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.em.arith_ri(ArithOp::And, false, Reg::Rcx, 0x7FFF_FFFF);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Fneg => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                self.em
                    .arith_ri(ArithOp::Xor, false, Reg::Rcx, 0x8000_0000u32 as i32);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Fsqrt => {
                let src = self.param_to_xmm(&op.rs1.clone(), Xmm::Xmm1);
                let (d, spill) = self.dest_xmm(&op.rd, Xmm::Xmm0);
                self.em.sqrtss(d, src);
                self.store_dest_xmm(&op.rd.clone(), d, spill);
            }
            ShilOp::Fseteq => {
                let a = self.param_to_xmm(&op.rs1.clone(), Xmm::Xmm0);
                let b = self.param_to_xmm(&op.rs2.clone(), Xmm::Xmm1);
                self.em.comiss(a, b);
                // Unordered sets ZF and PF; mask the NaN case out.
                self.em.setcc(Cc::E, Reg::Rcx);
                self.em.setcc(Cc::Np, Reg::Rdx);
                self.em.arith_rr(ArithOp::And, false, Reg::Rcx, Reg::Rdx);
                self.em.movzx8_rr(Reg::Rcx, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::Fsetgt => {
                let a = self.param_to_xmm(&op.rs1.clone(), Xmm::Xmm0);
                let b = self.param_to_xmm(&op.rs2.clone(), Xmm::Xmm1);
                self.em.comiss(a, b);
                self.em.setcc(Cc::A, Reg::Rcx);
                self.em.movzx8_rr(Reg::Rcx, Reg::Rcx);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::CvtF2iT => {
                let src = self.param_to_xmm(&op.rs1.clone(), Xmm::Xmm0);
                self.em.cvttss2si(Reg::Rcx, src);
                // Positive overflow saturates to 0x7FFFFFFF on SH-4.
                let done = self.em.new_label();
                self.em
                    .arith_ri(ArithOp::Cmp, false, Reg::Rcx, 0x8000_0000u32 as i32);
                self.em.jcc_short(Cc::Ne, done);
                self.em.movd_rx(Reg::Rax, src);
                self.em.test_rr(false, Reg::Rax, Reg::Rax);
                self.em.jcc_short(Cc::S, done);
                self.em.mov_ri(Reg::Rcx, 0x7FFF_FFFF);
                self.em.bind(done);
                self.host_reg_to_shil_param(&op.rd.clone(), Reg::Rcx);
            }
            ShilOp::CvtI2f => {
                self.shil_param_to_host_reg(&op.rs1.clone(), Reg::Rcx);
                let (d, spill) = self.dest_xmm(&op.rd, Xmm::Xmm0);
                self.em.cvtsi2ss(d, Reg::Rcx);
                self.store_dest_xmm(&op.rd.clone(), d, spill);
            }
            _ => return false,
        }
        true
    }

    /// Apply `op rhs` to an accumulator register, picking the imm /
    /// mapped-reg / memory form.
    fn gen_arith_rhs(&mut self, aop: ArithOp, rhs: &ShilParam, acc: Reg) {
        if let ShilParam::Imm(v) = rhs {
            self.em.arith_ri(aop, false, acc, *v as i32);
        } else if self.regalloc.is_allocg(rhs) {
            let r = self.regalloc.map_register(rhs);
            self.em.arith_rr(aop, false, acc, r);
        } else {
            self.em.mov_ri(Reg::Rax, rhs.reg_ptr(self.ctx) as u64);
            self.em.arith_rm(aop, false, acc, Reg::Rax, 0);
        }
    }

    /// Seed a destination XMM from a parameter (imm via GPR, mapped via
    /// movss, memory via address scratch).
    fn load_xmm_from_param(&mut self, prm: &ShilParam, d: Xmm) {
        match prm {
            ShilParam::Imm(v) => {
                self.em.mov_ri(Reg::Rax, *v as u64);
                self.em.movd_xr(d, Reg::Rax);
            }
            _ if self.regalloc.is_allocf(prm) && !prm.is_r64f() => {
                let src = self.regalloc.map_x_register(prm);
                self.em.movss_rr(d, src);
            }
            ShilParam::Reg(_) => {
                self.em.mov_ri(Reg::Rax, prm.reg_ptr(self.ctx) as u64);
                self.em.movss_load(d, Reg::Rax, 0);
            }
            _ => panic!("cannot load float param {prm:?}"),
        }
    }

    // -- block-end resolution --

    fn gen_block_end(&mut self, block: &RuntimeBlockInfo) {
        use sh4_core::BlockEndType::*;
        let abi = &HOST_ABI;

        self.em.mov_ri(Reg::Rax, self.ctx.pc_addr());
        match block.end {
            StaticJump | StaticCall => {
                self.em.store_imm32(Reg::Rax, 0, block.branch_block);
            }
            Cond0 | Cond1 => {
                self.em.store_imm32(Reg::Rax, 0, block.next_block);
                if block.has_jcond {
                    self.em.mov_ri(Reg::Rdx, self.ctx.jdyn_addr());
                } else {
                    self.em.mov_ri(Reg::Rdx, self.ctx.sr_t_addr());
                }
                self.em
                    .arith_mi32(ArithOp::Cmp, Reg::Rdx, 0, block.end.cond_bit());
                let branch_not_taken = self.em.new_label();
                self.em.jcc_short(Cc::Ne, branch_not_taken);
                self.em.store_imm32(Reg::Rax, 0, block.branch_block);
                self.em.bind(branch_not_taken);
            }
            DynamicJump | DynamicCall | DynamicRet => {
                self.em.mov_ri(Reg::Rdx, self.ctx.jdyn_addr());
                self.em.load(false, Reg::Rdx, Reg::Rdx, 0);
                self.em.store(false, Reg::Rdx, Reg::Rax, 0);
            }
            StaticIntr | DynamicIntr => {
                if block.end == DynamicIntr {
                    self.em.mov_ri(Reg::Rdx, self.ctx.jdyn_addr());
                    self.em.load(false, Reg::Rdx, Reg::Rdx, 0);
                    self.em.store(false, Reg::Rdx, Reg::Rax, 0);
                } else {
                    self.em.store_imm32(Reg::Rax, 0, block.next_block);
                }
                self.em.mov_ri(abi.call_regs[0], self.ctx.addr());
                self.gen_call(self.hooks.update_intc as *const u8, false);
            }
        }
    }

    // -- canonical parameter protocol --

    pub fn canon_start(&mut self, _op: &ShilOpcode) {
        self.cc_pars.clear();
    }

    pub fn canon_param(&mut self, _op: &ShilOpcode, prm: &ShilParam, tp: CanonicalParamType) {
        match tp {
            CanonicalParamType::U32
            | CanonicalParamType::Ptr
            | CanonicalParamType::F32
            | CanonicalParamType::Sh4Ctx => {
                self.cc_pars.push((tp, *prm));
            }
            // store from rax
            CanonicalParamType::U64RvL | CanonicalParamType::U32Rv => {
                self.em.mov_rr(true, Reg::Rcx, Reg::Rax);
                self.host_reg_to_shil_param(prm, Reg::Rcx);
            }
            CanonicalParamType::U64RvH => {
                // assuming U64RvL has just run, rcx still holds the value
                self.em.shift_ri(ShiftOp::Shr, true, Reg::Rcx, 32);
                self.host_reg_to_shil_param(prm, Reg::Rcx);
            }
            // store from xmm0
            CanonicalParamType::F32Rv => {
                self.host_xmm_to_shil_param(prm, Xmm::Xmm0);
            }
        }
    }

    pub fn canon_call(&mut self, op: &ShilOpcode, function: *const u8) {
        let abi = &HOST_ABI;
        let mut regused = 0usize;
        let mut xmmused = 0usize;
        let pars = self.cc_pars.clone();

        // Reverse emission: the last declared parameter lands in the
        // first argument register.
        for (tp, prm) in pars.iter().rev() {
            assert!(xmmused < 4 && regused < 4);
            match tp {
                CanonicalParamType::U32 => {
                    self.shil_param_to_host_reg(prm, abi.call_regs[regused]);
                    regused += 1;
                }
                CanonicalParamType::F32 => {
                    self.load_xmm_from_param(prm, abi.call_regs_xmm[xmmused]);
                    xmmused += 1;
                }
                CanonicalParamType::Ptr => {
                    assert!(prm.is_reg());
                    self.em
                        .mov_ri(abi.call_regs[regused], prm.reg_ptr(self.ctx) as u64);
                    regused += 1;
                }
                CanonicalParamType::Sh4Ctx => {
                    self.em.mov_ri(abi.call_regs[regused], self.ctx.addr());
                    regused += 1;
                }
                _ => {
                    // return values are handled in canon_param
                }
            }
        }
        self.gen_call(function, false);

        if self.cfg.alloc_f64 {
            for (tp, prm) in pars {
                if tp == CanonicalParamType::Ptr
                    && prm.is_r64f()
                    && self.regalloc.is_allocf(&prm)
                    && (op.rd == prm || op.rd2 == prm)
                {
                    // The callee wrote the pair through the pointer, so
                    // the allocated copies must be reloaded.
                    let lo = self.regalloc.map_x_register_half(&prm, 0);
                    let hi = self.regalloc.map_x_register_half(&prm, 1);
                    self.em.mov_ri(Reg::Rax, prm.reg_ptr(self.ctx) as u64);
                    self.em.movss_load(lo, Reg::Rax, 0);
                    self.em.movss_load(hi, Reg::Rax, 4);
                }
            }
        }
    }

    pub fn canon_finish(&mut self, _op: &ShilOpcode) {}

    /// Canonical lowering table for ops without a native lowering.
    fn canon_fallback(&mut self, op: &ShilOpcode) {
        self.canon_start(op);
        match op.op {
            ShilOp::Fsrra => {
                self.canon_param(op, &op.rs1.clone(), CanonicalParamType::F32);
                self.canon_call(op, fsrra_impl as *const u8);
                self.canon_param(op, &op.rd.clone(), CanonicalParamType::F32Rv);
            }
            ShilOp::Fsca => {
                // Reverse emission puts the destination pointer in arg0.
                self.canon_param(op, &op.rs1.clone(), CanonicalParamType::U32);
                self.canon_param(op, &op.rd.clone(), CanonicalParamType::Ptr);
                self.canon_call(op, fsca_impl as *const u8);
            }
            ShilOp::MulU64 => {
                self.canon_param(op, &op.rs2.clone(), CanonicalParamType::U32);
                self.canon_param(op, &op.rs1.clone(), CanonicalParamType::U32);
                self.canon_call(op, mul_u64_impl as *const u8);
                self.canon_param(op, &op.rd.clone(), CanonicalParamType::U64RvL);
                self.canon_param(op, &op.rd2.clone(), CanonicalParamType::U64RvH);
            }
            ShilOp::Shad => {
                self.canon_param(op, &op.rs2.clone(), CanonicalParamType::U32);
                self.canon_param(op, &op.rs1.clone(), CanonicalParamType::U32);
                self.canon_call(op, shad_impl as *const u8);
                self.canon_param(op, &op.rd.clone(), CanonicalParamType::U32Rv);
            }
            ShilOp::Shld => {
                self.canon_param(op, &op.rs2.clone(), CanonicalParamType::U32);
                self.canon_param(op, &op.rs1.clone(), CanonicalParamType::U32);
                self.canon_call(op, shld_impl as *const u8);
                self.canon_param(op, &op.rd.clone(), CanonicalParamType::U32Rv);
            }
            _ => panic!("no lowering for {:?}", op.op),
        }
        self.canon_finish(op);
    }
}

// -- recompiler glue reached from generated code --

/// Route a staged guest exception through the host exception entry and
/// long-jump back to the dispatch loop. Never returns; the generated
/// trampoline resets the stack pointer captured at dispatch entry.
fn handle_sh4_exception(ctx: &mut Sh4Context, mut ex: Sh4ThrownException, mut pc: u32) -> ! {
    if pc & 1 != 0 {
        // Delay slot
        ex.adjust_delay_slot();
        pc -= 1;
    }
    (ctx.do_exception.expect("do_exception hook not set"))(pc, ex.evn);
    ctx.cycle_counter += 4; // probably more is needed
    assert!(
        !ctx.handle_exception.is_null(),
        "exception trampoline not generated"
    );
    let trampoline: extern "C" fn() -> ! =
        unsafe { std::mem::transmute(ctx.handle_exception) };
    trampoline()
}

/// Interpreter fallback wrapper used when the MMU is on: runs the op
/// handler and diverts any staged guest exception.
pub extern "C" fn interpreter_fallback(ctx: *mut Sh4Context, op: u32, oph: OpCallFp, pc: u32) {
    oph(ctx, op as u16);
    // SAFETY: generated code passes the bound context.
    let ctx_ref = unsafe { &mut *ctx };
    if let Some(ex) = ctx_ref.take_pending_exception() {
        handle_sh4_exception(ctx_ref, ex, pc);
    }
}

/// Store-queue write under MMU; exceptions from the TLB walk divert
/// like interpreter faults.
pub extern "C" fn do_sqw_mmu_no_ex(addr: u32, ctx: *mut Sh4Context, pc: u32) {
    // SAFETY: generated code passes the bound context.
    let sqw = unsafe { (*ctx).do_sq_write.expect("doSqWrite not set") };
    sqw(addr, ctx);
    let ctx_ref = unsafe { &mut *ctx };
    if let Some(ex) = ctx_ref.take_pending_exception() {
        handle_sh4_exception(ctx_ref, ex, pc);
    }
}

// -- canonical host implementations --

extern "C" fn fsrra_impl(x: f32) -> f32 {
    1.0 / x.sqrt()
}

extern "C" fn fsca_impl(dst: *mut f32, angle: u32) {
    let rads = (angle & 0xFFFF) as f32 / 65536.0 * 2.0 * std::f32::consts::PI;
    // SAFETY: dst points at a 64-bit register pair in the context.
    unsafe {
        dst.write(rads.sin());
        dst.add(1).write(rads.cos());
    }
}

extern "C" fn mul_u64_impl(a: u32, b: u32) -> u64 {
    a as u64 * b as u64
}

extern "C" fn shad_impl(v: u32, sh: u32) -> u32 {
    if sh & 0x8000_0000 == 0 {
        v << (sh & 0x1F)
    } else if sh & 0x1F == 0 {
        ((v as i32) >> 31) as u32
    } else {
        ((v as i32) >> ((!sh & 0x1F) + 1)) as u32
    }
}

extern "C" fn shld_impl(v: u32, sh: u32) -> u32 {
    if sh & 0x8000_0000 == 0 {
        v << (sh & 0x1F)
    } else if sh & 0x1F == 0 {
        0
    } else {
        v >> ((!sh & 0x1F) + 1)
    }
}
