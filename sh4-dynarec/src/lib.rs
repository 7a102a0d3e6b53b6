//! x86-64 dynamic recompiler backend for an SH-4 core.
//!
//! Translates decoded SH-4 blocks into native code, links them under a
//! time-sliced dispatch loop, and services faults from speculative
//! fast-path memory accesses by rewriting the emitted call sites.
//!
//! The embedder owns guest memory, the interpreter and the MMU; this
//! crate reaches them through the contracts in `sh4-core`. Everything
//! process-wide in the reference implementation (mainloop entry,
//! exception trampoline, jmp_rsp, the handler grid, the XMM save band)
//! lives on the [`X64Dynarec`] instance here.

pub mod code_buffer;
pub mod compiler;
pub mod mainloop;
pub mod mem_handlers;
pub mod regalloc;
pub mod rewriter;
pub mod unwind;
pub mod x86_64;

use std::cell::UnsafeCell;

use code_buffer::CodeBuffer;
use mainloop::gen_mainloop;
use mem_handlers::MemHandlerTable;
use rewriter::rewrite_mem_access;
use sh4_core::{AddrSpace, HostOps, RuntimeBlockInfo, Sh4Context};
use thiserror::Error;
use unwind::UnwindPublisher;
use x86_64::emitter::EmitError;

pub use compiler::{BlockCompiler, CanonicalParamType, CpuFeatures};
pub use rewriter::HostContext;

/// Recompiler configuration, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct RecConfig {
    pub mmu_enabled: bool,
    /// Inline the page-LUT fast path before calling the MMU miss
    /// handler.
    pub fast_mmu: bool,
    /// Allocate 64-bit floating pairs in XMM halves.
    pub alloc_f64: bool,
    /// Rollback-sensitive mode: keep fmac bit-exact across hosts by
    /// avoiding the fused form.
    pub avoid_fma: bool,
}

impl Default for RecConfig {
    fn default() -> Self {
        Self {
            mmu_enabled: false,
            fast_mmu: true,
            alloc_f64: true,
            avoid_fma: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecError {
    #[error("recompiler not initialized")]
    NotInitialized,
    #[error("emitter overflow, block abandoned")]
    EmitOverflow,
    #[error("unresolved label in generated code")]
    UnboundLabel,
    #[error("unhandled guest exception {0:#x}")]
    UnhandledGuestException(u32),
    #[error(transparent)]
    Os(#[from] std::io::Error),
}

impl From<EmitError> for RecError {
    fn from(e: EmitError) -> Self {
        match e {
            EmitError::Overflow => RecError::EmitOverflow,
            EmitError::UnboundLabel => RecError::UnboundLabel,
        }
    }
}

/// The recompiler surface consumed by the surrounding emulator.
pub trait Sh4Dynarec {
    /// Bind context and buffer; must precede all other operations.
    fn init(&mut self, ctx: *mut Sh4Context, code_buffer: CodeBuffer);
    /// (Re)generate the mainloop and handler grid unless a valid one
    /// already exists at the buffer cursor.
    fn reset(&mut self) -> Result<(), RecError>;
    /// Lower one block; populates `block.code` and
    /// `block.host_code_size` and advances the buffer cursor.
    fn compile(
        &mut self,
        block: &mut RuntimeBlockInfo,
        smc_checks: bool,
        optimise: bool,
    ) -> Result<(), RecError>;
    /// Enter the dispatch trampoline; returns when CpuRunning drops.
    fn mainloop(&mut self) -> Result<(), RecError>;
    /// Patch a faulted fast-path site; true means execution may resume.
    fn rewrite(&mut self, context: &mut HostContext, fault_addr: usize) -> bool;
    /// Redirect the host pc to the exception long-jump trampoline.
    fn handle_exception(&self, context: &mut HostContext);
}

/// Cells mutated by generated code; boxed so their addresses stay put.
struct JitCells {
    jmp_rsp: UnsafeCell<u64>,
    xmm_save: UnsafeCell<[f32; 4]>,
}

pub struct X64Dynarec {
    hooks: HostOps,
    aspace: AddrSpace,
    cfg: RecConfig,
    ctx: *mut Sh4Context,
    buf: Option<CodeBuffer>,
    cells: Box<JitCells>,
    unwinder: UnwindPublisher,
    mem: MemHandlerTable,
    mainloop_entry: *const u8,
    handle_exception_ptr: *const u8,
}

impl X64Dynarec {
    pub fn new(hooks: HostOps, aspace: AddrSpace, cfg: RecConfig) -> Self {
        Self {
            hooks,
            aspace,
            cfg,
            ctx: std::ptr::null_mut(),
            buf: None,
            cells: Box::new(JitCells {
                jmp_rsp: UnsafeCell::new(0),
                xmm_save: UnsafeCell::new([0.0; 4]),
            }),
            unwinder: UnwindPublisher::new(),
            mem: MemHandlerTable::empty(),
            mainloop_entry: std::ptr::null(),
            handle_exception_ptr: std::ptr::null(),
        }
    }

    pub fn mem_handlers(&self) -> &MemHandlerTable {
        &self.mem
    }

    pub fn mainloop_entry(&self) -> *const u8 {
        self.mainloop_entry
    }

    pub fn handle_exception_entry(&self) -> *const u8 {
        self.handle_exception_ptr
    }

    pub fn code_buffer(&self) -> Option<&CodeBuffer> {
        self.buf.as_ref()
    }

    pub fn unwinder(&self) -> &UnwindPublisher {
        &self.unwinder
    }
}

impl Sh4Dynarec for X64Dynarec {
    fn init(&mut self, ctx: *mut Sh4Context, code_buffer: CodeBuffer) {
        self.ctx = ctx;
        self.buf = Some(code_buffer);
    }

    fn reset(&mut self) -> Result<(), RecError> {
        self.unwinder.clear();
        let buf = self.buf.as_mut().ok_or(RecError::NotInitialized)?;
        // Avoid generating the main loop more than once.
        if !self.mainloop_entry.is_null() && self.mainloop_entry != buf.current_ptr() {
            return Ok(());
        }

        let _scope = buf.write_scope()?;
        // SAFETY: init bound a live context; only its field addresses
        // are taken here.
        let ctx = unsafe { &*self.ctx };
        let jmp_rsp_addr = self.cells.jmp_rsp.get() as u64;
        match gen_mainloop(buf, ctx, &self.hooks, &self.aspace, &mut self.unwinder, jmp_rsp_addr) {
            Ok(m) => {
                self.mainloop_entry = m.entry;
                self.handle_exception_ptr = m.handle_exception;
                self.mem = m.mem_handlers;
                // SAFETY: same context; publish the long-jump target.
                unsafe { (*self.ctx).handle_exception = m.handle_exception };
                tracing::debug!(
                    "mainloop generated at {:p}, handlers {:p}..{:p}",
                    m.entry,
                    self.mem.start(),
                    self.mem.end()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("fatal emitter error generating mainloop: {e:?}");
                Err(e.into())
            }
        }
    }

    fn compile(
        &mut self,
        block: &mut RuntimeBlockInfo,
        smc_checks: bool,
        optimise: bool,
    ) -> Result<(), RecError> {
        let buf = self.buf.as_mut().ok_or(RecError::NotInitialized)?;
        let _scope = buf.write_scope()?;
        // SAFETY: init bound a live context.
        let ctx = unsafe { &*self.ctx };
        let xmm_save_addr = self.cells.xmm_save.get() as u64;

        let mut cc = BlockCompiler::new(
            &mut *buf,
            ctx,
            &self.hooks,
            &self.aspace,
            &self.cfg,
            &self.mem,
            xmm_save_addr,
        );
        let start = cc.start_offset();
        let result = cc.compile(block, smc_checks, optimise);
        drop(cc);

        if let Err(e) = result {
            tracing::error!("fatal emitter error: {e:?}");
            // Abandon the block: no executable entry, cursor rewound.
            buf.set_offset(start);
            block.code = std::ptr::null();
            block.host_code_size = 0;
            return Err(e.into());
        }
        Ok(())
    }

    fn mainloop(&mut self) -> Result<(), RecError> {
        if self.mainloop_entry.is_null() {
            return Err(RecError::NotInitialized);
        }
        // SAFETY: the entry was generated by reset and the buffer is
        // executable outside write scopes.
        let entry: extern "C" fn() = unsafe { std::mem::transmute(self.mainloop_entry) };
        entry();

        // A guest exception that leaked out of the dispatch loop is a
        // host-visible fatal error.
        let ctx = unsafe { &mut *self.ctx };
        if let Some(ex) = ctx.take_pending_exception() {
            tracing::error!("unhandled SH4 exception in mainloop, code {:#x}", ex.evn);
            return Err(RecError::UnhandledGuestException(ex.evn));
        }
        Ok(())
    }

    fn rewrite(&mut self, context: &mut HostContext, _fault_addr: usize) -> bool {
        let Some(buf) = self.buf.as_mut() else {
            // init() not called yet
            return false;
        };
        // SAFETY: the faulted call pushed a return address the signal
        // handler's rsp points at.
        let ret_addr = unsafe { *(context.rsp as *const usize) };
        if buf.offset_of(ret_addr.wrapping_sub(5) as *const u8).is_none() {
            return false;
        }
        let Ok(_scope) = buf.write_scope() else {
            return false;
        };
        rewrite_mem_access(buf, &self.mem, self.aspace.virtmem_enabled, context)
    }

    fn handle_exception(&self, context: &mut HostContext) {
        context.pc = self.handle_exception_ptr as usize;
    }
}
