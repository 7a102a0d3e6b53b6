//! Unwind descriptor publishing for generated prologues.
//!
//! Guest exceptions no longer unwind host frames through generated code
//! (the dispatch loop long-jumps instead), but the embedder's fault
//! handler still needs to walk stacks that contain generated frames, so
//! every emitted prologue publishes a compact descriptor: which
//! callee-saved registers were pushed and how much stack was allocated,
//! at which prologue offsets. The descriptor is appended right after
//! the function body; the trailing region of the code buffer reserves
//! 128 bytes for the last one.

use crate::x86_64::emitter::Emitter;
use crate::x86_64::regs::Reg;

const DESC_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy)]
enum PrologueOp {
    PushReg { code_offset: u32, reg: Reg },
    AllocStack { code_offset: u32, size: u32 },
}

/// A published region: host code span plus its descriptor address.
#[derive(Debug, Clone, Copy)]
pub struct UnwindRegion {
    pub start: *const u8,
    pub end: *const u8,
    pub descriptor: *const u8,
    pub descriptor_len: usize,
}

/// Records prologue notifications for the function currently being
/// emitted, then serializes them on `end`.
#[derive(Default)]
pub struct UnwindPublisher {
    start: usize,
    ops: Vec<PrologueOp>,
    prolog_size: u32,
    regions: Vec<UnwindRegion>,
}

impl UnwindPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all recorded state and published regions.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.prolog_size = 0;
        self.regions.clear();
    }

    /// Begin a region at the given host address.
    pub fn start(&mut self, addr: *const u8) {
        self.start = addr as usize;
        self.ops.clear();
        self.prolog_size = 0;
    }

    /// "Pushed callee-saved register `reg`" at prologue offset.
    pub fn push_reg(&mut self, code_offset: usize, reg: Reg) {
        self.ops.push(PrologueOp::PushReg {
            code_offset: code_offset as u32,
            reg,
        });
    }

    /// "Allocated `size` bytes of stack" at prologue offset.
    pub fn alloc_stack(&mut self, code_offset: usize, size: u32) {
        self.ops.push(PrologueOp::AllocStack {
            code_offset: code_offset as u32,
            size,
        });
    }

    /// End-of-prologue marker.
    pub fn end_prolog(&mut self, code_offset: usize) {
        self.prolog_size = code_offset as u32;
    }

    /// Serialize the descriptor at the emitter's current position and
    /// publish the region covering `code_size` bytes from `start`.
    /// Returns the descriptor length in bytes.
    pub fn end(&mut self, em: &mut Emitter, code_size: usize) -> usize {
        let descriptor = em.current_ptr();
        em.emit_bytes(&[
            DESC_VERSION,
            self.ops.len() as u8,
            self.prolog_size as u8,
            (self.prolog_size >> 8) as u8,
        ]);
        for op in &self.ops {
            let (kind, reg, offset, size) = match *op {
                PrologueOp::PushReg { code_offset, reg } => (0u8, reg as u8, code_offset, 8u32),
                PrologueOp::AllocStack { code_offset, size } => (1u8, 0, code_offset, size),
            };
            em.emit_bytes(&[kind, reg, offset as u8, (offset >> 8) as u8]);
            em.emit_bytes(&size.to_le_bytes());
        }
        let len = 4 + 8 * self.ops.len();
        self.regions.push(UnwindRegion {
            start: self.start as *const u8,
            end: (self.start + code_size) as *const u8,
            descriptor,
            descriptor_len: len,
        });
        self.ops.clear();
        len
    }

    /// Region lookup by host pc (used by the embedder's stack walker).
    pub fn find(&self, pc: *const u8) -> Option<&UnwindRegion> {
        self.regions
            .iter()
            .find(|r| (r.start..r.end).contains(&pc))
    }
}
