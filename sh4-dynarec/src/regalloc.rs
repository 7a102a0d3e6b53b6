//! Block-scoped register allocation.
//!
//! Policy is deliberately simple: the most-used guest general registers
//! get static host registers for the whole block, guest floating
//! singles likewise. The host side of the contract is what matters to
//! the compiler: preload/writeback requests, and mapping queries during
//! lowering. All handed-out GPRs are callee-saved so host calls made
//! from inside a block cannot clobber them.
//!
//! Blocks containing ops that touch context register slots directly
//! (interpreter fallbacks, SR/FPSCR resyncs, bank swaps, canonical
//! calls) get no allocation at all; cached copies would go stale.

use crate::x86_64::regs::{Reg, Xmm, ALLOC_GPRS, ALLOC_XMMS};
use sh4_core::shil::{self, RegId};
use sh4_core::{RuntimeBlockInfo, ShilOpcode, ShilParam};
use std::collections::HashMap;

pub struct X64RegAlloc {
    alloc_f64: bool,
    gprs: Vec<(RegId, Reg)>,
    xmms: Vec<(RegId, Xmm)>,
    dirty_gpr: Vec<bool>,
    dirty_xmm: Vec<bool>,
}

impl X64RegAlloc {
    pub fn new(alloc_f64: bool) -> Self {
        Self {
            alloc_f64,
            gprs: Vec::new(),
            xmms: Vec::new(),
            dirty_gpr: Vec::new(),
            dirty_xmm: Vec::new(),
        }
    }

    /// Decide the block's register assignment. The compiler materializes
    /// it afterwards via its RegPreload hooks.
    pub fn do_alloc(&mut self, block: &RuntimeBlockInfo) {
        self.gprs.clear();
        self.xmms.clear();
        self.dirty_gpr.clear();
        self.dirty_xmm.clear();

        if block.oplist.iter().any(|op| op.op.bypasses_regalloc()) {
            return;
        }

        let mut gpr_uses: HashMap<RegId, u32> = HashMap::new();
        let mut fpu_uses: HashMap<RegId, u32> = HashMap::new();
        for op in &block.oplist {
            for prm in [&op.rd, &op.rd2, &op.rs1, &op.rs2, &op.rs3] {
                match prm {
                    ShilParam::Reg(id) if shil::is_gpr(*id) => {
                        *gpr_uses.entry(*id).or_default() += 1;
                    }
                    ShilParam::Reg(id) if shil::is_fpu(*id) => {
                        *fpu_uses.entry(*id).or_default() += 1;
                    }
                    ShilParam::RegPair(id) if self.alloc_f64 => {
                        *fpu_uses.entry(*id).or_default() += 1;
                        *fpu_uses.entry(*id + 1).or_default() += 1;
                    }
                    _ => {}
                }
            }
        }

        let by_count = |uses: HashMap<RegId, u32>| {
            let mut v: Vec<(RegId, u32)> = uses.into_iter().collect();
            // Highest use count first; register id breaks ties so the
            // assignment is deterministic.
            v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            v
        };

        for ((id, _), &host) in by_count(gpr_uses).into_iter().zip(ALLOC_GPRS.iter()) {
            self.gprs.push((id, host));
        }
        for ((id, _), &host) in by_count(fpu_uses).into_iter().zip(ALLOC_XMMS.iter()) {
            self.xmms.push((id, host));
        }

        // Pair accesses must see whole pairs: with the F64 allocator
        // off they go through memory, so no half may live in an XMM;
        // with it on, a lone mapped half would leave the other half's
        // memory image authoritative. Drop the offending mappings.
        for op in &block.oplist {
            for prm in [&op.rd, &op.rd2, &op.rs1, &op.rs2, &op.rs3] {
                if let ShilParam::RegPair(id) = prm {
                    if !self.alloc_f64 {
                        self.xmms.retain(|&(f, _)| f != *id && f != *id + 1);
                    } else {
                        let lo = self.mapf_id(*id).is_some();
                        let hi = self.mapf_id(*id + 1).is_some();
                        if lo != hi {
                            let lone = if lo { *id } else { *id + 1 };
                            self.xmms.retain(|&(f, _)| f != lone);
                        }
                    }
                }
            }
        }

        self.dirty_gpr = vec![false; self.gprs.len()];
        self.dirty_xmm = vec![false; self.xmms.len()];
    }

    /// Registers to materialize before the first op.
    pub fn preloads(&self) -> &[(RegId, Reg)] {
        &self.gprs
    }

    pub fn fpu_preloads(&self) -> &[(RegId, Xmm)] {
        &self.xmms
    }

    pub fn op_begin(&mut self, _op: &ShilOpcode, _opid: usize) {}

    /// Mark written destinations dirty so Cleanup knows what to flush.
    pub fn op_end(&mut self, op: &ShilOpcode) {
        for prm in [&op.rd, &op.rd2] {
            match prm {
                ShilParam::Reg(id) => {
                    if let Some(i) = self.gprs.iter().position(|&(g, _)| g == *id) {
                        self.dirty_gpr[i] = true;
                    }
                    if let Some(i) = self.xmms.iter().position(|&(f, _)| f == *id) {
                        self.dirty_xmm[i] = true;
                    }
                }
                ShilParam::RegPair(id) => {
                    for half in [*id, *id + 1] {
                        if let Some(i) = self.xmms.iter().position(|&(f, _)| f == half) {
                            self.dirty_xmm[i] = true;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Dirty mappings to flush at block end.
    pub fn writebacks(&self) -> Vec<(RegId, Reg)> {
        self.gprs
            .iter()
            .zip(&self.dirty_gpr)
            .filter(|(_, &d)| d)
            .map(|(&m, _)| m)
            .collect()
    }

    pub fn fpu_writebacks(&self) -> Vec<(RegId, Xmm)> {
        self.xmms
            .iter()
            .zip(&self.dirty_xmm)
            .filter(|(_, &d)| d)
            .map(|(&m, _)| m)
            .collect()
    }

    // -- mapping queries --

    /// Is this a general register with a host mapping?
    pub fn is_allocg(&self, prm: &ShilParam) -> bool {
        matches!(prm, ShilParam::Reg(id) if self.mapg_id(*id).is_some())
    }

    /// Is this a floating register (or pair) fully mapped to XMMs?
    pub fn is_allocf(&self, prm: &ShilParam) -> bool {
        match prm {
            ShilParam::Reg(id) => shil::is_fpu(*id) && self.mapf_id(*id).is_some(),
            ShilParam::RegPair(id) => {
                self.mapf_id(*id).is_some() && self.mapf_id(*id + 1).is_some()
            }
            _ => false,
        }
    }

    pub fn mapg_id(&self, id: RegId) -> Option<Reg> {
        self.gprs.iter().find(|&&(g, _)| g == id).map(|&(_, r)| r)
    }

    fn mapf_id(&self, id: RegId) -> Option<Xmm> {
        self.xmms.iter().find(|&&(f, _)| f == id).map(|&(_, x)| x)
    }

    pub fn mapg(&self, prm: &ShilParam) -> Option<Reg> {
        match prm {
            ShilParam::Reg(id) => self.mapg_id(*id),
            _ => None,
        }
    }

    /// Host register of a mapped general param. Lowerings that call
    /// this have ensured the mapping exists.
    pub fn map_register(&self, prm: &ShilParam) -> Reg {
        self.mapg(prm).expect("general register not allocated")
    }

    /// XMM of a mapped floating single.
    pub fn map_x_register(&self, prm: &ShilParam) -> Xmm {
        match prm {
            ShilParam::Reg(id) => self.mapf_id(*id).expect("float register not allocated"),
            _ => panic!("map_x_register on non-float param"),
        }
    }

    /// XMM of one half of a mapped 64-bit pair.
    pub fn map_x_register_half(&self, prm: &ShilParam, half: u32) -> Xmm {
        match prm {
            ShilParam::RegPair(id) => self
                .mapf_id(*id + half)
                .expect("float pair half not allocated"),
            _ => panic!("map_x_register_half on non-pair param"),
        }
    }

    /// Is this host XMM currently handed out? Drives the save band
    /// around host calls on ABIs where xmm8..xmm11 are caller-saved.
    pub fn is_mapped_xmm(&self, x: Xmm) -> bool {
        self.xmms.iter().any(|&(_, m)| m == x)
    }

    /// Guest register cached in the given XMM, for post-call reloads.
    pub fn xmm_guest_reg(&self, x: Xmm) -> Option<RegId> {
        self.xmms.iter().find(|&&(_, m)| m == x).map(|&(id, _)| id)
    }
}
