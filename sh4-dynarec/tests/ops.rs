//! Equivalence tests: specially-lowered opcodes against scalar
//! reference semantics over a seeded random corpus, including
//! operand-aliasing cases.

#![cfg(target_arch = "x86_64")]

mod common;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sh4_core::shil::REG_FR0;
use sh4_core::{BlockEndType, ShilOp, ShilOpcode, ShilParam};
use sh4_dynarec::RecConfig;

fn run_single_op(env: &mut TestEnv, op: ShilOpcode) {
    let mut block = block_with(0x8C001000, BlockEndType::StaticJump, vec![op]);
    block.branch_block = 0x8C001002;
    env.compile(&mut block, false, false);
    env.run_block(&block);
}

fn negc_ref(a: u32, b: u32) -> (u32, u32) {
    let t = 0i64.wrapping_sub(a as i64).wrapping_sub(b as i64);
    (t as u32, (t as u64 >> 63) as u32)
}

#[test]
fn negc_matches_reference() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    for _ in 0..64 {
        let a: u32 = rng.gen();
        let b: u32 = rng.gen_range(0..=1);
        let mut env = TestEnv::new();
        let mut op = ShilOpcode::new(ShilOp::Negc);
        op.rs1 = ShilParam::Reg(1);
        op.rs2 = ShilParam::Reg(2);
        op.rd = ShilParam::Reg(3);
        op.rd2 = ShilParam::Reg(4);
        env.ctx.r[1] = a;
        env.ctx.r[2] = b;
        run_single_op(&mut env, op);
        let (rd, rd2) = negc_ref(a, b);
        assert_eq!(env.ctx.r[3], rd, "negc value for a={a:#x} b={b}");
        assert_eq!(env.ctx.r[4], rd2, "negc carry for a={a:#x} b={b}");
    }
}

#[test]
fn negc_with_aliased_destination() {
    // rd aliases rs2: the lowering must copy the subtrahend first.
    for (a, b) in [(0u32, 0u32), (1, 0), (0x8000_0000, 1), (0xFFFF_FFFF, 1)] {
        let mut env = TestEnv::new();
        let mut op = ShilOpcode::new(ShilOp::Negc);
        op.rs1 = ShilParam::Reg(1);
        op.rs2 = ShilParam::Reg(2);
        op.rd = ShilParam::Reg(2);
        op.rd2 = ShilParam::Reg(4);
        env.ctx.r[1] = a;
        env.ctx.r[2] = b;
        run_single_op(&mut env, op);
        let (rd, rd2) = negc_ref(a, b);
        assert_eq!(env.ctx.r[2], rd);
        assert_eq!(env.ctx.r[4], rd2);
    }
}

#[test]
fn mul_s64_matches_reference() {
    let mut rng = StdRng::seed_from_u64(0xCAFE);
    for _ in 0..64 {
        let a: u32 = rng.gen();
        let b: u32 = rng.gen();
        let mut env = TestEnv::new();
        let mut op = ShilOpcode::new(ShilOp::MulS64);
        op.rs1 = ShilParam::Reg(1);
        op.rs2 = ShilParam::Reg(2);
        op.rd = ShilParam::Reg(3);
        op.rd2 = ShilParam::Reg(4);
        env.ctx.r[1] = a;
        env.ctx.r[2] = b;
        run_single_op(&mut env, op);
        let prod = (a as i32 as i64).wrapping_mul(b as i32 as i64) as u64;
        assert_eq!(env.ctx.r[3], prod as u32);
        assert_eq!(env.ctx.r[4], (prod >> 32) as u32);
    }
}

#[test]
fn mul_s64_immediate_operand() {
    let mut env = TestEnv::new();
    let mut op = ShilOpcode::new(ShilOp::MulS64);
    op.rs1 = ShilParam::Reg(1);
    op.rs2 = ShilParam::Imm(0xFFFF_FFFE); // -2
    op.rd = ShilParam::Reg(3);
    op.rd2 = ShilParam::Reg(4);
    env.ctx.r[1] = 7;
    run_single_op(&mut env, op);
    let prod = (7i64).wrapping_mul(-2) as u64;
    assert_eq!(env.ctx.r[3], prod as u32);
    assert_eq!(env.ctx.r[4], (prod >> 32) as u32);
}

#[test]
fn mul_u64_via_canonical_call() {
    let mut rng = StdRng::seed_from_u64(0xF00D);
    for _ in 0..16 {
        let a: u32 = rng.gen();
        let b: u32 = rng.gen();
        let mut env = TestEnv::new();
        let mut op = ShilOpcode::new(ShilOp::MulU64);
        op.rs1 = ShilParam::Reg(1);
        op.rs2 = ShilParam::Reg(2);
        op.rd = ShilParam::Reg(3);
        op.rd2 = ShilParam::Reg(4);
        env.ctx.r[1] = a;
        env.ctx.r[2] = b;
        run_single_op(&mut env, op);
        let prod = a as u64 * b as u64;
        assert_eq!(env.ctx.r[3], prod as u32);
        assert_eq!(env.ctx.r[4], (prod >> 32) as u32);
    }
}

#[test]
fn adc_and_sbc_carry_chains() {
    let mut rng = StdRng::seed_from_u64(0xAB);
    for _ in 0..64 {
        let a: u32 = rng.gen();
        let b: u32 = rng.gen();
        let c: u32 = rng.gen_range(0..=1);

        let mut env = TestEnv::new();
        let mut op = ShilOpcode::new(ShilOp::Adc);
        op.rs1 = ShilParam::Reg(1);
        op.rs2 = ShilParam::Reg(2);
        op.rs3 = ShilParam::Reg(5);
        op.rd = ShilParam::Reg(3);
        op.rd2 = ShilParam::Reg(4);
        env.ctx.r[1] = a;
        env.ctx.r[2] = b;
        env.ctx.r[5] = c;
        run_single_op(&mut env, op);
        let sum = a as u64 + b as u64 + c as u64;
        assert_eq!(env.ctx.r[3], sum as u32);
        assert_eq!(env.ctx.r[4], (sum >> 32) as u32);

        let mut env = TestEnv::new();
        let mut op = ShilOpcode::new(ShilOp::Sbc);
        op.rs1 = ShilParam::Reg(1);
        op.rs2 = ShilParam::Reg(2);
        op.rs3 = ShilParam::Reg(5);
        op.rd = ShilParam::Reg(3);
        op.rd2 = ShilParam::Reg(4);
        env.ctx.r[1] = a;
        env.ctx.r[2] = b;
        env.ctx.r[5] = c;
        run_single_op(&mut env, op);
        let diff = (a as i64) - (b as i64) - (c as i64);
        assert_eq!(env.ctx.r[3], diff as u32);
        assert_eq!(env.ctx.r[4], ((diff as u64) >> 63) as u32);
    }
}

#[test]
fn fmac_matches_scalar_reference() {
    // avoid_fma keeps the multiply-then-add form, which is bit-exact
    // against the scalar reference.
    let cfg = RecConfig {
        avoid_fma: true,
        ..RecConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(0xF3AC);
    for _ in 0..64 {
        let a = f32::from_bits(rng.gen::<u32>() & 0x7F7F_FFFF);
        let b = f32::from_bits(rng.gen::<u32>() & 0x7F7F_FFFF);
        let c = f32::from_bits(rng.gen::<u32>() & 0x7F7F_FFFF);

        let mut env = TestEnv::with_config(cfg);
        let mut op = ShilOpcode::new(ShilOp::Fmac);
        op.rs1 = ShilParam::Reg(REG_FR0);
        op.rs2 = ShilParam::Reg(REG_FR0 + 1);
        op.rs3 = ShilParam::Reg(REG_FR0 + 2);
        op.rd = ShilParam::Reg(REG_FR0 + 3);
        env.ctx.fr[0] = a;
        env.ctx.fr[1] = b;
        env.ctx.fr[2] = c;
        run_single_op(&mut env, op);
        let expect = a + b * c;
        assert_eq!(env.ctx.fr[3].to_bits(), expect.to_bits());
    }
}

#[test]
fn fmac_aliasing_cases() {
    let cfg = RecConfig {
        avoid_fma: true,
        ..RecConfig::default()
    };
    // rd == rs2
    let mut env = TestEnv::with_config(cfg);
    let mut op = ShilOpcode::new(ShilOp::Fmac);
    op.rs1 = ShilParam::Reg(REG_FR0);
    op.rs2 = ShilParam::Reg(REG_FR0 + 1);
    op.rs3 = ShilParam::Reg(REG_FR0 + 2);
    op.rd = ShilParam::Reg(REG_FR0 + 1);
    env.ctx.fr[0] = 1.5;
    env.ctx.fr[1] = 2.0;
    env.ctx.fr[2] = 3.0;
    run_single_op(&mut env, op);
    assert_eq!(env.ctx.fr[1], 1.5 + 2.0 * 3.0);

    // rd == rs3
    let mut env = TestEnv::with_config(cfg);
    let mut op = ShilOpcode::new(ShilOp::Fmac);
    op.rs1 = ShilParam::Reg(REG_FR0);
    op.rs2 = ShilParam::Reg(REG_FR0 + 1);
    op.rs3 = ShilParam::Reg(REG_FR0 + 2);
    op.rd = ShilParam::Reg(REG_FR0 + 2);
    env.ctx.fr[0] = 0.5;
    env.ctx.fr[1] = 4.0;
    env.ctx.fr[2] = 8.0;
    run_single_op(&mut env, op);
    assert_eq!(env.ctx.fr[2], 0.5 + 4.0 * 8.0);

    // rd == rs1 (accumulator form)
    let mut env = TestEnv::with_config(cfg);
    let mut op = ShilOpcode::new(ShilOp::Fmac);
    op.rs1 = ShilParam::Reg(REG_FR0);
    op.rs2 = ShilParam::Reg(REG_FR0 + 1);
    op.rs3 = ShilParam::Reg(REG_FR0 + 2);
    op.rd = ShilParam::Reg(REG_FR0);
    env.ctx.fr[0] = 10.0;
    env.ctx.fr[1] = 2.0;
    env.ctx.fr[2] = 0.25;
    run_single_op(&mut env, op);
    assert_eq!(env.ctx.fr[0], 10.0 + 2.0 * 0.25);
}

#[test]
fn mov64_copies_pairs() {
    for alloc_f64 in [false, true] {
        let cfg = RecConfig {
            alloc_f64,
            ..RecConfig::default()
        };
        let mut env = TestEnv::with_config(cfg);
        let mut op = ShilOpcode::new(ShilOp::Mov64);
        op.rs1 = ShilParam::RegPair(REG_FR0 + 2);
        op.rd = ShilParam::RegPair(REG_FR0);
        env.ctx.fr[2] = 1.25;
        env.ctx.fr[3] = -3.5;
        run_single_op(&mut env, op);
        assert_eq!(env.ctx.fr[0], 1.25);
        assert_eq!(env.ctx.fr[1], -3.5);
    }
}

#[test]
fn mov64_overlapping_pairs() {
    // rd low half == rs1 high half; the temporary must break the chain.
    let mut env = TestEnv::new();
    let mut op = ShilOpcode::new(ShilOp::Mov64);
    op.rs1 = ShilParam::RegPair(REG_FR0 + 1);
    op.rd = ShilParam::RegPair(REG_FR0);
    env.ctx.fr[1] = 7.0;
    env.ctx.fr[2] = 9.0;
    run_single_op(&mut env, op);
    assert_eq!(env.ctx.fr[0], 7.0);
    assert_eq!(env.ctx.fr[1], 9.0);
}

#[test]
fn fsca_writes_sin_cos_pair() {
    let mut env = TestEnv::new();
    let mut op = ShilOpcode::new(ShilOp::Fsca);
    op.rs1 = ShilParam::Imm(0x4000); // quarter turn
    op.rd = ShilParam::RegPair(REG_FR0);
    run_single_op(&mut env, op);
    assert!((env.ctx.fr[0] - 1.0).abs() < 1e-5, "sin(pi/2) ~ 1");
    assert!(env.ctx.fr[1].abs() < 1e-5, "cos(pi/2) ~ 0");
}

#[test]
fn base_alu_ops() {
    let mut env = TestEnv::new();
    let mut add = ShilOpcode::new(ShilOp::Add);
    add.rs1 = ShilParam::Reg(1);
    add.rs2 = ShilParam::Imm(5);
    add.rd = ShilParam::Reg(2);
    let mut shl = ShilOpcode::new(ShilOp::Shl);
    shl.rs1 = ShilParam::Reg(2);
    shl.rs2 = ShilParam::Imm(4);
    shl.rd = ShilParam::Reg(3);
    let mut seteq = ShilOpcode::new(ShilOp::Seteq);
    seteq.rs1 = ShilParam::Reg(3);
    seteq.rs2 = ShilParam::Imm(0x150);
    seteq.rd = ShilParam::Reg(4);
    let mut block = block_with(
        0x8C001000,
        BlockEndType::StaticJump,
        vec![add, shl, seteq],
    );
    env.compile(&mut block, false, false);

    env.ctx.r[1] = 16;
    env.run_block(&block);
    assert_eq!(env.ctx.r[2], 21);
    assert_eq!(env.ctx.r[3], 21 << 4);
    assert_eq!(env.ctx.r[4], 1);
}

#[test]
fn shad_dynamic_shift_via_canonical_call() {
    let cases = [
        (0x0000_0010u32, 4u32, 0x0000_0100u32),     // left by 4
        (0x8000_0000, 0xFFFF_FFFF, 0xC000_0000),    // arithmetic right by 1
        (0x8000_0000, 0xFFFF_FFE0, 0xFFFF_FFFF),    // right by 32 -> sign fill
    ];
    for (v, sh, expect) in cases {
        let mut env = TestEnv::new();
        let mut op = ShilOpcode::new(ShilOp::Shad);
        op.rs1 = ShilParam::Reg(1);
        op.rs2 = ShilParam::Reg(2);
        op.rd = ShilParam::Reg(3);
        env.ctx.r[1] = v;
        env.ctx.r[2] = sh;
        run_single_op(&mut env, op);
        assert_eq!(env.ctx.r[3], expect, "shad {v:#x} by {sh:#x}");
    }
}

#[test]
fn cvt_f2i_saturates_positive_overflow() {
    let cases = [
        (1.75f32, 1u32),
        (-2.5, 0xFFFF_FFFE),
        (3.0e9, 0x7FFF_FFFF),  // positive overflow saturates
        (-3.0e9, 0x8000_0000), // negative overflow keeps the sentinel
    ];
    for (f, expect) in cases {
        let mut env = TestEnv::new();
        let mut op = ShilOpcode::new(ShilOp::CvtF2iT);
        op.rs1 = ShilParam::Reg(REG_FR0);
        op.rd = ShilParam::Reg(1);
        env.ctx.fr[0] = f;
        run_single_op(&mut env, op);
        assert_eq!(env.ctx.r[1], expect, "cvt of {f}");
    }
}
