//! End-to-end translation tests: build an op stream, generate x86-64
//! code and decode it back to check the emitted shape.

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, Register};

use tbgen::core::{ArithOp, Cond, MemOp, MemSize, TranslationContext, ValType};
use tbgen::host::{CodeBuffer, GuestMemHooks};
use tbgen::x64::{X64Backend, ENV_BASE};
use tbgen::{generate, TranslateError};

fn backend() -> X64Backend {
    let _ = env_logger::builder().is_test(true).try_init();
    X64Backend::new(GuestMemHooks {
        load: 0x7000_0000,
        store: 0x7000_1000,
    })
}

fn decode(code: &[u8]) -> Vec<Instruction> {
    Decoder::new(64, code, DecoderOptions::NONE)
        .into_iter()
        .collect()
}

fn is_store_to_env(instr: &Instruction) -> bool {
    instr.mnemonic() == Mnemonic::Mov
        && instr.op0_kind() == iced_x86::OpKind::Memory
        && instr.memory_base() == Register::R14
}

#[test]
fn add_of_two_globals() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let r0 = ctx.global(ValType::I64, 0x00, "r0");
    let r1 = ctx.global(ValType::I64, 0x08, "r1");

    ctx.insn_start(0x1000);
    let t = ctx.local_ebb(ValType::I64);
    ctx.arith(ArithOp::Add, t, r0, r1);
    ctx.mov(r0, t);
    ctx.exit_block(0);

    let mut buf = CodeBuffer::new(4096);
    let block = generate(&mut ctx, &backend(), &mut buf, 0x1000..0x1004, 0).unwrap();
    assert_eq!(block.code_len, buf.offset());
    assert_eq!(block.insn_map, vec![(0x1000, 0)]);

    let instrs = decode(buf.code());
    // Two loads, the add, the writeback, the exit value and the return.
    assert_eq!(instrs.len(), 6);
    assert!(is_store_to_env(&instrs[3]));
    assert_eq!(instrs[3].memory_displacement64(), 0);
    assert_eq!(instrs.last().unwrap().mnemonic(), Mnemonic::Ret);
}

#[test]
fn globals_stored_before_conditional_branch() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let r0 = ctx.global(ValType::I64, 0x00, "r0");

    ctx.insn_start(0x1000);
    let t = ctx.local_ebb(ValType::I64);
    let one = ctx.constant(ValType::I64, 1);
    ctx.arith(ArithOp::Add, t, r0, one);
    ctx.mov(r0, t);
    let taken = ctx.new_label();
    let zero = ctx.constant(ValType::I64, 0);
    ctx.brcond(Cond::Ne, r0, zero, taken);
    ctx.exit_block(1);
    ctx.set_label(taken);
    ctx.exit_block(0);

    let mut buf = CodeBuffer::new(4096);
    generate(&mut ctx, &backend(), &mut buf, 0x1000..0x1004, 0).unwrap();

    let instrs = decode(buf.code());
    let jcc = instrs
        .iter()
        .position(|i| i.mnemonic() == Mnemonic::Jne)
        .expect("conditional branch emitted");
    let store = instrs
        .iter()
        .position(is_store_to_env)
        .expect("global written back");
    // Register state is committed before control can leave the block.
    assert!(store < jcc);

    // The forward branch must land on an instruction boundary past the
    // fallthrough exit.
    let target = instrs[jcc].near_branch64();
    assert!(instrs.iter().any(|i| i.ip() == target));
    assert!(target > instrs[jcc].ip());
}

#[test]
fn identical_streams_produce_identical_code() {
    fn build(ctx: &mut TranslationContext) {
        let r0 = ctx.global(ValType::I64, 0x00, "r0");
        let r1 = ctx.global(ValType::I64, 0x08, "r1");
        ctx.insn_start(0x2000);
        let t = ctx.local_ebb(ValType::I64);
        let u = ctx.local_ebb(ValType::I64);
        ctx.arith(ArithOp::Xor, t, r0, r1);
        ctx.arith(ArithOp::Shl, u, t, r1);
        ctx.mov(r0, u);
        ctx.exit_block(0);
    }

    let mut first = Vec::new();
    for _ in 0..2 {
        let mut ctx = TranslationContext::new();
        ctx.set_env_base(ENV_BASE, "env");
        build(&mut ctx);
        let mut buf = CodeBuffer::new(4096);
        generate(&mut ctx, &backend(), &mut buf, 0x2000..0x2004, 0).unwrap();
        if first.is_empty() {
            first = buf.code().to_vec();
        } else {
            assert_eq!(first, buf.code());
        }
    }
}

#[test]
fn context_reuse_after_reset() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let r0 = ctx.global(ValType::I64, 0x00, "r0");

    let build = |ctx: &mut TranslationContext| {
        let t = ctx.local_ebb(ValType::I64);
        let k = ctx.constant(ValType::I64, 7);
        ctx.arith(ArithOp::And, t, r0, k);
        ctx.mov(r0, t);
        ctx.exit_block(0);
    };

    let b = backend();
    let mut buf_a = CodeBuffer::new(4096);
    build(&mut ctx);
    generate(&mut ctx, &b, &mut buf_a, 0..4, 0).unwrap();

    ctx.reset();
    let mut buf_b = CodeBuffer::new(4096);
    build(&mut ctx);
    generate(&mut ctx, &b, &mut buf_b, 0..4, 0).unwrap();

    assert_eq!(buf_a.code(), buf_b.code());
}

#[test]
fn code_buffer_exhaustion_is_recoverable() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let r0 = ctx.global(ValType::I64, 0x00, "r0");
    let r1 = ctx.global(ValType::I64, 0x08, "r1");
    let t = ctx.local_ebb(ValType::I64);
    ctx.arith(ArithOp::Add, t, r0, r1);
    ctx.mov(r0, t);
    ctx.exit_block(0);

    let mut buf = CodeBuffer::new(2);
    let err = generate(&mut ctx, &backend(), &mut buf, 0..4, 0).unwrap_err();
    assert!(matches!(err, TranslateError::CodeBufferFull { .. }));
}

#[test]
fn double_word_add_uses_carry_chain() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let lo = ctx.global(ValType::I64, 0x00, "acc_lo");
    let hi = ctx.global(ValType::I64, 0x08, "acc_hi");

    let (b_lo, b_hi) = ctx.local_i128();
    ctx.movi(b_lo, -1);
    ctx.movi(b_hi, 0);
    let (d_lo, d_hi) = ctx.local_i128();
    ctx.add2(d_lo, d_hi, lo, hi, b_lo, b_hi);
    ctx.mov(lo, d_lo);
    ctx.mov(hi, d_hi);
    ctx.exit_block(0);

    let mut buf = CodeBuffer::new(4096);
    generate(&mut ctx, &backend(), &mut buf, 0..4, 0).unwrap();

    let instrs = decode(buf.code());
    let add = instrs
        .iter()
        .position(|i| i.mnemonic() == Mnemonic::Add)
        .expect("low half add");
    assert_eq!(instrs[add + 1].mnemonic(), Mnemonic::Adc);
}

#[test]
fn guest_load_calls_the_mmu_helper() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let r0 = ctx.global(ValType::I64, 0x00, "r0");

    let addr = ctx.local_ebb(ValType::I64);
    ctx.movi(addr, 0x8000);
    let val = ctx.local_ebb(ValType::I64);
    let mem = MemOp {
        size: MemSize::S32,
        sign_extend: false,
        byte_swap: false,
        aligned: false,
    };
    ctx.guest_ld(val, addr, mem, 1);
    ctx.mov(r0, val);
    ctx.exit_block(0);

    let mut buf = CodeBuffer::new(4096);
    generate(&mut ctx, &backend(), &mut buf, 0..4, 0).unwrap();

    let instrs = decode(buf.code());
    let call = instrs
        .iter()
        .position(|i| i.mnemonic() == Mnemonic::Call)
        .expect("helper call emitted");
    // The machine-state base is the first helper argument.
    assert!(instrs[..call].iter().any(|i| {
        i.mnemonic() == Mnemonic::Mov
            && i.op0_register() == Register::RDI
            && i.op1_register() == Register::R14
    }));
}

#[test]
fn setcond_materializes_a_flag_value() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let r0 = ctx.global(ValType::I64, 0x00, "r0");
    let r1 = ctx.global(ValType::I64, 0x08, "r1");

    let t = ctx.local_ebb(ValType::I64);
    ctx.setcond(Cond::Ltu, t, r0, r1);
    ctx.mov(r0, t);
    ctx.exit_block(0);

    let mut buf = CodeBuffer::new(4096);
    generate(&mut ctx, &backend(), &mut buf, 0..4, 0).unwrap();

    let instrs = decode(buf.code());
    let setb = instrs
        .iter()
        .position(|i| i.mnemonic() == Mnemonic::Setb)
        .expect("unsigned compare materialized");
    assert_eq!(instrs[setb + 1].mnemonic(), Mnemonic::Movzx);
}

#[test]
fn whole_block_local_spills_above_the_return_slot() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let r0 = ctx.global(ValType::I64, 0x00, "r0");
    let r1 = ctx.global(ValType::I64, 0x08, "r1");

    // A whole-block local carried across a branch is saved to the stack
    // frame at the basic-block boundary and reloaded on the far side.
    let t = ctx.local(ValType::I64);
    ctx.arith(ArithOp::Xor, t, r0, r1);
    let taken = ctx.new_label();
    let zero = ctx.constant(ValType::I64, 0);
    ctx.brcond(Cond::Ne, r0, zero, taken);
    ctx.exit_block(1);
    ctx.set_label(taken);
    ctx.mov(r0, t);
    ctx.exit_block(0);

    let mut buf = CodeBuffer::new(4096);
    generate(&mut ctx, &backend(), &mut buf, 0..4, 0).unwrap();

    let instrs = decode(buf.code());
    let spill = instrs
        .iter()
        .position(|i| {
            i.mnemonic() == Mnemonic::Mov
                && i.op0_kind() == iced_x86::OpKind::Memory
                && i.memory_base() == Register::RSP
        })
        .expect("local spilled to the frame");
    let slot = instrs[spill].memory_displacement64();
    // `[rsp]` holds the return address the block's `ret` pops; the frame
    // must start strictly above it.
    assert!(slot >= 8, "spill slot {slot:#x} overlaps the return slot");
    let reload = instrs
        .iter()
        .position(|i| {
            i.mnemonic() == Mnemonic::Mov
                && i.op1_kind() == iced_x86::OpKind::Memory
                && i.memory_base() == Register::RSP
                && i.memory_displacement64() == slot
        })
        .expect("local reloaded from its slot");
    assert!(reload > spill);
    assert!(instrs.iter().all(|i| {
        i.op0_kind() != iced_x86::OpKind::Memory
            || i.memory_base() != Register::RSP
            || i.memory_displacement64() >= 8
    }));
}

#[test]
fn insn_map_tracks_guest_boundaries() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let r0 = ctx.global(ValType::I64, 0x00, "r0");
    let r1 = ctx.global(ValType::I64, 0x08, "r1");

    ctx.insn_start(0x1000);
    let t = ctx.local_ebb(ValType::I64);
    ctx.arith(ArithOp::Add, t, r0, r1);
    ctx.mov(r0, t);
    ctx.insn_start(0x1004);
    let u = ctx.local_ebb(ValType::I64);
    ctx.arith(ArithOp::Sub, u, r0, r1);
    ctx.mov(r1, u);
    ctx.exit_block(0);

    let mut buf = CodeBuffer::new(4096);
    let block = generate(&mut ctx, &backend(), &mut buf, 0x1000..0x1008, 0).unwrap();

    assert_eq!(block.insn_map.len(), 2);
    assert_eq!(block.insn_map[0], (0x1000, 0));
    assert_eq!(block.insn_map[1].0, 0x1004);
    assert!(block.insn_map[1].1 > 0);
    assert!((block.insn_map[1].1 as usize) < block.code_len);
}

#[test]
#[should_panic(expected = "unbound label")]
fn unbound_label_is_rejected() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let l = ctx.new_label();
    ctx.br(l);

    let mut buf = CodeBuffer::new(4096);
    let _ = generate(&mut ctx, &backend(), &mut buf, 0..4, 0);
}

#[test]
fn constant_only_block_folds_to_stores() {
    let mut ctx = TranslationContext::new();
    ctx.set_env_base(ENV_BASE, "env");
    let r0 = ctx.global(ValType::I64, 0x00, "r0");

    // r0 = (3 * 5) + 2, entirely foldable.
    let t = ctx.local_ebb(ValType::I64);
    let u = ctx.local_ebb(ValType::I64);
    let three = ctx.constant(ValType::I64, 3);
    let five = ctx.constant(ValType::I64, 5);
    let two = ctx.constant(ValType::I64, 2);
    ctx.arith(ArithOp::Mul, t, three, five);
    ctx.arith(ArithOp::Add, u, t, two);
    ctx.mov(r0, u);
    ctx.exit_block(0);

    let mut buf = CodeBuffer::new(4096);
    generate(&mut ctx, &backend(), &mut buf, 0..4, 0).unwrap();

    // No multiply or add survives; the folded value is materialized
    // and stored.
    let instrs = decode(buf.code());
    assert!(instrs.iter().all(|i| {
        i.mnemonic() != Mnemonic::Imul && i.mnemonic() != Mnemonic::Add
    }));
    assert!(instrs.iter().any(|i| {
        use iced_x86::OpKind;
        i.mnemonic() == Mnemonic::Mov
            && matches!(
                i.op1_kind(),
                OpKind::Immediate32 | OpKind::Immediate32to64 | OpKind::Immediate64
            )
            && i.immediate(1) == 17
    }));
    assert!(instrs.iter().any(is_store_to_env));
}
