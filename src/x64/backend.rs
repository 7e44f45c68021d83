//! Encodings and register conventions for x86-64.
//!
//! Instructions are built and serialized with iced-x86. Two-address
//! encodings are expressed through output-aliases-input constraints so
//! the allocator arranges its registers accordingly; the divider's
//! implicit RAX/RDX operands and the shifter's CL count are fixed
//! register constraints.

use iced_x86::{Code, Encoder, Instruction, MemoryOperand, Register};

use crate::core::op::{ArithOp, Cond, MemSize, Op, UnaryOp, VecOp};
use crate::core::temp::{HostReg, RegSet, ValType};
use crate::core::{RelocKind, Relocation, TranslateError, TranslateResult};
use crate::host::{
    BranchTarget, CodeBuffer, GuestMemHooks, HostBackend, ImmPolicy, InCt, LoweredOp,
    OpConstraints, Operand, OutCt, RelocRequest,
};

/// Machine-state base pointer, pinned for the lifetime of the dispatch
/// loop.
pub const ENV_BASE: HostReg = HostReg::gp(14);

/// Spill area the dispatch trampoline reserves before calling into a
/// block. The trampoline drops RSP by this much and then `call`s the
/// block entry, so inside a block `[rsp]` holds the return address and
/// the reserved bytes sit at `[rsp + 8]` upward. RSP stays 16-aligned
/// at helper call sites.
pub const FRAME_SIZE: i32 = 512;

/// First spill slot, just above the return slot the block's `ret` pops.
pub const FRAME_START: i32 = 8;

const RAX: HostReg = HostReg::gp(0);
const RCX: HostReg = HostReg::gp(1);
const RDX: HostReg = HostReg::gp(2);
const RSP: HostReg = HostReg::gp(4);
const R10: HostReg = HostReg::gp(10);

const GP64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const GP32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GP16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

const GP8: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

const XMM: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

// Callee-saved registers first so values survive helper calls without a
// spill; RAX last because it doubles as the call return register.
const GP_ALLOC_ORDER: [HostReg; 14] = [
    HostReg::gp(3),  // rbx
    HostReg::gp(5),  // rbp
    HostReg::gp(12), // r12
    HostReg::gp(13), // r13
    HostReg::gp(15), // r15
    HostReg::gp(10), // r10
    HostReg::gp(11), // r11
    HostReg::gp(9),  // r9
    HostReg::gp(8),  // r8
    HostReg::gp(1),  // rcx
    HostReg::gp(2),  // rdx
    HostReg::gp(6),  // rsi
    HostReg::gp(7),  // rdi
    HostReg::gp(0),  // rax
];

const VEC_ALLOC_ORDER: [HostReg; 16] = [
    HostReg::vec(0),
    HostReg::vec(1),
    HostReg::vec(2),
    HostReg::vec(3),
    HostReg::vec(4),
    HostReg::vec(5),
    HostReg::vec(6),
    HostReg::vec(7),
    HostReg::vec(8),
    HostReg::vec(9),
    HostReg::vec(10),
    HostReg::vec(11),
    HostReg::vec(12),
    HostReg::vec(13),
    HostReg::vec(14),
    HostReg::vec(15),
];

const CALL_ARG_REGS: [HostReg; 6] = [
    HostReg::gp(7), // rdi
    HostReg::gp(6), // rsi
    HostReg::gp(2), // rdx
    HostReg::gp(1), // rcx
    HostReg::gp(8), // r8
    HostReg::gp(9), // r9
];

fn gpr(ty: ValType, reg: HostReg) -> Register {
    match ty {
        ValType::I32 => GP32[reg.id as usize],
        _ => GP64[reg.id as usize],
    }
}

fn in_regs(set: RegSet, imm: ImmPolicy) -> InCt {
    InCt { regs: set, imm }
}

fn in_any(imm: ImmPolicy) -> InCt {
    InCt {
        regs: RegSet::EMPTY,
        imm,
    }
}

fn out_alias(input: u8) -> OutCt {
    OutCt {
        regs: RegSet::EMPTY,
        alias_in: Some(input),
        new_reg: false,
    }
}

fn out_any() -> OutCt {
    OutCt {
        regs: RegSet::EMPTY,
        alias_in: None,
        new_reg: false,
    }
}

fn out_fixed(reg: HostReg) -> OutCt {
    OutCt {
        regs: RegSet::single(reg),
        alias_in: None,
        new_reg: false,
    }
}

pub struct X64Backend {
    hooks: GuestMemHooks,
    reserved: RegSet,
    call_clobbers: RegSet,
}

impl X64Backend {
    pub fn new(hooks: GuestMemHooks) -> Self {
        let mut reserved = RegSet::EMPTY;
        reserved.set(RSP);
        reserved.set(ENV_BASE);

        let mut call_clobbers = RegSet::EMPTY;
        for id in [0u8, 1, 2, 6, 7, 8, 9, 10, 11] {
            call_clobbers.set(HostReg::gp(id));
        }
        for id in 0..16 {
            call_clobbers.set(HostReg::vec(id));
        }

        X64Backend {
            hooks,
            reserved,
            call_clobbers,
        }
    }

    fn emit(&self, buf: &mut CodeBuffer, instr: Instruction) -> TranslateResult<()> {
        let mut encoder = Encoder::new(64);
        encoder
            .encode(&instr, buf.offset() as u64)
            .map_err(|e| TranslateError::Encode(e.to_string()))?;
        buf.write(&encoder.take_buffer())
    }

    fn emit_cmp(
        &self,
        buf: &mut CodeBuffer,
        ty: ValType,
        a: HostReg,
        b: Operand,
    ) -> TranslateResult<()> {
        let instr = match b {
            Operand::Reg(b) => {
                let code = match ty {
                    ValType::I32 => Code::Cmp_r32_rm32,
                    _ => Code::Cmp_r64_rm64,
                };
                Instruction::with2(code, gpr(ty, a), gpr(ty, b))
            }
            Operand::Imm(val) => {
                let code = match ty {
                    ValType::I32 => Code::Cmp_rm32_imm32,
                    _ => Code::Cmp_rm64_imm32,
                };
                Instruction::with2(code, gpr(ty, a), val as i32)
            }
            Operand::None => unreachable!("comparison without a second operand"),
        }
        .map_err(|e| TranslateError::Encode(e.to_string()))?;
        self.emit(buf, instr)
    }

    fn emit_branch(
        &self,
        buf: &mut CodeBuffer,
        code: Code,
        branch: BranchTarget,
    ) -> TranslateResult<Option<RelocRequest>> {
        match branch {
            BranchTarget::Resolved(target) => {
                let instr = Instruction::with_branch(code, target as u64)
                    .map_err(|e| TranslateError::Encode(e.to_string()))?;
                self.emit(buf, instr)?;
                Ok(None)
            }
            BranchTarget::Pending => {
                // Placeholder displacement, patched when the label binds.
                let instr = Instruction::with_branch(code, buf.offset() as u64)
                    .map_err(|e| TranslateError::Encode(e.to_string()))?;
                self.emit(buf, instr)?;
                Ok(Some(RelocRequest {
                    offset: buf.offset() - 4,
                    kind: RelocKind::Rel32,
                    addend: 0,
                }))
            }
            BranchTarget::None => unreachable!("branch op without a target"),
        }
    }
}

fn setcc_code(cond: Cond) -> Code {
    match cond {
        Cond::Eq => Code::Sete_rm8,
        Cond::Ne => Code::Setne_rm8,
        Cond::Lt => Code::Setl_rm8,
        Cond::Ge => Code::Setge_rm8,
        Cond::Le => Code::Setle_rm8,
        Cond::Gt => Code::Setg_rm8,
        Cond::Ltu => Code::Setb_rm8,
        Cond::Geu => Code::Setae_rm8,
        Cond::Leu => Code::Setbe_rm8,
        Cond::Gtu => Code::Seta_rm8,
        Cond::Never | Cond::Always => panic!("trivial condition reached the encoder"),
    }
}

fn jcc_code(cond: Cond) -> Code {
    match cond {
        Cond::Eq => Code::Je_rel32_64,
        Cond::Ne => Code::Jne_rel32_64,
        Cond::Lt => Code::Jl_rel32_64,
        Cond::Ge => Code::Jge_rel32_64,
        Cond::Le => Code::Jle_rel32_64,
        Cond::Gt => Code::Jg_rel32_64,
        Cond::Ltu => Code::Jb_rel32_64,
        Cond::Geu => Code::Jae_rel32_64,
        Cond::Leu => Code::Jbe_rel32_64,
        Cond::Gtu => Code::Ja_rel32_64,
        Cond::Never | Cond::Always => panic!("trivial condition reached the encoder"),
    }
}

fn cmovcc_code(cond: Cond, ty: ValType) -> Code {
    match (cond, ty) {
        (Cond::Eq, ValType::I32) => Code::Cmove_r32_rm32,
        (Cond::Eq, _) => Code::Cmove_r64_rm64,
        (Cond::Ne, ValType::I32) => Code::Cmovne_r32_rm32,
        (Cond::Ne, _) => Code::Cmovne_r64_rm64,
        (Cond::Lt, ValType::I32) => Code::Cmovl_r32_rm32,
        (Cond::Lt, _) => Code::Cmovl_r64_rm64,
        (Cond::Ge, ValType::I32) => Code::Cmovge_r32_rm32,
        (Cond::Ge, _) => Code::Cmovge_r64_rm64,
        (Cond::Le, ValType::I32) => Code::Cmovle_r32_rm32,
        (Cond::Le, _) => Code::Cmovle_r64_rm64,
        (Cond::Gt, ValType::I32) => Code::Cmovg_r32_rm32,
        (Cond::Gt, _) => Code::Cmovg_r64_rm64,
        (Cond::Ltu, ValType::I32) => Code::Cmovb_r32_rm32,
        (Cond::Ltu, _) => Code::Cmovb_r64_rm64,
        (Cond::Geu, ValType::I32) => Code::Cmovae_r32_rm32,
        (Cond::Geu, _) => Code::Cmovae_r64_rm64,
        (Cond::Leu, ValType::I32) => Code::Cmovbe_r32_rm32,
        (Cond::Leu, _) => Code::Cmovbe_r64_rm64,
        (Cond::Gtu, ValType::I32) => Code::Cmova_r32_rm32,
        (Cond::Gtu, _) => Code::Cmova_r64_rm64,
        (Cond::Never | Cond::Always, _) => panic!("trivial condition reached the encoder"),
    }
}

fn arith_rr_code(op: ArithOp, ty: ValType) -> Code {
    use ArithOp::*;
    match (op, ty) {
        (Add, ValType::I32) => Code::Add_r32_rm32,
        (Add, _) => Code::Add_r64_rm64,
        (Sub, ValType::I32) => Code::Sub_r32_rm32,
        (Sub, _) => Code::Sub_r64_rm64,
        (And, ValType::I32) => Code::And_r32_rm32,
        (And, _) => Code::And_r64_rm64,
        (Or, ValType::I32) => Code::Or_r32_rm32,
        (Or, _) => Code::Or_r64_rm64,
        (Xor, ValType::I32) => Code::Xor_r32_rm32,
        (Xor, _) => Code::Xor_r64_rm64,
        (Mul, ValType::I32) => Code::Imul_r32_rm32,
        (Mul, _) => Code::Imul_r64_rm64,
        _ => unreachable!("no two-register encoding for {op:?}"),
    }
}

fn arith_ri_code(op: ArithOp, ty: ValType) -> Code {
    use ArithOp::*;
    match (op, ty) {
        (Add, ValType::I32) => Code::Add_rm32_imm32,
        (Add, _) => Code::Add_rm64_imm32,
        (Sub, ValType::I32) => Code::Sub_rm32_imm32,
        (Sub, _) => Code::Sub_rm64_imm32,
        (And, ValType::I32) => Code::And_rm32_imm32,
        (And, _) => Code::And_rm64_imm32,
        (Or, ValType::I32) => Code::Or_rm32_imm32,
        (Or, _) => Code::Or_rm64_imm32,
        (Xor, ValType::I32) => Code::Xor_rm32_imm32,
        (Xor, _) => Code::Xor_rm64_imm32,
        _ => unreachable!("no register-immediate encoding for {op:?}"),
    }
}

fn shift_cl_code(op: ArithOp, ty: ValType) -> Code {
    use ArithOp::*;
    match (op, ty) {
        (Shl, ValType::I32) => Code::Shl_rm32_CL,
        (Shl, _) => Code::Shl_rm64_CL,
        (Shr, ValType::I32) => Code::Shr_rm32_CL,
        (Shr, _) => Code::Shr_rm64_CL,
        (Sar, ValType::I32) => Code::Sar_rm32_CL,
        (Sar, _) => Code::Sar_rm64_CL,
        (Rotl, ValType::I32) => Code::Rol_rm32_CL,
        (Rotl, _) => Code::Rol_rm64_CL,
        (Rotr, ValType::I32) => Code::Ror_rm32_CL,
        (Rotr, _) => Code::Ror_rm64_CL,
        _ => unreachable!("{op:?} is not a shift"),
    }
}

fn shift_imm_code(op: ArithOp, ty: ValType) -> Code {
    use ArithOp::*;
    match (op, ty) {
        (Shl, ValType::I32) => Code::Shl_rm32_imm8,
        (Shl, _) => Code::Shl_rm64_imm8,
        (Shr, ValType::I32) => Code::Shr_rm32_imm8,
        (Shr, _) => Code::Shr_rm64_imm8,
        (Sar, ValType::I32) => Code::Sar_rm32_imm8,
        (Sar, _) => Code::Sar_rm64_imm8,
        (Rotl, ValType::I32) => Code::Rol_rm32_imm8,
        (Rotl, _) => Code::Rol_rm64_imm8,
        (Rotr, ValType::I32) => Code::Ror_rm32_imm8,
        (Rotr, _) => Code::Ror_rm64_imm8,
        _ => unreachable!("{op:?} is not a shift"),
    }
}

fn is_shift(op: ArithOp) -> bool {
    matches!(
        op,
        ArithOp::Shl | ArithOp::Shr | ArithOp::Sar | ArithOp::Rotl | ArithOp::Rotr
    )
}

fn is_div(op: ArithOp) -> bool {
    matches!(
        op,
        ArithOp::Div | ArithOp::Divu | ArithOp::Rem | ArithOp::Remu
    )
}

fn vec_code(op: VecOp, elem: MemSize) -> Code {
    use MemSize::*;
    match (op, elem) {
        (VecOp::Add, S8) => Code::Paddb_xmm_xmmm128,
        (VecOp::Add, S16) => Code::Paddw_xmm_xmmm128,
        (VecOp::Add, S32) => Code::Paddd_xmm_xmmm128,
        (VecOp::Add, S64) => Code::Paddq_xmm_xmmm128,
        (VecOp::And, _) => Code::Pand_xmm_xmmm128,
        (VecOp::Or, _) => Code::Por_xmm_xmmm128,
        (VecOp::Xor, _) => Code::Pxor_xmm_xmmm128,
    }
}

impl HostBackend for X64Backend {
    fn supports(&self, op: &Op) -> bool {
        match op {
            // SSE2 has no general 128-bit immediate; only zeroing is
            // synthesized (pxor).
            Op::MovImm { ty, val, .. } => !ty.is_vector() || *val == 0,
            _ => true,
        }
    }

    fn constraints(&self, op: &Op) -> OpConstraints {
        let mut ct = OpConstraints::none();
        match op {
            Op::Ld { .. } => {
                ct.ins[0] = in_any(ImmPolicy::Never); // base
                ct.outs[0] = out_any();
            }
            Op::St { .. } => {
                ct.ins[0] = in_any(ImmPolicy::Imm32); // value
                ct.ins[1] = in_any(ImmPolicy::Never); // base
            }
            Op::Arith { op: aop, .. } if is_div(*aop) => {
                let out = match aop {
                    ArithOp::Div | ArithOp::Divu => RAX,
                    _ => RDX,
                };
                let other = if out == RAX { RDX } else { RAX };
                ct.ins[0] = in_regs(RegSet::single(RAX), ImmPolicy::Never);
                let mut divisor = RegSet::EMPTY;
                for reg in GP_ALLOC_ORDER {
                    if reg != RAX && reg != RDX {
                        divisor.set(reg);
                    }
                }
                ct.ins[1] = in_regs(divisor, ImmPolicy::Never);
                ct.outs[0] = out_fixed(out);
                ct.clobbers = RegSet::single(other);
            }
            Op::Arith { op: aop, .. } if is_shift(*aop) => {
                // The shifted value must stay clear of CL.
                let mut value = RegSet::EMPTY;
                for reg in GP_ALLOC_ORDER {
                    if reg != RCX {
                        value.set(reg);
                    }
                }
                ct.ins[0] = in_regs(value, ImmPolicy::Never);
                ct.ins[1] = in_regs(RegSet::single(RCX), ImmPolicy::Imm32);
                ct.outs[0] = out_alias(0);
            }
            Op::Arith { op: aop, .. } => {
                ct.ins[0] = in_any(ImmPolicy::Never);
                let imm = if *aop == ArithOp::Mul {
                    ImmPolicy::Never
                } else {
                    ImmPolicy::Imm32
                };
                ct.ins[1] = in_any(imm);
                ct.outs[0] = out_alias(0);
            }
            Op::Unary { op: uop, .. } => {
                ct.ins[0] = in_any(ImmPolicy::Never);
                ct.outs[0] = match uop {
                    UnaryOp::Neg | UnaryOp::Not | UnaryOp::Bswap => out_alias(0),
                    _ => out_any(),
                };
            }
            Op::Setcond { .. } => {
                ct.ins[0] = in_any(ImmPolicy::Never);
                ct.ins[1] = in_any(ImmPolicy::Imm32);
                ct.outs[0] = out_any();
            }
            Op::Movcond { .. } => {
                ct.ins[0] = in_any(ImmPolicy::Never);
                ct.ins[1] = in_any(ImmPolicy::Imm32);
                ct.ins[2] = in_any(ImmPolicy::Never); // true value, cmov source
                ct.ins[3] = in_any(ImmPolicy::Imm32); // false value, plain mov
                ct.outs[0] = OutCt {
                    regs: RegSet::EMPTY,
                    alias_in: None,
                    new_reg: true,
                };
            }
            Op::Brcond { .. } => {
                ct.ins[0] = in_any(ImmPolicy::Never);
                ct.ins[1] = in_any(ImmPolicy::Imm32);
            }
            Op::Add2 { .. } | Op::Sub2 { .. } => {
                ct.ins[0] = in_any(ImmPolicy::Never);
                ct.ins[1] = in_any(ImmPolicy::Never);
                ct.ins[2] = in_any(ImmPolicy::Imm32);
                ct.ins[3] = in_any(ImmPolicy::Imm32);
                ct.outs[0] = out_alias(0);
                ct.outs[1] = out_alias(1);
            }
            Op::VecArith { .. } => {
                ct.ins[0] = in_any(ImmPolicy::Never);
                ct.ins[1] = in_any(ImmPolicy::Never);
                ct.outs[0] = out_alias(0);
            }
            _ => {}
        }
        ct
    }

    fn reg_alloc_order(&self, vector: bool) -> &[HostReg] {
        if vector {
            &VEC_ALLOC_ORDER
        } else {
            &GP_ALLOC_ORDER
        }
    }

    fn reserved_regs(&self) -> RegSet {
        self.reserved
    }

    fn spill_frame(&self) -> (HostReg, i32, i32) {
        (RSP, FRAME_START, FRAME_SIZE)
    }

    fn call_clobber_regs(&self) -> RegSet {
        self.call_clobbers
    }

    fn call_arg_regs(&self) -> &[HostReg] {
        &CALL_ARG_REGS
    }

    fn call_ret_reg(&self) -> HostReg {
        RAX
    }

    fn mov(
        &self,
        buf: &mut CodeBuffer,
        ty: ValType,
        dst: HostReg,
        src: HostReg,
    ) -> TranslateResult<()> {
        let instr = if ty.is_vector() {
            Instruction::with2(
                Code::Movdqu_xmm_xmmm128,
                XMM[dst.id as usize],
                XMM[src.id as usize],
            )
        } else {
            let code = match ty {
                ValType::I32 => Code::Mov_r32_rm32,
                _ => Code::Mov_r64_rm64,
            };
            Instruction::with2(code, gpr(ty, dst), gpr(ty, src))
        }
        .map_err(|e| TranslateError::Encode(e.to_string()))?;
        self.emit(buf, instr)
    }

    fn movi(
        &self,
        buf: &mut CodeBuffer,
        ty: ValType,
        dst: HostReg,
        val: i64,
    ) -> TranslateResult<()> {
        if ty.is_vector() {
            if val != 0 {
                return Err(TranslateError::Encode(
                    "non-zero vector immediate".to_string(),
                ));
            }
            let xmm = XMM[dst.id as usize];
            let instr = Instruction::with2(Code::Pxor_xmm_xmmm128, xmm, xmm)
                .map_err(|e| TranslateError::Encode(e.to_string()))?;
            return self.emit(buf, instr);
        }
        // Shortest encoding that preserves the value: 32-bit mov
        // zero-extends, imm32 forms sign-extend, movabs covers the rest.
        let instr = if ty == ValType::I32 || (0..=u32::MAX as i64).contains(&val) {
            Instruction::with2(Code::Mov_r32_imm32, GP32[dst.id as usize], val as i32)
        } else if i32::try_from(val).is_ok() {
            Instruction::with2(Code::Mov_rm64_imm32, GP64[dst.id as usize], val as i32)
        } else {
            Instruction::with2(Code::Mov_r64_imm64, GP64[dst.id as usize], val as u64)
        }
        .map_err(|e| TranslateError::Encode(e.to_string()))?;
        self.emit(buf, instr)
    }

    fn ld(
        &self,
        buf: &mut CodeBuffer,
        ty: ValType,
        dst: HostReg,
        base: HostReg,
        offset: i32,
    ) -> TranslateResult<()> {
        let mem = MemoryOperand::with_base_displ(GP64[base.id as usize], offset as i64);
        let instr = if ty.is_vector() {
            Instruction::with2(Code::Movdqu_xmm_xmmm128, XMM[dst.id as usize], mem)
        } else {
            let code = match ty {
                ValType::I32 => Code::Mov_r32_rm32,
                _ => Code::Mov_r64_rm64,
            };
            Instruction::with2(code, gpr(ty, dst), mem)
        }
        .map_err(|e| TranslateError::Encode(e.to_string()))?;
        self.emit(buf, instr)
    }

    fn st(
        &self,
        buf: &mut CodeBuffer,
        ty: ValType,
        src: HostReg,
        base: HostReg,
        offset: i32,
    ) -> TranslateResult<()> {
        let mem = MemoryOperand::with_base_displ(GP64[base.id as usize], offset as i64);
        let instr = if ty.is_vector() {
            Instruction::with2(Code::Movdqu_xmmm128_xmm, mem, XMM[src.id as usize])
        } else {
            let code = match ty {
                ValType::I32 => Code::Mov_rm32_r32,
                _ => Code::Mov_rm64_r64,
            };
            Instruction::with2(code, mem, gpr(ty, src))
        }
        .map_err(|e| TranslateError::Encode(e.to_string()))?;
        self.emit(buf, instr)
    }

    fn emit_op(
        &self,
        buf: &mut CodeBuffer,
        lowered: &LoweredOp<'_>,
    ) -> TranslateResult<Option<RelocRequest>> {
        let enc = |e: iced_x86::IcedError| TranslateError::Encode(e.to_string());
        let reg_in = |i: usize| match lowered.ins[i] {
            Operand::Reg(reg) => reg,
            _ => unreachable!("operand {i} must be a register"),
        };

        match lowered.op {
            Op::Ld { ty, offset, .. } => {
                self.ld(buf, *ty, lowered.outs[0], reg_in(0), *offset)?;
            }
            Op::St { ty, offset, .. } => {
                let base = reg_in(1);
                match lowered.ins[0] {
                    Operand::Reg(src) => self.st(buf, *ty, src, base, *offset)?,
                    Operand::Imm(val) => {
                        let mem = MemoryOperand::with_base_displ(
                            GP64[base.id as usize],
                            *offset as i64,
                        );
                        let code = match ty {
                            ValType::I32 => Code::Mov_rm32_imm32,
                            _ => Code::Mov_rm64_imm32,
                        };
                        let instr = Instruction::with2(code, mem, val as i32).map_err(enc)?;
                        self.emit(buf, instr)?;
                    }
                    Operand::None => unreachable!("store without a value"),
                }
            }
            Op::Arith { op, ty, .. } if is_div(*op) => {
                let signed = matches!(op, ArithOp::Div | ArithOp::Rem);
                if signed {
                    let widen = match ty {
                        ValType::I32 => Code::Cdq,
                        _ => Code::Cqo,
                    };
                    self.emit(buf, Instruction::with(widen))?;
                } else {
                    let instr =
                        Instruction::with2(Code::Xor_r32_rm32, Register::EDX, Register::EDX)
                            .map_err(enc)?;
                    self.emit(buf, instr)?;
                }
                let code = match (signed, ty) {
                    (true, ValType::I32) => Code::Idiv_rm32,
                    (true, _) => Code::Idiv_rm64,
                    (false, ValType::I32) => Code::Div_rm32,
                    (false, _) => Code::Div_rm64,
                };
                let instr = Instruction::with1(code, gpr(*ty, reg_in(1))).map_err(enc)?;
                self.emit(buf, instr)?;
            }
            Op::Arith { op, ty, .. } if is_shift(*op) => {
                let dst = gpr(*ty, lowered.outs[0]);
                let instr = match lowered.ins[1] {
                    Operand::Reg(_) => {
                        Instruction::with2(shift_cl_code(*op, *ty), dst, Register::CL)
                    }
                    Operand::Imm(count) => {
                        let mask = if *ty == ValType::I32 { 31 } else { 63 };
                        Instruction::with2(shift_imm_code(*op, *ty), dst, (count & mask) as i32)
                    }
                    Operand::None => unreachable!("shift without a count"),
                }
                .map_err(enc)?;
                self.emit(buf, instr)?;
            }
            Op::Arith { op, ty, .. } => {
                let dst = gpr(*ty, lowered.outs[0]);
                let instr = match lowered.ins[1] {
                    Operand::Reg(b) => {
                        Instruction::with2(arith_rr_code(*op, *ty), dst, gpr(*ty, b))
                    }
                    Operand::Imm(val) => {
                        Instruction::with2(arith_ri_code(*op, *ty), dst, val as i32)
                    }
                    Operand::None => unreachable!("binary op without a second operand"),
                }
                .map_err(enc)?;
                self.emit(buf, instr)?;
            }
            Op::Unary { op, ty, .. } => {
                let out = lowered.outs[0];
                let instr = match op {
                    UnaryOp::Neg | UnaryOp::Not => {
                        let code = match (op, ty) {
                            (UnaryOp::Neg, ValType::I32) => Code::Neg_rm32,
                            (UnaryOp::Neg, _) => Code::Neg_rm64,
                            (UnaryOp::Not, ValType::I32) => Code::Not_rm32,
                            (UnaryOp::Not, _) => Code::Not_rm64,
                            _ => unreachable!(),
                        };
                        Instruction::with1(code, gpr(*ty, out))
                    }
                    UnaryOp::Bswap => {
                        let code = match ty {
                            ValType::I32 => Code::Bswap_r32,
                            _ => Code::Bswap_r64,
                        };
                        Instruction::with1(code, gpr(*ty, out))
                    }
                    ext => {
                        let src = reg_in(0);
                        let wide = *ty != ValType::I32;
                        let (code, src_reg) = match ext {
                            UnaryOp::Ext8s if wide => {
                                (Code::Movsx_r64_rm8, GP8[src.id as usize])
                            }
                            UnaryOp::Ext8s => (Code::Movsx_r32_rm8, GP8[src.id as usize]),
                            UnaryOp::Ext8u => (Code::Movzx_r32_rm8, GP8[src.id as usize]),
                            UnaryOp::Ext16s if wide => {
                                (Code::Movsx_r64_rm16, GP16[src.id as usize])
                            }
                            UnaryOp::Ext16s => (Code::Movsx_r32_rm16, GP16[src.id as usize]),
                            UnaryOp::Ext16u => (Code::Movzx_r32_rm16, GP16[src.id as usize]),
                            UnaryOp::Ext32s => (Code::Movsxd_r64_rm32, GP32[src.id as usize]),
                            UnaryOp::Ext32u => (Code::Mov_r32_rm32, GP32[src.id as usize]),
                            _ => unreachable!(),
                        };
                        let dst = match code {
                            Code::Movsx_r64_rm8 | Code::Movsx_r64_rm16 | Code::Movsxd_r64_rm32 => {
                                GP64[out.id as usize]
                            }
                            _ => GP32[out.id as usize],
                        };
                        Instruction::with2(code, dst, src_reg)
                    }
                }
                .map_err(enc)?;
                self.emit(buf, instr)?;
            }
            Op::Setcond { cond, ty, .. } => {
                self.emit_cmp(buf, *ty, reg_in(0), lowered.ins[1])?;
                let out = lowered.outs[0];
                let set = Instruction::with1(setcc_code(*cond), GP8[out.id as usize])
                    .map_err(enc)?;
                self.emit(buf, set)?;
                let widen = Instruction::with2(
                    Code::Movzx_r32_rm8,
                    GP32[out.id as usize],
                    GP8[out.id as usize],
                )
                .map_err(enc)?;
                self.emit(buf, widen)?;
            }
            Op::Movcond { cond, ty, .. } => {
                self.emit_cmp(buf, *ty, reg_in(0), lowered.ins[1])?;
                let out = lowered.outs[0];
                // False value first; the mov does not touch flags.
                match lowered.ins[3] {
                    Operand::Reg(vf) => self.mov(buf, *ty, out, vf)?,
                    Operand::Imm(val) => {
                        let code = match ty {
                            ValType::I32 => Code::Mov_r32_imm32,
                            _ => Code::Mov_rm64_imm32,
                        };
                        let instr =
                            Instruction::with2(code, gpr(*ty, out), val as i32).map_err(enc)?;
                        self.emit(buf, instr)?;
                    }
                    Operand::None => unreachable!("select without a false value"),
                }
                let cmov = Instruction::with2(
                    cmovcc_code(*cond, *ty),
                    gpr(*ty, out),
                    gpr(*ty, reg_in(2)),
                )
                .map_err(enc)?;
                self.emit(buf, cmov)?;
            }
            Op::Br { .. } => {
                return self.emit_branch(buf, Code::Jmp_rel32_64, lowered.branch);
            }
            Op::Brcond { cond, ty, .. } => {
                self.emit_cmp(buf, *ty, reg_in(0), lowered.ins[1])?;
                return self.emit_branch(buf, jcc_code(*cond), lowered.branch);
            }
            Op::Add2 { .. } | Op::Sub2 { .. } => {
                let carry = matches!(lowered.op, Op::Add2 { .. });
                for half in 0..2 {
                    let code_rr = match (carry, half) {
                        (true, 0) => Code::Add_r64_rm64,
                        (true, _) => Code::Adc_r64_rm64,
                        (false, 0) => Code::Sub_r64_rm64,
                        (false, _) => Code::Sbb_r64_rm64,
                    };
                    let code_ri = match (carry, half) {
                        (true, 0) => Code::Add_rm64_imm32,
                        (true, _) => Code::Adc_rm64_imm32,
                        (false, 0) => Code::Sub_rm64_imm32,
                        (false, _) => Code::Sbb_rm64_imm32,
                    };
                    let dst = GP64[lowered.outs[half].id as usize];
                    let instr = match lowered.ins[2 + half] {
                        Operand::Reg(b) => {
                            Instruction::with2(code_rr, dst, GP64[b.id as usize])
                        }
                        Operand::Imm(val) => Instruction::with2(code_ri, dst, val as i32),
                        Operand::None => unreachable!("pair op without a second operand"),
                    }
                    .map_err(enc)?;
                    self.emit(buf, instr)?;
                }
            }
            Op::VecArith { op, elem, .. } => {
                let instr = Instruction::with2(
                    vec_code(*op, *elem),
                    XMM[lowered.outs[0].id as usize],
                    XMM[reg_in(1).id as usize],
                )
                .map_err(enc)?;
                self.emit(buf, instr)?;
            }
            Op::ExitBlock { ret } => {
                self.movi(buf, ValType::I64, RAX, *ret as i64)?;
                self.emit(buf, Instruction::with(Code::Retnq))?;
            }
            other => unreachable!("{} is lowered by the driver", other.name()),
        }
        Ok(None)
    }

    fn patch_reloc(&self, buf: &mut CodeBuffer, reloc: &Relocation, target: usize) {
        match reloc.kind {
            RelocKind::Rel32 => {
                let disp = target as i64 - (reloc.offset as i64 + 4) + reloc.addend;
                buf.patch_i32(reloc.offset, i32::try_from(disp).expect("branch out of range"));
            }
        }
    }

    fn emit_call(&self, buf: &mut CodeBuffer, func: usize) -> TranslateResult<()> {
        self.movi(buf, ValType::I64, R10, func as i64)?;
        let instr = Instruction::with1(Code::Call_rm64, Register::R10)
            .map_err(|e| TranslateError::Encode(e.to_string()))?;
        self.emit(buf, instr)
    }

    fn guest_mem_helper(&self, is_load: bool) -> usize {
        if is_load {
            self.hooks.load
        } else {
            self.hooks.store
        }
    }
}
