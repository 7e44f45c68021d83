//! The IR operation model.
//!
//! Ops are a closed tagged enum rather than an opcode byte plus raw
//! argument words: every operand is typed, and the code generator and
//! optimizer match exhaustively, so an op without a lowering path is a
//! compile error rather than a runtime fallback.

use super::label::LabelId;
use super::temp::{TempId, ValType};

/// Two-operand integer arithmetic, shifts and rotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Rotl,
    Rotr,
    Div,
    Divu,
    Rem,
    Remu,
}

/// Single-operand integer ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    Ext8s,
    Ext8u,
    Ext16s,
    Ext16u,
    Ext32s,
    Ext32u,
    Bswap,
}

/// Comparison conditions. The discriminants keep the classic bit layout:
/// bit 0 inverts, bit 1 marks signed, bit 2 marks unsigned, bit 3 together
/// with bit 0 swaps the equality sense, so invert/swap/unsigned are cheap
/// bit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Never = 0,
    Always = 1,
    Lt = 2,
    Ge = 3,
    Ltu = 4,
    Geu = 5,
    Eq = 8,
    Ne = 9,
    Le = 10,
    Gt = 11,
    Leu = 12,
    Gtu = 13,
}

impl Cond {
    fn from_bits(bits: u8) -> Cond {
        match bits {
            0 => Cond::Never,
            1 => Cond::Always,
            2 => Cond::Lt,
            3 => Cond::Ge,
            4 => Cond::Ltu,
            5 => Cond::Geu,
            8 => Cond::Eq,
            9 => Cond::Ne,
            10 => Cond::Le,
            11 => Cond::Gt,
            12 => Cond::Leu,
            13 => Cond::Gtu,
            _ => unreachable!("invalid condition bits {bits}"),
        }
    }

    /// Invert the sense of the comparison.
    pub fn invert(self) -> Cond {
        Cond::from_bits(self as u8 ^ 1)
    }

    /// Swap the operands of the comparison.
    pub fn swap(self) -> Cond {
        if self as u8 & 6 != 0 {
            Cond::from_bits(self as u8 ^ 9)
        } else {
            self
        }
    }

    pub fn is_unsigned(self) -> bool {
        self as u8 & 4 != 0
    }

    /// Evaluate the condition on constant operands, interpreted at the
    /// given width.
    pub fn eval(self, a: i64, b: i64, ty: ValType) -> bool {
        let (sa, sb, ua, ub) = match ty {
            ValType::I32 => (
                a as i32 as i64,
                b as i32 as i64,
                a as u32 as u64,
                b as u32 as u64,
            ),
            _ => (a, b, a as u64, b as u64),
        };
        match self {
            Cond::Never => false,
            Cond::Always => true,
            Cond::Eq => sa == sb,
            Cond::Ne => sa != sb,
            Cond::Lt => sa < sb,
            Cond::Ge => sa >= sb,
            Cond::Le => sa <= sb,
            Cond::Gt => sa > sb,
            Cond::Ltu => ua < ub,
            Cond::Geu => ua >= ub,
            Cond::Leu => ua <= ub,
            Cond::Gtu => ua > ub,
        }
    }
}

/// Access size for guest memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSize {
    S8,
    S16,
    S32,
    S64,
}

impl MemSize {
    pub const fn bytes(self) -> usize {
        match self {
            MemSize::S8 => 1,
            MemSize::S16 => 2,
            MemSize::S32 => 4,
            MemSize::S64 => 8,
        }
    }
}

/// Guest memory operation descriptor: size, extension and endianness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOp {
    pub size: MemSize,
    /// Sign-extend the loaded value to register width (loads only).
    pub sign_extend: bool,
    /// Guest endianness differs from the host; the helper swaps.
    pub byte_swap: bool,
    /// The access must be naturally aligned; the helper faults otherwise.
    pub aligned: bool,
}

impl MemOp {
    /// Pack into the helper-call immediate together with the MMU index.
    pub fn to_index_arg(self, mmu_idx: u16) -> i64 {
        let size = match self.size {
            MemSize::S8 => 0u8,
            MemSize::S16 => 1,
            MemSize::S32 => 2,
            MemSize::S64 => 3,
        };
        let bits = size
            | (self.sign_extend as u8) << 2
            | (self.byte_swap as u8) << 3
            | (self.aligned as u8) << 4;
        ((bits as i64) << 4) | mmu_idx as i64
    }
}

/// Vector arithmetic selector for [`Op::VecArith`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecOp {
    Add,
    And,
    Or,
    Xor,
}

/// Vector width parameter field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecWidth {
    V128,
}

/// Call behavior flags consumed by liveness and the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallFlags {
    /// The callee reads no machine-state globals.
    pub no_read_globals: bool,
    /// The callee writes no machine-state globals.
    pub no_write_globals: bool,
    /// The call may be deleted if its result is unused.
    pub no_side_effects: bool,
}

/// One IR operation. Operands are non-owning handles into the owning
/// context's temporary and label tables.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,
    /// Guest instruction boundary; carries the guest PC for fault
    /// attribution. Never removed by any pass.
    InsnStart { pc: u64 },
    /// Declare that a temporary's value will not be used again.
    Discard { temp: TempId },
    Mov {
        ty: ValType,
        dst: TempId,
        src: TempId,
    },
    MovImm {
        ty: ValType,
        dst: TempId,
        val: i64,
    },
    /// Load from a machine-state slot (base temp + byte offset).
    Ld {
        ty: ValType,
        dst: TempId,
        base: TempId,
        offset: i32,
    },
    /// Store to a machine-state slot.
    St {
        ty: ValType,
        src: TempId,
        base: TempId,
        offset: i32,
    },
    Arith {
        op: ArithOp,
        ty: ValType,
        dst: TempId,
        a: TempId,
        b: TempId,
    },
    Unary {
        op: UnaryOp,
        ty: ValType,
        dst: TempId,
        src: TempId,
    },
    /// dst = (a cond b) ? 1 : 0
    Setcond {
        cond: Cond,
        ty: ValType,
        dst: TempId,
        a: TempId,
        b: TempId,
    },
    /// dst = (a cond b) ? vt : vf
    Movcond {
        cond: Cond,
        ty: ValType,
        dst: TempId,
        a: TempId,
        b: TempId,
        vt: TempId,
        vf: TempId,
    },
    Br { target: LabelId },
    Brcond {
        cond: Cond,
        ty: ValType,
        a: TempId,
        b: TempId,
        target: LabelId,
    },
    /// Bind a label to the current position in the stream.
    SetLabel { label: LabelId },
    /// Guest memory load through the soft-MMU helper path.
    GuestLd {
        dst: TempId,
        addr: TempId,
        mem: MemOp,
        mmu_idx: u16,
    },
    /// Guest memory store through the soft-MMU helper path.
    GuestSt {
        src: TempId,
        addr: TempId,
        mem: MemOp,
        mmu_idx: u16,
    },
    /// Call a host helper. `func` is the absolute entry address.
    Call {
        func: usize,
        ret: Option<TempId>,
        args: Vec<TempId>,
        flags: CallFlags,
    },
    /// Double-word add: (dst_hi:dst_lo) = (a_hi:a_lo) + (b_hi:b_lo) with
    /// carry propagation between the halves.
    Add2 {
        dst_lo: TempId,
        dst_hi: TempId,
        a_lo: TempId,
        a_hi: TempId,
        b_lo: TempId,
        b_hi: TempId,
    },
    /// Double-word subtract with borrow propagation.
    Sub2 {
        dst_lo: TempId,
        dst_hi: TempId,
        a_lo: TempId,
        a_hi: TempId,
        b_lo: TempId,
        b_hi: TempId,
    },
    VecArith {
        op: VecOp,
        width: VecWidth,
        elem: MemSize,
        dst: TempId,
        a: TempId,
        b: TempId,
    },
    /// Leave the translation unit, handing `ret` back to the dispatch
    /// loop.
    ExitBlock { ret: u64 },
}

impl Op {
    /// Stable op name for logs and error reports.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::InsnStart { .. } => "insn_start",
            Op::Discard { .. } => "discard",
            Op::Mov { .. } => "mov",
            Op::MovImm { .. } => "movi",
            Op::Ld { .. } => "ld",
            Op::St { .. } => "st",
            Op::Arith { .. } => "arith",
            Op::Unary { .. } => "unary",
            Op::Setcond { .. } => "setcond",
            Op::Movcond { .. } => "movcond",
            Op::Br { .. } => "br",
            Op::Brcond { .. } => "brcond",
            Op::SetLabel { .. } => "set_label",
            Op::GuestLd { .. } => "guest_ld",
            Op::GuestSt { .. } => "guest_st",
            Op::Call { .. } => "call",
            Op::Add2 { .. } => "add2",
            Op::Sub2 { .. } => "sub2",
            Op::VecArith { .. } => "vec_arith",
            Op::ExitBlock { .. } => "exit_block",
        }
    }

    /// The op cannot be removed even when its outputs are unused.
    pub fn has_side_effects(&self) -> bool {
        match self {
            Op::St { .. }
            | Op::GuestLd { .. }
            | Op::GuestSt { .. }
            | Op::InsnStart { .. }
            | Op::ExitBlock { .. } => true,
            Op::Call { flags, .. } => !flags.no_side_effects,
            _ => false,
        }
    }

    /// The op terminates an extended basic block; the allocator saves
    /// globals and whole-block locals before it and drops EBB temps.
    pub fn is_bb_end(&self) -> bool {
        matches!(
            self,
            Op::Br { .. } | Op::Brcond { .. } | Op::SetLabel { .. } | Op::ExitBlock { .. }
        )
    }

    /// The op may invoke a helper and clobber call registers / globals.
    pub fn clobbers_call_regs(&self) -> bool {
        matches!(
            self,
            Op::Call { .. } | Op::GuestLd { .. } | Op::GuestSt { .. }
        )
    }

    /// Visit input operands in their fixed position order. The liveness
    /// bitmask indexes inputs by this order.
    pub fn for_each_input(&self, mut f: impl FnMut(TempId)) {
        match self {
            Op::Mov { src, .. } | Op::Unary { src, .. } => f(*src),
            Op::Ld { base, .. } => f(*base),
            Op::St { src, base, .. } => {
                f(*src);
                f(*base);
            }
            Op::Arith { a, b, .. }
            | Op::Setcond { a, b, .. }
            | Op::Brcond { a, b, .. }
            | Op::VecArith { a, b, .. } => {
                f(*a);
                f(*b);
            }
            Op::Movcond { a, b, vt, vf, .. } => {
                f(*a);
                f(*b);
                f(*vt);
                f(*vf);
            }
            Op::GuestLd { addr, .. } => f(*addr),
            Op::GuestSt { src, addr, .. } => {
                f(*src);
                f(*addr);
            }
            Op::Call { args, .. } => {
                for &a in args {
                    f(a);
                }
            }
            Op::Add2 {
                a_lo, a_hi, b_lo, b_hi, ..
            }
            | Op::Sub2 {
                a_lo, a_hi, b_lo, b_hi, ..
            } => {
                f(*a_lo);
                f(*a_hi);
                f(*b_lo);
                f(*b_hi);
            }
            _ => {}
        }
    }

    /// Visit input operands mutably, in the same order as
    /// [`Op::for_each_input`]. Used by passes that rewrite operands in
    /// place.
    pub fn for_each_input_mut(&mut self, mut f: impl FnMut(&mut TempId)) {
        match self {
            Op::Mov { src, .. } | Op::Unary { src, .. } => f(src),
            Op::Ld { base, .. } => f(base),
            Op::St { src, base, .. } => {
                f(src);
                f(base);
            }
            Op::Arith { a, b, .. }
            | Op::Setcond { a, b, .. }
            | Op::Brcond { a, b, .. }
            | Op::VecArith { a, b, .. } => {
                f(a);
                f(b);
            }
            Op::Movcond { a, b, vt, vf, .. } => {
                f(a);
                f(b);
                f(vt);
                f(vf);
            }
            Op::GuestLd { addr, .. } => f(addr),
            Op::GuestSt { src, addr, .. } => {
                f(src);
                f(addr);
            }
            Op::Call { args, .. } => {
                for a in args {
                    f(a);
                }
            }
            Op::Add2 {
                a_lo, a_hi, b_lo, b_hi, ..
            }
            | Op::Sub2 {
                a_lo, a_hi, b_lo, b_hi, ..
            } => {
                f(a_lo);
                f(a_hi);
                f(b_lo);
                f(b_hi);
            }
            _ => {}
        }
    }

    /// Visit output operands.
    pub fn for_each_output(&self, mut f: impl FnMut(TempId)) {
        match self {
            Op::Mov { dst, .. }
            | Op::MovImm { dst, .. }
            | Op::Ld { dst, .. }
            | Op::Arith { dst, .. }
            | Op::Unary { dst, .. }
            | Op::Setcond { dst, .. }
            | Op::Movcond { dst, .. }
            | Op::GuestLd { dst, .. }
            | Op::VecArith { dst, .. } => f(*dst),
            Op::Call { ret, .. } => {
                if let Some(r) = ret {
                    f(*r);
                }
            }
            Op::Add2 { dst_lo, dst_hi, .. } | Op::Sub2 { dst_lo, dst_hi, .. } => {
                f(*dst_lo);
                f(*dst_hi);
            }
            _ => {}
        }
    }

    pub fn num_inputs(&self) -> usize {
        let mut n = 0;
        self.for_each_input(|_| n += 1);
        n
    }

    pub fn num_outputs(&self) -> usize {
        let mut n = 0;
        self.for_each_output(|_| n += 1);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_invert() {
        assert_eq!(Cond::Eq.invert(), Cond::Ne);
        assert_eq!(Cond::Lt.invert(), Cond::Ge);
        assert_eq!(Cond::Gtu.invert(), Cond::Leu);
        assert_eq!(Cond::Never.invert(), Cond::Always);
    }

    #[test]
    fn cond_swap() {
        assert_eq!(Cond::Lt.swap(), Cond::Gt);
        assert_eq!(Cond::Geu.swap(), Cond::Leu);
        // Equality is symmetric.
        assert_eq!(Cond::Eq.swap(), Cond::Eq);
        assert_eq!(Cond::Ne.swap(), Cond::Ne);
    }

    #[test]
    fn cond_eval_signedness() {
        assert!(Cond::Lt.eval(-1, 0, ValType::I64));
        assert!(!Cond::Ltu.eval(-1, 0, ValType::I64));
        assert!(Cond::Gtu.eval(-1, 0, ValType::I64));
        // 32-bit truncation applies before comparison.
        assert!(Cond::Eq.eval(0x1_0000_0000, 0, ValType::I32));
        assert!(!Cond::Eq.eval(0x1_0000_0000, 0, ValType::I64));
    }

    #[test]
    fn memop_index_arg_packing() {
        let mem = MemOp {
            size: MemSize::S32,
            sign_extend: true,
            byte_swap: false,
            aligned: true,
        };
        let arg = mem.to_index_arg(3);
        assert_eq!(arg & 0xf, 3);
        assert_eq!((arg >> 4) & 0x3, 2);
        assert_eq!((arg >> 6) & 1, 1);
        assert_eq!((arg >> 7) & 1, 0);
        assert_eq!((arg >> 8) & 1, 1);
    }

    #[test]
    fn side_effect_and_bb_end_flags() {
        let t = TempId {
            index: 0,
            generation: 0,
        };
        let st = Op::St {
            ty: ValType::I64,
            src: t,
            base: t,
            offset: 0,
        };
        assert!(st.has_side_effects());
        assert!(!st.is_bb_end());

        let call = Op::Call {
            func: 0x1000,
            ret: None,
            args: vec![],
            flags: CallFlags {
                no_side_effects: true,
                ..Default::default()
            },
        };
        assert!(!call.has_side_effects());
        assert!(call.clobbers_call_regs());

        assert!(Op::ExitBlock { ret: 0 }.is_bb_end());
    }

    #[test]
    fn operand_visit_order() {
        let t = |i| TempId {
            index: i,
            generation: 0,
        };
        let op = Op::Movcond {
            cond: Cond::Eq,
            ty: ValType::I64,
            dst: t(0),
            a: t(1),
            b: t(2),
            vt: t(3),
            vf: t(4),
        };
        let mut ins = Vec::new();
        op.for_each_input(|id| ins.push(id.index));
        assert_eq!(ins, vec![1, 2, 3, 4]);
        assert_eq!(op.num_outputs(), 1);
    }
}
