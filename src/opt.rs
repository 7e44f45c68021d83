//! Stream-level optimizer: constant folding, copy propagation and
//! branch simplification in a single forward walk.
//!
//! State is tracked per temporary and killed at every extended-basic-block
//! boundary, so the pass never needs a control-flow graph. The pass is
//! idempotent: running it a second time leaves the stream unchanged.

use crate::core::context::TranslationContext;
use crate::core::op::{ArithOp, Cond, Op, UnaryOp};
use crate::core::temp::{TempId, TempKind, ValType};

#[derive(Debug, Clone, Copy, PartialEq)]
enum TState {
    Undef,
    Const(i64),
    Copy(TempId),
}

fn wrap(ty: ValType, val: i64) -> i64 {
    match ty {
        ValType::I32 => val as i32 as i64,
        _ => val,
    }
}

fn eval_arith(op: ArithOp, ty: ValType, a: i64, b: i64) -> Option<i64> {
    let shift_mask = if ty == ValType::I32 { 31 } else { 63 };
    let val = match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::And => a & b,
        ArithOp::Or => a | b,
        ArithOp::Xor => a ^ b,
        ArithOp::Shl => wrap(ty, a) << (b as u32 & shift_mask),
        ArithOp::Shr => match ty {
            ValType::I32 => (a as u32 >> (b as u32 & 31)) as i64,
            _ => ((a as u64) >> (b as u32 & 63)) as i64,
        },
        ArithOp::Sar => wrap(ty, a) >> (b as u32 & shift_mask),
        ArithOp::Rotl => match ty {
            ValType::I32 => (a as u32).rotate_left(b as u32 & 31) as i64,
            _ => (a as u64).rotate_left(b as u32 & 63) as i64,
        },
        ArithOp::Rotr => match ty {
            ValType::I32 => (a as u32).rotate_right(b as u32 & 31) as i64,
            _ => (a as u64).rotate_right(b as u32 & 63) as i64,
        },
        // Division by zero and signed overflow trap at runtime; keep the op.
        ArithOp::Div | ArithOp::Rem if wrap(ty, b) == 0 => return None,
        ArithOp::Div | ArithOp::Rem
            if wrap(ty, b) == -1
                && wrap(ty, a)
                    == match ty {
                        ValType::I32 => i32::MIN as i64,
                        _ => i64::MIN,
                    } =>
        {
            return None
        }
        ArithOp::Div => wrap(ty, a) / wrap(ty, b),
        ArithOp::Rem => wrap(ty, a) % wrap(ty, b),
        ArithOp::Divu | ArithOp::Remu if b == 0 || wrap(ty, b) == 0 => return None,
        ArithOp::Divu => match ty {
            ValType::I32 => ((a as u32) / (b as u32)) as i64,
            _ => ((a as u64) / (b as u64)) as i64,
        },
        ArithOp::Remu => match ty {
            ValType::I32 => ((a as u32) % (b as u32)) as i64,
            _ => ((a as u64) % (b as u64)) as i64,
        },
    };
    Some(wrap(ty, val))
}

fn eval_unary(op: UnaryOp, ty: ValType, a: i64) -> i64 {
    let val = match op {
        UnaryOp::Neg => a.wrapping_neg(),
        UnaryOp::Not => !a,
        UnaryOp::Ext8s => a as i8 as i64,
        UnaryOp::Ext8u => a as u8 as i64,
        UnaryOp::Ext16s => a as i16 as i64,
        UnaryOp::Ext16u => a as u16 as i64,
        UnaryOp::Ext32s => a as i32 as i64,
        UnaryOp::Ext32u => a as u32 as i64,
        UnaryOp::Bswap => match ty {
            ValType::I32 => (a as u32).swap_bytes() as i64,
            _ => (a as u64).swap_bytes() as i64,
        },
    };
    wrap(ty, val)
}

struct Pass<'a> {
    temps: &'a [crate::core::temp::Temp],
    state: Vec<TState>,
    nb_globals: usize,
}

impl<'a> Pass<'a> {
    fn known_const(&self, id: TempId) -> Option<i64> {
        let temp = &self.temps[id.index()];
        if temp.kind == TempKind::Const {
            return Some(temp.val);
        }
        match self.state.get(id.index()) {
            Some(TState::Const(c)) => Some(*c),
            _ => None,
        }
    }

    fn canonical(&self, id: TempId) -> TempId {
        match self.state.get(id.index()) {
            Some(TState::Copy(t)) => *t,
            _ => id,
        }
    }

    /// Forget everything known about a temp, including copies of it.
    fn kill(&mut self, id: TempId) {
        let index = id.index();
        if index < self.state.len() {
            self.state[index] = TState::Undef;
        }
        for s in &mut self.state {
            if *s == TState::Copy(id) {
                *s = TState::Undef;
            }
        }
    }

    fn kill_globals(&mut self) {
        for index in 0..self.nb_globals {
            let id = TempId {
                index: index as u16,
                generation: 0,
            };
            self.state[index] = TState::Undef;
            for s in &mut self.state {
                if let TState::Copy(t) = s {
                    if t.index() == id.index() {
                        *s = TState::Undef;
                    }
                }
            }
        }
    }

    fn kill_all(&mut self) {
        self.state.fill(TState::Undef);
    }

    fn set(&mut self, id: TempId, state: TState) {
        self.state[id.index()] = state;
    }
}

/// Rewrite of one op decided by the pass.
enum Action {
    Keep,
    Replace(Op),
    Remove,
}

pub fn optimize(ctx: &mut TranslationContext) {
    let nb_globals = ctx.nb_globals as usize;
    let mut pass = Pass {
        temps: &ctx.temps,
        state: vec![TState::Undef; ctx.temps.len()],
        nb_globals,
    };
    let stream = &mut ctx.stream;

    let mut cursor = stream.first();
    while let Some(r) = cursor {
        let next = stream.next(r);

        // Route every input through the copy table first so repeated runs
        // see an already-canonical stream.
        stream
            .get_mut(r)
            .for_each_input_mut(|id| *id = pass.canonical(*id));

        let op = stream.get(r).clone();
        let action = fold_op(&mut pass, &op);
        match action {
            Action::Keep => update_state(&mut pass, &op),
            Action::Replace(new_op) => {
                update_state(&mut pass, &new_op);
                *stream.get_mut(r) = new_op;
            }
            Action::Remove => stream.remove(r),
        }
        cursor = next;
    }
}

fn fold_op(pass: &mut Pass<'_>, op: &Op) -> Action {
    match op {
        Op::Mov { ty, dst, src } => {
            if dst == src || pass.state[dst.index()] == TState::Copy(*src) {
                return Action::Remove;
            }
            if let Some(c) = pass.known_const(*src) {
                return Action::Replace(Op::MovImm {
                    ty: *ty,
                    dst: *dst,
                    val: wrap(*ty, c),
                });
            }
            Action::Keep
        }
        Op::MovImm { ty, dst, val } => {
            if pass.state[dst.index()] == TState::Const(wrap(*ty, *val)) {
                return Action::Remove;
            }
            Action::Keep
        }
        Op::Arith { op: aop, ty, dst, a, b } => {
            let ca = pass.known_const(*a);
            let cb = pass.known_const(*b);
            if let (Some(ca), Some(cb)) = (ca, cb) {
                if let Some(val) = eval_arith(*aop, *ty, ca, cb) {
                    return Action::Replace(Op::MovImm { ty: *ty, dst: *dst, val });
                }
            }
            // Algebraic identities with one constant operand.
            if let Some(cb) = cb {
                let identity = matches!(
                    (aop, wrap(*ty, cb)),
                    (ArithOp::Add, 0)
                        | (ArithOp::Sub, 0)
                        | (ArithOp::Or, 0)
                        | (ArithOp::Xor, 0)
                        | (ArithOp::Shl, 0)
                        | (ArithOp::Shr, 0)
                        | (ArithOp::Sar, 0)
                        | (ArithOp::Rotl, 0)
                        | (ArithOp::Rotr, 0)
                        | (ArithOp::Mul, 1)
                );
                if identity {
                    return Action::Replace(Op::Mov { ty: *ty, dst: *dst, src: *a });
                }
                let zero = matches!((aop, wrap(*ty, cb)), (ArithOp::And, 0) | (ArithOp::Mul, 0));
                if zero {
                    return Action::Replace(Op::MovImm { ty: *ty, dst: *dst, val: 0 });
                }
            }
            if a == b {
                match aop {
                    ArithOp::And | ArithOp::Or => {
                        return Action::Replace(Op::Mov { ty: *ty, dst: *dst, src: *a })
                    }
                    ArithOp::Sub | ArithOp::Xor => {
                        return Action::Replace(Op::MovImm { ty: *ty, dst: *dst, val: 0 })
                    }
                    _ => {}
                }
            }
            Action::Keep
        }
        Op::Unary { op: uop, ty, dst, src } => {
            if let Some(c) = pass.known_const(*src) {
                let val = eval_unary(*uop, *ty, c);
                return Action::Replace(Op::MovImm { ty: *ty, dst: *dst, val });
            }
            Action::Keep
        }
        Op::Setcond { cond, ty, dst, a, b } => {
            let outcome = match (*cond, pass.known_const(*a), pass.known_const(*b)) {
                (Cond::Never, _, _) => Some(false),
                (Cond::Always, _, _) => Some(true),
                (c, Some(ca), Some(cb)) => Some(c.eval(ca, cb, *ty)),
                (c, _, _) if a == b => Some(c.eval(0, 0, *ty)),
                _ => None,
            };
            match outcome {
                Some(v) => Action::Replace(Op::MovImm {
                    ty: *ty,
                    dst: *dst,
                    val: v as i64,
                }),
                None => Action::Keep,
            }
        }
        Op::Movcond { cond, ty, dst, a, b, vt, vf } => {
            let outcome = match (*cond, pass.known_const(*a), pass.known_const(*b)) {
                (Cond::Never, _, _) => Some(false),
                (Cond::Always, _, _) => Some(true),
                (c, Some(ca), Some(cb)) => Some(c.eval(ca, cb, *ty)),
                _ => None,
            };
            match outcome {
                Some(v) => Action::Replace(Op::Mov {
                    ty: *ty,
                    dst: *dst,
                    src: if v { *vt } else { *vf },
                }),
                None => Action::Keep,
            }
        }
        Op::Brcond { cond, ty, a, b, target } => {
            let outcome = match (*cond, pass.known_const(*a), pass.known_const(*b)) {
                (Cond::Never, _, _) => Some(false),
                (Cond::Always, _, _) => Some(true),
                (c, Some(ca), Some(cb)) => Some(c.eval(ca, cb, *ty)),
                _ => None,
            };
            match outcome {
                Some(true) => Action::Replace(Op::Br { target: *target }),
                Some(false) => Action::Remove,
                None => Action::Keep,
            }
        }
        _ => Action::Keep,
    }
}

fn update_state(pass: &mut Pass<'_>, op: &Op) {
    // Definitions invalidate old knowledge before recording new facts.
    op.for_each_output(|id| pass.kill(id));

    match op {
        Op::Mov { dst, src, .. } => {
            if pass.temps[src.index()].kind == TempKind::Const {
                pass.set(*dst, TState::Const(pass.temps[src.index()].val));
            } else {
                pass.set(*dst, TState::Copy(*src));
            }
        }
        Op::MovImm { ty, dst, val } => pass.set(*dst, TState::Const(wrap(*ty, *val))),
        Op::Call { flags, .. } => {
            if !flags.no_write_globals {
                pass.kill_globals();
            }
        }
        Op::GuestLd { .. } | Op::GuestSt { .. } => pass.kill_globals(),
        op if op.is_bb_end() => pass.kill_all(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::temp::HostReg;

    fn ctx() -> TranslationContext {
        let mut ctx = TranslationContext::new();
        ctx.set_env_base(HostReg::gp(14), "env");
        ctx
    }

    #[test]
    fn folds_constant_arithmetic() {
        let mut c = ctx();
        let t = c.local_ebb(ValType::I64);
        let u = c.local_ebb(ValType::I64);
        c.movi(t, 6);
        let seven = c.constant(ValType::I64, 7);
        c.arith(ArithOp::Mul, u, t, seven);
        optimize(&mut c);

        let ops = c.stream.collect_ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1], Op::MovImm { ty: ValType::I64, dst: u, val: 42 });
    }

    #[test]
    fn i32_arithmetic_wraps() {
        let mut c = ctx();
        let t = c.local_ebb(ValType::I32);
        let one = c.constant(ValType::I32, 1);
        let max = c.constant(ValType::I32, i32::MAX as i64);
        c.arith(ArithOp::Add, t, max, one);
        optimize(&mut c);

        let ops = c.stream.collect_ops();
        assert_eq!(
            ops[0],
            Op::MovImm { ty: ValType::I32, dst: t, val: i32::MIN as i64 }
        );
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let mut c = ctx();
        let t = c.local_ebb(ValType::I64);
        let one = c.constant(ValType::I64, 1);
        let zero = c.constant(ValType::I64, 0);
        c.arith(ArithOp::Div, t, one, zero);
        optimize(&mut c);
        assert!(matches!(
            c.stream.collect_ops()[0],
            Op::Arith { op: ArithOp::Div, .. }
        ));
    }

    #[test]
    fn copy_propagation_feeds_folding() {
        let mut c = ctx();
        let a = c.local_ebb(ValType::I64);
        let b = c.local_ebb(ValType::I64);
        let d = c.local_ebb(ValType::I64);
        c.movi(a, 5);
        c.mov(b, a);
        let three = c.constant(ValType::I64, 3);
        c.arith(ArithOp::Add, d, b, three);
        optimize(&mut c);

        let ops = c.stream.collect_ops();
        assert_eq!(*ops.last().unwrap(), Op::MovImm { ty: ValType::I64, dst: d, val: 8 });
    }

    #[test]
    fn branch_on_constant_condition() {
        let mut c = ctx();
        let l = c.new_label();
        let a = c.constant(ValType::I64, 1);
        let b = c.constant(ValType::I64, 2);
        c.brcond(Cond::Eq, a, b, l);
        c.brcond(Cond::Ne, a, b, l);
        c.set_label(l);
        optimize(&mut c);

        let ops = c.stream.collect_ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], Op::Br { target: l });
        assert_eq!(ops[1], Op::SetLabel { label: l });
    }

    #[test]
    fn state_dies_at_block_boundaries() {
        let mut c = ctx();
        let l = c.new_label();
        let a = c.local(ValType::I64);
        let d = c.local(ValType::I64);
        c.movi(a, 5);
        c.set_label(l);
        let one = c.constant(ValType::I64, 1);
        c.arith(ArithOp::Add, d, a, one);
        optimize(&mut c);

        // `a` may arrive from a branch with any value; no folding.
        assert!(matches!(
            c.stream.collect_ops()[2],
            Op::Arith { op: ArithOp::Add, .. }
        ));
    }

    #[test]
    fn calls_invalidate_globals_only() {
        let mut c = ctx();
        let g = c.global(ValType::I64, 0x10, "reg0");
        let t = c.local(ValType::I64);
        let d = c.local(ValType::I64);
        let e = c.local(ValType::I64);
        c.movi(g, 1);
        c.movi(t, 2);
        c.call(0x4000, None, vec![], crate::core::op::CallFlags::default());
        let zero = c.constant(ValType::I64, 0);
        c.arith(ArithOp::Add, d, g, zero);
        c.arith(ArithOp::Add, e, t, zero);
        optimize(&mut c);

        let ops = c.stream.collect_ops();
        // The global's value is unknown after the call, the local's is not.
        assert_eq!(ops[3], Op::Mov { ty: ValType::I64, dst: d, src: g });
        assert_eq!(ops[4], Op::MovImm { ty: ValType::I64, dst: e, val: 2 });
    }

    #[test]
    fn pass_is_idempotent() {
        let mut c = ctx();
        let a = c.local_ebb(ValType::I64);
        let b = c.local_ebb(ValType::I64);
        let d = c.local_ebb(ValType::I64);
        c.movi(a, 10);
        c.mov(b, a);
        let k = c.constant(ValType::I64, 32);
        c.arith(ArithOp::Add, d, b, k);
        let l = c.new_label();
        c.brcond(Cond::Ltu, d, k, l);
        c.set_label(l);

        optimize(&mut c);
        let once = c.stream.collect_ops();
        optimize(&mut c);
        assert_eq!(once, c.stream.collect_ops());
    }
}
