//! Backward liveness analysis over the op stream.
//!
//! Computes, for every op, a bitmask of input positions whose value dies
//! at that op, and removes pure ops whose outputs are never used. The
//! register allocator consumes the dead bits to free registers as early
//! as possible.
//!
//! At an extended-basic-block boundary globals and whole-block locals
//! are live (a branch may land on code that reads them) and EBB-scoped
//! temps are dead. A call makes all globals live unless it is declared
//! not to read them.

use bumpalo::collections::Vec as BumpVec;

use crate::core::context::TranslationContext;
use crate::core::op::Op;
use crate::core::temp::TempKind;

pub(crate) fn analyze(ctx: &mut TranslationContext) {
    let nb_globals = ctx.nb_globals as usize;
    let temps = &ctx.temps;
    let pool = &ctx.pool;
    let stream = &mut ctx.stream;

    let mut dead = BumpVec::with_capacity_in(temps.len(), pool);
    dead.resize(temps.len(), true);

    let mark_bb_end = |dead: &mut BumpVec<'_, bool>| {
        for (index, temp) in temps.iter().enumerate() {
            dead[index] = if index < nb_globals {
                false
            } else {
                temp.kind != TempKind::LocalBlock
            };
        }
    };

    let mut refs = BumpVec::with_capacity_in(stream.len(), pool);
    let mut cur = stream.first();
    while let Some(r) = cur {
        refs.push(r);
        cur = stream.next(r);
    }

    for &r in refs.iter().rev() {
        let op = stream.get(r).clone();
        match &op {
            Op::Nop | Op::InsnStart { .. } => {}
            Op::Discard { temp } => {
                dead[temp.index()] = true;
            }
            _ => {
                let removable = match &op {
                    Op::Call { flags, .. } => flags.no_side_effects,
                    _ => !op.has_side_effects() && op.num_outputs() > 0,
                };
                if removable {
                    let mut all_dead = true;
                    op.for_each_output(|id| all_dead &= dead[id.index()]);
                    if all_dead {
                        stream.remove(r);
                        continue;
                    }
                }

                op.for_each_output(|id| dead[id.index()] = true);

                if op.is_bb_end() {
                    mark_bb_end(&mut dead);
                } else if op.clobbers_call_regs() {
                    let reads_globals = match &op {
                        Op::Call { flags, .. } => !flags.no_read_globals,
                        _ => true,
                    };
                    if reads_globals {
                        dead[..nb_globals].fill(false);
                    }
                }

                let mut life = 0u16;
                let mut position = 0u32;
                op.for_each_input(|id| {
                    assert!(position < 16, "op has too many inputs for dead bits");
                    if dead[id.index()] {
                        life |= 1 << position;
                    }
                    dead[id.index()] = false;
                    position += 1;
                });
                stream.set_life(r, life);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::{ArithOp, CallFlags, Cond};
    use crate::core::temp::{HostReg, ValType};

    fn ctx() -> TranslationContext {
        let mut ctx = TranslationContext::new();
        ctx.set_env_base(HostReg::gp(14), "env");
        ctx
    }

    #[test]
    fn last_use_sets_dead_bit() {
        let mut c = ctx();
        let g = c.global(ValType::I64, 0, "r0");
        let a = c.local_ebb(ValType::I64);
        let b = c.local_ebb(ValType::I64);
        c.mov(a, g);
        let r = c.arith(ArithOp::Add, b, a, a);
        c.mov(g, b);
        c.exit_block(0);
        analyze(&mut c);

        // `a` dies at the add; only the first of the repeated inputs
        // carries the dead bit so the register is freed once.
        assert_eq!(c.stream.life(r), 0b01);
    }

    #[test]
    fn dead_pure_op_chain_is_removed() {
        let mut c = ctx();
        let a = c.local_ebb(ValType::I64);
        let b = c.local_ebb(ValType::I64);
        c.movi(a, 7);
        c.arith(ArithOp::Add, b, a, a);
        c.exit_block(0);
        analyze(&mut c);

        // `b` is unused, so the add dies; that kills the movi too.
        assert_eq!(c.stream.collect_ops(), vec![Op::ExitBlock { ret: 0 }]);
    }

    #[test]
    fn stores_are_never_removed() {
        let mut c = ctx();
        let env = c.env_base().unwrap();
        let a = c.local_ebb(ValType::I64);
        c.movi(a, 7);
        c.st(a, env, 0x20);
        c.exit_block(0);
        analyze(&mut c);
        assert_eq!(c.stream.len(), 3);
    }

    #[test]
    fn globals_stay_live_across_branches() {
        let mut c = ctx();
        let g = c.global(ValType::I64, 0, "r0");
        let t = c.local_ebb(ValType::I64);
        let l = c.new_label();
        let r = c.mov(g, t);
        c.br(l);
        c.set_label(l);
        c.exit_block(0);
        analyze(&mut c);

        // Writing a global before a branch is not dead code.
        assert_eq!(c.stream.len(), 4);
        // `t` dies at its only use.
        assert_eq!(c.stream.life(r), 0b1);
    }

    #[test]
    fn ebb_temp_dies_at_label() {
        let mut c = ctx();
        let t = c.local_ebb(ValType::I64);
        let u = c.local(ValType::I64);
        let l = c.new_label();
        c.movi(t, 1);
        c.movi(u, 2);
        c.set_label(l);
        c.exit_block(0);
        analyze(&mut c);

        // The EBB temp's def is dead past the label, the block-local
        // temp's def is not.
        let ops = c.stream.collect_ops();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0], Op::MovImm { ty: ValType::I64, dst: u, val: 2 });
    }

    #[test]
    fn pure_call_with_unused_result_is_removed() {
        let mut c = ctx();
        let t = c.local_ebb(ValType::I64);
        let flags = CallFlags {
            no_side_effects: true,
            no_read_globals: true,
            no_write_globals: true,
        };
        c.call(0x4000, Some(t), vec![], flags);
        c.call(0x5000, None, vec![], CallFlags::default());
        c.exit_block(0);
        analyze(&mut c);

        let ops = c.stream.collect_ops();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], Op::Call { func: 0x5000, .. }));
    }

    #[test]
    fn call_keeps_globals_live() {
        let mut c = ctx();
        let g = c.global(ValType::I64, 0, "r0");
        let t = c.local_ebb(ValType::I64);
        c.movi(t, 3);
        c.mov(g, t);
        c.call(0x4000, None, vec![], CallFlags::default());
        c.exit_block(0);
        analyze(&mut c);
        // The write to the global feeds the call.
        assert_eq!(c.stream.len(), 4);
    }

    #[test]
    fn discard_kills_pending_uses() {
        let mut c = ctx();
        let t = c.local_ebb(ValType::I64);
        let u = c.local(ValType::I64);
        c.movi(t, 1);
        c.arith(ArithOp::Add, u, t, t);
        c.discard(u);
        c.exit_block(0);
        analyze(&mut c);

        // `u` would stay live across the unit end as a whole-block local,
        // but the discard kills it, taking the add and the movi with it.
        let ops = c.stream.collect_ops();
        assert_eq!(ops, vec![Op::Discard { temp: u }, Op::ExitBlock { ret: 0 }]);
    }

    #[test]
    fn brcond_inputs_counted_after_boundary() {
        let mut c = ctx();
        let t = c.local_ebb(ValType::I64);
        let u = c.local_ebb(ValType::I64);
        let l = c.new_label();
        c.movi(t, 1);
        c.movi(u, 2);
        let r = c.brcond(Cond::Eq, t, u, l);
        c.set_label(l);
        c.exit_block(0);
        analyze(&mut c);

        // EBB temps do not cross the branch; both inputs die at it.
        assert_eq!(c.stream.life(r), 0b11);
    }
}
