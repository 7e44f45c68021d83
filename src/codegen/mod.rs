//! One-pass register allocation and code generation.
//!
//! The stream is walked once, front to back. Values are kept in host
//! registers as long as possible and spilled to the frame only on
//! pressure; liveness dead bits free registers at the last use of each
//! temporary. There is no second scheduling or fixup pass: forward
//! branches are patched through the relocation queue when their label is
//! bound.

mod liveness;

use core::ops::Range;

use log::{debug, trace};

use crate::core::context::TranslationContext;
use crate::core::label::{LabelId, Relocation};
use crate::core::op::Op;
use crate::core::temp::{
    HostReg, RegSet, TempId, TempKind, ValLocation, ValType, NB_REGS,
};
use crate::core::{TranslateError, TranslateResult};
use crate::host::{BranchTarget, CodeBuffer, HostBackend, ImmPolicy, InCt, LoweredOp, Operand};
use crate::opt;
use crate::registry::TranslatedBlock;

/// Translate the context's op stream into host code.
///
/// Runs the optimizer, liveness analysis and the one-pass allocator in
/// sequence. On success the generated code occupies the buffer from its
/// entry offset to the current offset and the returned descriptor can be
/// registered for dispatch.
pub fn generate<B: HostBackend>(
    ctx: &mut TranslationContext,
    backend: &B,
    buf: &mut CodeBuffer,
    pc_range: Range<u64>,
    flags: u32,
) -> TranslateResult<TranslatedBlock> {
    opt::optimize(ctx);
    liveness::analyze(ctx);

    let (frame_base, frame_start, frame_size) = backend.spill_frame();
    ctx.set_frame(frame_base, frame_start, frame_size);

    let entry = buf.offset();
    debug!(
        "generating unit pc={:#x}..{:#x} flags={:#x}, {} ops",
        pc_range.start,
        pc_range.end,
        flags,
        ctx.stream.len()
    );

    let mut gen = Gen {
        ctx,
        backend,
        buf,
        regs: [None; NB_REGS],
        insn_map: Vec::new(),
        entry,
    };
    gen.run()?;

    assert!(
        gen.ctx.labels.all_resolved(),
        "unbound label at end of translation"
    );

    let code_len = gen.buf.offset() - entry;
    Ok(TranslatedBlock {
        pc_range,
        flags,
        entry_offset: entry,
        code_len,
        insn_map: gen.insn_map,
    })
}

struct Gen<'a, B: HostBackend> {
    ctx: &'a mut TranslationContext,
    backend: &'a B,
    buf: &'a mut CodeBuffer,
    /// Which temporary currently owns each host register.
    regs: [Option<TempId>; NB_REGS],
    insn_map: Vec<(u64, u32)>,
    entry: usize,
}

impl<'a, B: HostBackend> Gen<'a, B> {
    fn run(&mut self) -> TranslateResult<()> {
        let mut cursor = self.ctx.stream.first();
        while let Some(r) = cursor {
            cursor = self.ctx.stream.next(r);
            let op = self.ctx.stream.get(r).clone();
            let life = self.ctx.stream.life(r);
            trace!("alloc {} life={:#b}", op.name(), life);

            match op {
                Op::Nop => {}
                Op::InsnStart { pc } => {
                    self.insn_map.push((pc, (self.buf.offset() - self.entry) as u32));
                }
                Op::Discard { temp } => self.temp_dead(temp),
                Op::Mov { ty, dst, src } => self.alloc_mov(ty, dst, src, life)?,
                Op::MovImm { dst, val, .. } => self.alloc_movi(dst, val)?,
                Op::SetLabel { label } => self.alloc_set_label(label)?,
                Op::Call { func, ref ret, ref args, flags } => {
                    self.alloc_call(func, *ret, args, flags, life)?
                }
                Op::GuestLd { dst, addr, mem, mmu_idx } => {
                    let helper = self.backend.guest_mem_helper(true);
                    self.alloc_guest_access(helper, Some(dst), None, addr, mem, mmu_idx, life)?
                }
                Op::GuestSt { src, addr, mem, mmu_idx } => {
                    let helper = self.backend.guest_mem_helper(false);
                    self.alloc_guest_access(helper, None, Some(src), addr, mem, mmu_idx, life)?
                }
                _ => self.alloc_op(&op, life)?,
            }
        }
        Ok(())
    }

    // --- register bookkeeping --------------------------------------------

    /// Pick a register from `allowed` (empty means any in `bank`),
    /// avoiding `excluded`, spilling an owner if every candidate is
    /// taken.
    fn alloc_reg(&mut self, allowed: RegSet, excluded: RegSet, bank: u8) -> TranslateResult<HostReg> {
        let reserved = self.backend.reserved_regs();
        let order = self.backend.reg_alloc_order(bank == 1);

        let usable = |reg: HostReg| {
            let in_set = if allowed.is_empty() {
                reg.bank == bank
            } else {
                allowed.contains(reg)
            };
            in_set && !excluded.contains(reg) && !reserved.contains(reg)
        };

        for &reg in order {
            if usable(reg) && self.regs[reg.linear()].is_none() {
                return Ok(reg);
            }
        }
        for &reg in order {
            if usable(reg) {
                self.free_reg(reg)?;
                return Ok(reg);
            }
        }
        panic!("no allocatable register in constraint set");
    }

    /// Free a register, spilling the owning temporary if its value is
    /// not in memory. The register keeps its bits until overwritten, so
    /// operands already resolved to it stay valid for the current op.
    fn free_reg(&mut self, reg: HostReg) -> TranslateResult<()> {
        if let Some(id) = self.regs[reg.linear()] {
            let temp = self.ctx.temp(id);
            debug_assert_eq!(temp.loc, ValLocation::Reg(reg));
            if !temp.mem_coherent {
                self.ensure_slot(id);
                let t = self.ctx.temp(id);
                let (ty, base, offset) = (t.ty, t.mem_base, t.mem_offset);
                self.backend.st(self.buf, ty, reg, base, offset)?;
            }
            let temp = self.ctx.temp_mut(id);
            temp.loc = ValLocation::Mem;
            temp.mem_coherent = true;
            self.regs[reg.linear()] = None;
        }
        Ok(())
    }

    fn ensure_slot(&mut self, id: TempId) {
        if !self.ctx.temp(id).mem_allocated {
            let size = self.ctx.temp(id).ty.size_bytes();
            let (base, offset) = self.ctx.alloc_frame_slot(size);
            let temp = self.ctx.temp_mut(id);
            temp.mem_base = base;
            temp.mem_offset = offset;
            temp.mem_allocated = true;
        }
    }

    /// Drop a temporary's current value.
    fn temp_dead(&mut self, id: TempId) {
        let temp = self.ctx.temp(id);
        if temp.is_fixed() || temp.kind == TempKind::Const {
            return;
        }
        if let ValLocation::Reg(reg) = temp.loc {
            self.regs[reg.linear()] = None;
        }
        self.ctx.temp_mut(id).loc = ValLocation::Dead;
    }

    /// Force a temporary's value into its backing slot and demote it to
    /// memory.
    fn temp_save(&mut self, id: TempId, allocated: RegSet) -> TranslateResult<()> {
        let temp = self.ctx.temp(id);
        if temp.is_fixed() || temp.kind == TempKind::Const {
            return Ok(());
        }
        match temp.loc {
            ValLocation::Reg(reg) => self.free_reg(reg)?,
            ValLocation::Dead => self.ctx.temp_mut(id).loc = ValLocation::Mem,
            ValLocation::Const(val) => {
                let bank = self.ctx.temp(id).ty.bank();
                let reg = self.alloc_reg(RegSet::EMPTY, allocated, bank)?;
                self.ensure_slot(id);
                let t = self.ctx.temp(id);
                let (ty, base, offset) = (t.ty, t.mem_base, t.mem_offset);
                self.backend.movi(self.buf, ty, reg, val)?;
                self.backend.st(self.buf, ty, reg, base, offset)?;
                let temp = self.ctx.temp_mut(id);
                temp.loc = ValLocation::Mem;
                temp.mem_coherent = true;
            }
            ValLocation::Mem => {}
        }
        Ok(())
    }

    /// Store every global to its machine-state slot and drop it from
    /// registers; following code may change any of them.
    fn save_globals(&mut self, allocated: RegSet) -> TranslateResult<()> {
        for index in 0..self.ctx.nb_globals {
            self.temp_save(TempId { index, generation: 0 }, allocated)?;
        }
        Ok(())
    }

    /// Store globals without dropping register copies; the following
    /// code reads but does not modify them.
    fn sync_globals(&mut self, allocated: RegSet) -> TranslateResult<()> {
        for index in 0..self.ctx.nb_globals {
            let id = TempId { index, generation: 0 };
            let temp = self.ctx.temp(id);
            if temp.is_fixed() {
                continue;
            }
            match temp.loc {
                ValLocation::Reg(reg) if !temp.mem_coherent => {
                    let (ty, base, offset) = (temp.ty, temp.mem_base, temp.mem_offset);
                    self.backend.st(self.buf, ty, reg, base, offset)?;
                    self.ctx.temp_mut(id).mem_coherent = true;
                }
                ValLocation::Const(_) => self.temp_save(id, allocated)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Extended-basic-block boundary: whole-block locals are saved, EBB
    /// temps die, globals go back to their slots.
    fn bb_end(&mut self, allocated: RegSet) -> TranslateResult<()> {
        let generation = self.ctx.current_generation();
        for index in self.ctx.nb_globals..self.ctx.temps.len() as u16 {
            let id = TempId { index, generation };
            match self.ctx.temp(id).kind {
                TempKind::LocalBlock => self.temp_save(id, allocated)?,
                TempKind::LocalEbb => self.temp_dead(id),
                TempKind::Const => {}
                TempKind::Fixed | TempKind::Global => {
                    unreachable!("permanent temp above the global boundary")
                }
            }
        }
        self.save_globals(allocated)
    }

    // --- per-op allocation ----------------------------------------------

    fn alloc_mov(&mut self, ty: ValType, dst: TempId, src: TempId, life: u16) -> TranslateResult<()> {
        let src_t = self.ctx.temp(src).clone();
        let dst_t = self.ctx.temp(dst).clone();
        let src_dead = life & 1 != 0;

        match src_t.loc {
            ValLocation::Reg(src_reg) => {
                if src_dead && !src_t.is_fixed() && !dst_t.is_fixed() {
                    // Retarget the register instead of copying.
                    if let ValLocation::Reg(old) = dst_t.loc {
                        self.regs[old.linear()] = None;
                    }
                    self.regs[src_reg.linear()] = None;
                    self.ctx.temp_mut(src).loc = ValLocation::Dead;
                    self.bind_output(dst, src_reg);
                } else {
                    let reg = match dst_t.loc {
                        ValLocation::Reg(reg) => reg,
                        _ => self.alloc_reg(RegSet::EMPTY, self.backend.reserved_regs(), ty.bank())?,
                    };
                    if src_reg != reg {
                        self.backend.mov(self.buf, ty, reg, src_reg)?;
                    }
                    self.bind_output(dst, reg);
                }
            }
            ValLocation::Mem => {
                let reg = match dst_t.loc {
                    ValLocation::Reg(reg) => reg,
                    _ => self.alloc_reg(RegSet::EMPTY, self.backend.reserved_regs(), ty.bank())?,
                };
                self.backend.ld(self.buf, ty, reg, src_t.mem_base, src_t.mem_offset)?;
                self.bind_output(dst, reg);
            }
            ValLocation::Const(val) => {
                if dst_t.is_fixed() {
                    let reg = match dst_t.loc {
                        ValLocation::Reg(reg) => reg,
                        _ => unreachable!("fixed temp without a register"),
                    };
                    self.backend.movi(self.buf, ty, reg, val)?;
                } else {
                    self.alloc_movi(dst, val)?;
                }
            }
            ValLocation::Dead => panic!("mov from dead temporary"),
        }
        Ok(())
    }

    fn alloc_movi(&mut self, dst: TempId, val: i64) -> TranslateResult<()> {
        let dst_t = self.ctx.temp(dst).clone();
        if dst_t.is_fixed() {
            let reg = match dst_t.loc {
                ValLocation::Reg(reg) => reg,
                _ => unreachable!("fixed temp without a register"),
            };
            self.backend.movi(self.buf, dst_t.ty, reg, val)?;
        } else {
            // Constants stay virtual until a use forces materialization.
            if let ValLocation::Reg(old) = dst_t.loc {
                self.regs[old.linear()] = None;
            }
            let temp = self.ctx.temp_mut(dst);
            temp.loc = ValLocation::Const(val);
            temp.mem_coherent = false;
        }
        Ok(())
    }

    fn alloc_set_label(&mut self, label: LabelId) -> TranslateResult<()> {
        // Register state must reach its canonical shape before the
        // incoming branches' target address is fixed.
        self.bb_end(self.backend.reserved_regs())?;
        let offset = self.buf.offset();
        let relocs = self.ctx.labels.resolve(label, offset);
        for reloc in relocs {
            self.backend.patch_reloc(self.buf, &reloc, offset);
        }
        Ok(())
    }

    fn alloc_op(&mut self, op: &Op, life: u16) -> TranslateResult<()> {
        if !self.backend.supports(op) {
            return Err(TranslateError::Unsupported { op: op.name() });
        }
        let ct = self.backend.constraints(op);

        let mut inputs: [TempId; 4] = [TempId { index: 0, generation: 0 }; 4];
        let mut n_ins = 0usize;
        op.for_each_input(|id| {
            inputs[n_ins] = id;
            n_ins += 1;
        });

        let mut allocated = self.backend.reserved_regs();
        let mut ins = [Operand::None; 4];
        let mut input_regs = RegSet::EMPTY;
        for i in 0..n_ins {
            let aliased = ct.outs.iter().any(|o| o.alias_in == Some(i as u8));
            let dead = life & (1 << i) != 0;
            ins[i] = self.load_input(inputs[i], ct.ins[i], &mut allocated, dead, aliased)?;
            if let Operand::Reg(reg) = ins[i] {
                input_regs.set(reg);
            }
        }

        let mut outs = [HostReg::gp(0); 2];
        let mut n_outs = 0usize;
        let mut out_ids: [TempId; 2] = [TempId { index: 0, generation: 0 }; 2];
        op.for_each_output(|id| {
            out_ids[n_outs] = id;
            n_outs += 1;
        });

        if op.is_bb_end() {
            debug_assert_eq!(n_outs, 0);
            self.bb_end(allocated)?;
        } else {
            for i in 0..n_ins {
                if life & (1 << i) != 0 {
                    self.temp_dead(inputs[i]);
                }
            }

            // Registers the encoding destroys are spilled up front.
            for linear in 0..NB_REGS {
                let reg = HostReg::from_linear(linear);
                if ct.clobbers.contains(reg) {
                    self.free_reg(reg)?;
                }
            }

            let mut allocated_out = self.backend.reserved_regs().union(ct.clobbers);
            for k in 0..n_outs {
                let out_ct = ct.outs[k];
                let id = out_ids[k];
                let reg = if let Some(i) = out_ct.alias_in {
                    match ins[i as usize] {
                        Operand::Reg(reg) => reg,
                        _ => unreachable!("aliased input not in a register"),
                    }
                } else {
                    let excluded = if out_ct.new_reg {
                        allocated_out.union(input_regs)
                    } else {
                        allocated_out
                    };
                    let temp = self.ctx.temp(id);
                    if temp.is_fixed() {
                        match temp.loc {
                            ValLocation::Reg(reg)
                                if out_ct.regs.is_empty() || out_ct.regs.contains(reg) =>
                            {
                                outs[k] = reg;
                                allocated_out.set(reg);
                                continue;
                            }
                            _ => {}
                        }
                    }
                    let bank = self.ctx.temp(id).ty.bank();
                    self.alloc_reg(out_ct.regs, excluded, bank)?
                };
                allocated_out.set(reg);
                self.bind_output(id, reg);
                outs[k] = reg;
            }
        }

        // Branch targets: backward branches encode directly, forward
        // branches get a placeholder and a queued relocation.
        let target = match op {
            Op::Br { target } | Op::Brcond { target, .. } => Some(*target),
            _ => None,
        };
        let branch = match target {
            None => BranchTarget::None,
            Some(l) => match self.ctx.labels.address(l) {
                Some(addr) => BranchTarget::Resolved(addr),
                None => BranchTarget::Pending,
            },
        };

        let lowered = LoweredOp { op, ins, outs, branch };
        if let Some(request) = self.backend.emit_op(self.buf, &lowered)? {
            let label = target.expect("relocation without a branch target");
            self.ctx.labels.add_reloc(
                label,
                Relocation {
                    offset: request.offset,
                    kind: request.kind,
                    addend: request.addend,
                },
            );
        }

        // A fixed destination the constraint could not honor gets its
        // value moved in afterwards.
        for k in 0..n_outs {
            let temp = self.ctx.temp(out_ids[k]);
            if temp.is_fixed() {
                if let ValLocation::Reg(home) = temp.loc {
                    if home != outs[k] {
                        let ty = temp.ty;
                        self.backend.mov(self.buf, ty, home, outs[k])?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Bring one input operand into a form the encoding accepts.
    fn load_input(
        &mut self,
        id: TempId,
        ct: InCt,
        allocated: &mut RegSet,
        dead: bool,
        aliased: bool,
    ) -> TranslateResult<Operand> {
        let temp = self.ctx.temp(id).clone();
        let bank = temp.ty.bank();

        let const_val = match temp.loc {
            ValLocation::Const(val) => Some(val),
            _ => None,
        };
        if let Some(val) = const_val {
            let imm_ok = match ct.imm {
                ImmPolicy::Never => false,
                ImmPolicy::Imm32 => i32::try_from(val).is_ok(),
                ImmPolicy::Any => true,
            };
            if imm_ok && !aliased {
                return Ok(Operand::Imm(val));
            }
        }

        let mut reg = match temp.loc {
            ValLocation::Reg(reg) => reg,
            ValLocation::Mem => {
                debug_assert!(temp.mem_allocated, "read of uninitialized temporary");
                let reg = self.alloc_reg(ct.regs, *allocated, bank)?;
                self.backend.ld(self.buf, temp.ty, reg, temp.mem_base, temp.mem_offset)?;
                if temp.kind != TempKind::Const {
                    self.bind_input(id, reg, true);
                }
                reg
            }
            ValLocation::Const(val) => {
                let reg = self.alloc_reg(ct.regs, *allocated, bank)?;
                self.backend.movi(self.buf, temp.ty, reg, val)?;
                // Interned constants are rematerialized per use and never
                // own a register; propagated constants do.
                if temp.kind != TempKind::Const {
                    self.bind_input(id, reg, false);
                }
                reg
            }
            ValLocation::Dead => panic!("use of dead temporary"),
        };

        // A register an output will overwrite must not carry a value that
        // outlives this op.
        let needs_copy = aliased && (temp.is_fixed() || !dead);
        let satisfied = ct.regs.is_empty() || ct.regs.contains(reg);
        if needs_copy || !satisfied {
            let fresh = self.alloc_reg(ct.regs, *allocated, bank)?;
            self.backend.mov(self.buf, temp.ty, fresh, reg)?;
            reg = fresh;
        }

        allocated.set(reg);
        Ok(Operand::Reg(reg))
    }

    fn bind_input(&mut self, id: TempId, reg: HostReg, coherent: bool) {
        let temp = self.ctx.temp_mut(id);
        temp.loc = ValLocation::Reg(reg);
        temp.mem_coherent = coherent;
        self.regs[reg.linear()] = Some(id);
    }

    /// Point a (non-fixed) temporary at a freshly written register.
    fn bind_output(&mut self, id: TempId, reg: HostReg) {
        let temp = self.ctx.temp(id);
        if temp.is_fixed() {
            return;
        }
        if let ValLocation::Reg(old) = temp.loc {
            self.regs[old.linear()] = None;
        }
        let temp = self.ctx.temp_mut(id);
        temp.loc = ValLocation::Reg(reg);
        temp.mem_coherent = false;
        self.regs[reg.linear()] = Some(id);
    }

    fn alloc_call(
        &mut self,
        func: usize,
        ret: Option<TempId>,
        args: &[TempId],
        flags: crate::core::op::CallFlags,
        life: u16,
    ) -> TranslateResult<()> {
        let arg_regs = self.backend.call_arg_regs();
        assert!(
            args.len() <= arg_regs.len(),
            "call with {} arguments exceeds the register convention",
            args.len()
        );

        let mut allocated = self.backend.reserved_regs();
        for (i, &arg) in args.iter().enumerate() {
            let reg = arg_regs[i];
            self.free_reg(reg)?;
            self.place_in_reg(arg, reg)?;
            allocated.set(reg);
        }

        for (i, &arg) in args.iter().enumerate() {
            if life & (1 << i) != 0 {
                self.temp_dead(arg);
            }
        }

        for linear in 0..NB_REGS {
            let reg = HostReg::from_linear(linear);
            if self.backend.call_clobber_regs().contains(reg) {
                self.free_reg(reg)?;
            }
        }

        if flags.no_write_globals {
            self.sync_globals(allocated)?;
        } else {
            self.save_globals(allocated)?;
        }

        self.backend.emit_call(self.buf, func)?;

        if let Some(ret) = ret {
            let reg = self.backend.call_ret_reg();
            debug_assert!(self.regs[reg.linear()].is_none());
            let temp = self.ctx.temp(ret);
            if temp.is_fixed() {
                if let ValLocation::Reg(home) = temp.loc {
                    if home != reg {
                        let ty = temp.ty;
                        self.backend.mov(self.buf, ty, home, reg)?;
                    }
                }
            } else {
                self.bind_output(ret, reg);
            }
        }
        Ok(())
    }

    /// Copy a temporary's current value into a specific register,
    /// without disturbing its location tracking.
    fn place_in_reg(&mut self, id: TempId, reg: HostReg) -> TranslateResult<()> {
        let temp = self.ctx.temp(id).clone();
        match temp.loc {
            ValLocation::Reg(cur) => {
                if cur != reg {
                    self.backend.mov(self.buf, temp.ty, reg, cur)?;
                }
            }
            ValLocation::Mem => {
                debug_assert!(temp.mem_allocated, "read of uninitialized temporary");
                self.backend.ld(self.buf, temp.ty, reg, temp.mem_base, temp.mem_offset)?;
            }
            ValLocation::Const(val) => {
                self.backend.movi(self.buf, temp.ty, reg, val)?;
            }
            ValLocation::Dead => panic!("use of dead temporary"),
        }
        Ok(())
    }

    /// Guest memory access, lowered as a helper call:
    /// `helper(env, addr, [store value], packed memop and mmu index)`.
    fn alloc_guest_access(
        &mut self,
        helper: usize,
        load_dst: Option<TempId>,
        store_src: Option<TempId>,
        addr: TempId,
        mem: crate::core::op::MemOp,
        mmu_idx: u16,
        life: u16,
    ) -> TranslateResult<()> {
        let env = self
            .ctx
            .env_base()
            .expect("guest access without a machine-state base");
        let arg_regs = self.backend.call_arg_regs();
        let oi = mem.to_index_arg(mmu_idx);

        let mut allocated = self.backend.reserved_regs();
        let mut slot = 0usize;
        let mut args: [Option<TempId>; 3] = [Some(env), Some(addr), None];
        if let Some(src) = store_src {
            args[2] = Some(src);
        }
        for id in args.into_iter().flatten() {
            let reg = arg_regs[slot];
            self.free_reg(reg)?;
            self.place_in_reg(id, reg)?;
            allocated.set(reg);
            slot += 1;
        }
        let oi_reg = arg_regs[slot];
        self.free_reg(oi_reg)?;
        self.backend.movi(self.buf, ValType::I64, oi_reg, oi)?;
        allocated.set(oi_reg);

        // Dead-input bits follow the op's input order.
        let mut pos = 0;
        if let Some(src) = store_src {
            if life & (1 << pos) != 0 {
                self.temp_dead(src);
            }
            pos += 1;
        }
        if life & (1 << pos) != 0 {
            self.temp_dead(addr);
        }

        for linear in 0..NB_REGS {
            let reg = HostReg::from_linear(linear);
            if self.backend.call_clobber_regs().contains(reg) {
                self.free_reg(reg)?;
            }
        }
        // The helper can fault and walk the full machine state.
        self.save_globals(allocated)?;

        self.backend.emit_call(self.buf, helper)?;

        if let Some(dst) = load_dst {
            let reg = self.backend.call_ret_reg();
            debug_assert!(self.regs[reg.linear()].is_none());
            self.bind_output(dst, reg);
        }
        Ok(())
    }
}
