//! The translation context: owns the temporary table, op stream, label
//! table and scratch arena for one translation unit at a time.
//!
//! A context is recycled across translation units through
//! [`reset`](TranslationContext::reset) instead of being reallocated, so
//! the table capacity and arena pages are paid for once. Permanent
//! temporaries (fixed registers and machine-state globals) survive
//! resets; everything else is invalidated.

use bumpalo::Bump;
use hashbrown::HashMap;

use super::label::{LabelId, LabelTable};
use super::op::{ArithOp, CallFlags, Cond, MemOp, MemSize, Op, UnaryOp, VecOp, VecWidth};
use super::stream::{OpRef, OpStream};
use super::temp::{HostReg, Temp, TempId, TempKind, ValLocation, ValType, MAX_TEMPS};

/// Spill-frame layout handed to the context before code generation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub base: HostReg,
    pub start: i32,
    pub end: i32,
    pub cur: i32,
}

pub struct TranslationContext {
    pub(crate) temps: Vec<Temp>,
    /// Temps below this index are permanent (fixed regs and globals).
    pub(crate) nb_globals: u16,
    free_temps: HashMap<(TempKind, ValType), Vec<u16>>,
    const_table: HashMap<(ValType, i64), TempId>,
    pub(crate) stream: OpStream,
    pub(crate) labels: LabelTable,
    /// Scratch arena for per-pass allocations; reset with the context.
    pub(crate) pool: Bump,
    generation: u32,
    frame: Option<Frame>,
    env_base: Option<TempId>,
}

impl Default for TranslationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationContext {
    pub fn new() -> Self {
        TranslationContext {
            temps: Vec::new(),
            nb_globals: 0,
            free_temps: HashMap::new(),
            const_table: HashMap::new(),
            stream: OpStream::new(),
            labels: LabelTable::new(),
            pool: Bump::new(),
            generation: 0,
            frame: None,
            env_base: None,
        }
    }

    fn push_temp(&mut self, temp: Temp) -> TempId {
        assert!(self.temps.len() < MAX_TEMPS, "temporary table overflow");
        let index = self.temps.len() as u16;
        self.temps.push(temp);
        TempId {
            index,
            generation: self.generation,
        }
    }

    /// Declare a fixed host register as a permanent temporary. Must be
    /// called before any locals exist.
    pub fn fixed_reg(&mut self, reg: HostReg, ty: ValType, name: &'static str) -> TempId {
        assert_eq!(
            self.temps.len(),
            self.nb_globals as usize,
            "permanent temps must be declared before locals"
        );
        let mut temp = Temp::new(TempKind::Fixed, ty);
        temp.loc = ValLocation::Reg(reg);
        temp.name = Some(name);
        let id = self.push_temp(temp);
        self.nb_globals += 1;
        id
    }

    /// Declare the machine-state base pointer register. Globals are
    /// addressed relative to it, and helper calls receive it as their
    /// first argument.
    pub fn set_env_base(&mut self, reg: HostReg, name: &'static str) -> TempId {
        let id = self.fixed_reg(reg, ValType::I64, name);
        self.env_base = Some(id);
        id
    }

    pub fn env_base(&self) -> Option<TempId> {
        self.env_base
    }

    /// Declare a machine-state field as a permanent global temporary.
    pub fn global(&mut self, ty: ValType, offset: i32, name: &'static str) -> TempId {
        assert_eq!(
            self.temps.len(),
            self.nb_globals as usize,
            "permanent temps must be declared before locals"
        );
        let env = self.env_base.expect("machine-state base not declared");
        let base = match self.temps[env.index()].loc {
            ValLocation::Reg(r) => r,
            _ => unreachable!("fixed temp without a register"),
        };
        let mut temp = Temp::new(TempKind::Global, ty);
        temp.loc = ValLocation::Mem;
        temp.mem_base = base;
        temp.mem_offset = offset;
        temp.mem_coherent = true;
        temp.mem_allocated = true;
        temp.name = Some(name);
        let id = self.push_temp(temp);
        self.nb_globals += 1;
        id
    }

    fn new_temp(&mut self, kind: TempKind, ty: ValType) -> TempId {
        if let Some(index) = self
            .free_temps
            .get_mut(&(kind, ty))
            .and_then(|list| list.pop())
        {
            let temp = &mut self.temps[index as usize];
            *temp = Temp::new(kind, ty);
            return TempId {
                index,
                generation: self.generation,
            };
        }
        self.push_temp(Temp::new(kind, ty))
    }

    /// A local temporary that keeps its value across branches within the
    /// translation unit.
    pub fn local(&mut self, ty: ValType) -> TempId {
        self.new_temp(TempKind::LocalBlock, ty)
    }

    /// A local temporary whose value dies at the next extended-basic-block
    /// boundary. The common kind for expression intermediates.
    pub fn local_ebb(&mut self, ty: ValType) -> TempId {
        self.new_temp(TempKind::LocalEbb, ty)
    }

    /// A 128-bit integer as a low/high pair of 64-bit locals.
    pub fn local_i128(&mut self) -> (TempId, TempId) {
        (self.local(ValType::I64), self.local(ValType::I64))
    }

    /// An interned constant temporary. Repeated requests for the same
    /// (type, value) return the same handle within a translation unit.
    pub fn constant(&mut self, ty: ValType, val: i64) -> TempId {
        if let Some(&id) = self.const_table.get(&(ty, val)) {
            return id;
        }
        let mut temp = Temp::new(TempKind::Const, ty);
        temp.loc = ValLocation::Const(val);
        temp.val = val;
        let id = self.push_temp(temp);
        self.const_table.insert((ty, val), id);
        id
    }

    /// Return a local temporary to the free pool. Permanent and constant
    /// temporaries cannot be freed.
    pub fn free_local(&mut self, id: TempId) {
        let temp = self.temp(id);
        let (kind, ty) = (temp.kind, temp.ty);
        assert!(
            matches!(kind, TempKind::LocalBlock | TempKind::LocalEbb),
            "freeing a non-local temporary"
        );
        self.free_temps.entry((kind, ty)).or_default().push(id.index);
    }

    pub(crate) fn current_generation(&self) -> u32 {
        self.generation
    }

    fn check_id(&self, id: TempId) -> usize {
        if id.index >= self.nb_globals {
            assert_eq!(id.generation, self.generation, "stale temporary handle");
        }
        assert!((id.index as usize) < self.temps.len(), "bad temporary index");
        id.index as usize
    }

    pub fn temp(&self, id: TempId) -> &Temp {
        let index = self.check_id(id);
        &self.temps[index]
    }

    pub(crate) fn temp_mut(&mut self, id: TempId) -> &mut Temp {
        let index = self.check_id(id);
        &mut self.temps[index]
    }

    pub fn ty(&self, id: TempId) -> ValType {
        self.temp(id).ty
    }

    pub(crate) fn set_frame(&mut self, base: HostReg, start: i32, size: i32) {
        self.frame = Some(Frame {
            base,
            start,
            end: start + size,
            cur: start,
        });
    }

    /// Carve a spill slot out of the frame.
    pub(crate) fn alloc_frame_slot(&mut self, size: usize) -> (HostReg, i32) {
        let frame = self.frame.as_mut().expect("spill frame not configured");
        let align = size as i32;
        let offset = (frame.cur + align - 1) & !(align - 1);
        assert!(offset + size as i32 <= frame.end, "spill frame overflow");
        frame.cur = offset + size as i32;
        (frame.base, offset)
    }

    // --- op emission -----------------------------------------------------

    /// Append a raw op. The typed helpers below are preferred; they fill
    /// in the type fields from the operands.
    pub fn emit(&mut self, op: Op) -> OpRef {
        self.stream.emit(op)
    }

    /// Mark a guest instruction boundary.
    pub fn insn_start(&mut self, pc: u64) -> OpRef {
        self.stream.emit(Op::InsnStart { pc })
    }

    pub fn mov(&mut self, dst: TempId, src: TempId) -> OpRef {
        let ty = self.ty(dst);
        debug_assert_eq!(ty, self.ty(src), "mov between differing types");
        self.stream.emit(Op::Mov { ty, dst, src })
    }

    pub fn movi(&mut self, dst: TempId, val: i64) -> OpRef {
        let ty = self.ty(dst);
        self.stream.emit(Op::MovImm { ty, dst, val })
    }

    pub fn ld(&mut self, dst: TempId, base: TempId, offset: i32) -> OpRef {
        let ty = self.ty(dst);
        self.stream.emit(Op::Ld { ty, dst, base, offset })
    }

    pub fn st(&mut self, src: TempId, base: TempId, offset: i32) -> OpRef {
        let ty = self.ty(src);
        self.stream.emit(Op::St { ty, src, base, offset })
    }

    pub fn arith(&mut self, op: ArithOp, dst: TempId, a: TempId, b: TempId) -> OpRef {
        let ty = self.ty(dst);
        debug_assert_eq!(ty, self.ty(a));
        debug_assert_eq!(ty, self.ty(b));
        self.stream.emit(Op::Arith { op, ty, dst, a, b })
    }

    pub fn add(&mut self, dst: TempId, a: TempId, b: TempId) -> OpRef {
        self.arith(ArithOp::Add, dst, a, b)
    }

    pub fn sub(&mut self, dst: TempId, a: TempId, b: TempId) -> OpRef {
        self.arith(ArithOp::Sub, dst, a, b)
    }

    pub fn unary(&mut self, op: UnaryOp, dst: TempId, src: TempId) -> OpRef {
        let ty = self.ty(dst);
        self.stream.emit(Op::Unary { op, ty, dst, src })
    }

    pub fn setcond(&mut self, cond: Cond, dst: TempId, a: TempId, b: TempId) -> OpRef {
        let ty = self.ty(a);
        self.stream.emit(Op::Setcond { cond, ty, dst, a, b })
    }

    pub fn movcond(
        &mut self,
        cond: Cond,
        dst: TempId,
        a: TempId,
        b: TempId,
        vt: TempId,
        vf: TempId,
    ) -> OpRef {
        let ty = self.ty(dst);
        self.stream.emit(Op::Movcond { cond, ty, dst, a, b, vt, vf })
    }

    pub fn new_label(&mut self) -> LabelId {
        self.labels.new_label()
    }

    pub fn br(&mut self, target: LabelId) -> OpRef {
        self.labels.record_use(target);
        self.stream.emit(Op::Br { target })
    }

    pub fn brcond(&mut self, cond: Cond, a: TempId, b: TempId, target: LabelId) -> OpRef {
        let ty = self.ty(a);
        self.labels.record_use(target);
        self.stream.emit(Op::Brcond { cond, ty, a, b, target })
    }

    pub fn set_label(&mut self, label: LabelId) -> OpRef {
        self.stream.emit(Op::SetLabel { label })
    }

    pub fn guest_ld(&mut self, dst: TempId, addr: TempId, mem: MemOp, mmu_idx: u16) -> OpRef {
        self.stream.emit(Op::GuestLd { dst, addr, mem, mmu_idx })
    }

    pub fn guest_st(&mut self, src: TempId, addr: TempId, mem: MemOp, mmu_idx: u16) -> OpRef {
        self.stream.emit(Op::GuestSt { src, addr, mem, mmu_idx })
    }

    pub fn call(
        &mut self,
        func: usize,
        ret: Option<TempId>,
        args: Vec<TempId>,
        flags: CallFlags,
    ) -> OpRef {
        self.stream.emit(Op::Call { func, ret, args, flags })
    }

    pub fn add2(
        &mut self,
        dst_lo: TempId,
        dst_hi: TempId,
        a_lo: TempId,
        a_hi: TempId,
        b_lo: TempId,
        b_hi: TempId,
    ) -> OpRef {
        self.stream
            .emit(Op::Add2 { dst_lo, dst_hi, a_lo, a_hi, b_lo, b_hi })
    }

    pub fn sub2(
        &mut self,
        dst_lo: TempId,
        dst_hi: TempId,
        a_lo: TempId,
        a_hi: TempId,
        b_lo: TempId,
        b_hi: TempId,
    ) -> OpRef {
        self.stream
            .emit(Op::Sub2 { dst_lo, dst_hi, a_lo, a_hi, b_lo, b_hi })
    }

    pub fn vec_arith(&mut self, op: VecOp, elem: MemSize, dst: TempId, a: TempId, b: TempId) -> OpRef {
        debug_assert!(self.ty(dst).is_vector());
        self.stream.emit(Op::VecArith {
            op,
            width: VecWidth::V128,
            elem,
            dst,
            a,
            b,
        })
    }

    pub fn discard(&mut self, temp: TempId) -> OpRef {
        self.stream.emit(Op::Discard { temp })
    }

    pub fn exit_block(&mut self, ret: u64) -> OpRef {
        self.stream.emit(Op::ExitBlock { ret })
    }

    // ---------------------------------------------------------------------

    /// Recycle the context for the next translation unit. Permanent
    /// temporaries survive with their starting locations; all other
    /// handles become stale.
    pub fn reset(&mut self) {
        self.temps.truncate(self.nb_globals as usize);
        for temp in &mut self.temps {
            match temp.kind {
                TempKind::Fixed => {}
                TempKind::Global => {
                    temp.loc = ValLocation::Mem;
                    temp.mem_coherent = true;
                }
                _ => unreachable!("local temp below the permanent boundary"),
            }
        }
        self.free_temps.clear();
        self.const_table.clear();
        self.stream.reset();
        self.labels.reset();
        self.pool.reset();
        if let Some(frame) = &mut self.frame {
            frame.cur = frame.start;
        }
        self.generation = self.generation.wrapping_add(1);
    }
}
