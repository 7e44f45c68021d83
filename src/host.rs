//! The host-backend seam: the code buffer, per-op register constraints
//! and the trait a target backend implements for the one-pass code
//! generator.

use crate::core::{
    HostReg, Op, RegSet, RelocKind, Relocation, TranslateError, TranslateResult, ValType,
};

/// Output buffer for encoded host instructions. Grows on demand up to a
/// hard limit; hitting the limit is the one recoverable failure of a
/// translation, reported as [`TranslateError::CodeBufferFull`] so the
/// caller can flush its code cache and retry.
pub struct CodeBuffer {
    bytes: Vec<u8>,
    limit: usize,
}

impl CodeBuffer {
    pub fn new(limit: usize) -> Self {
        CodeBuffer {
            bytes: Vec::new(),
            limit,
        }
    }

    /// Current write offset.
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.bytes.len()
    }

    pub fn write(&mut self, data: &[u8]) -> TranslateResult<()> {
        if data.len() > self.remaining() {
            return Err(TranslateError::CodeBufferFull {
                needed: data.len(),
                available: self.remaining(),
            });
        }
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    /// Patch a 32-bit field in already-emitted code.
    pub fn patch_i32(&mut self, offset: usize, val: i32) {
        self.bytes[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }

    pub fn code(&self) -> &[u8] {
        &self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// How an operand reaches the backend encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    Reg(HostReg),
    Imm(i64),
}

/// Branch target state for control-flow ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    None,
    /// Backward branch to a bound label at this buffer offset.
    Resolved(usize),
    /// Forward branch; the backend emits a placeholder and returns a
    /// relocation request.
    Pending,
}

/// An op with its operands resolved to registers and immediates, ready
/// for encoding.
pub struct LoweredOp<'a> {
    pub op: &'a Op,
    pub ins: [Operand; 4],
    pub outs: [HostReg; 2],
    pub branch: BranchTarget,
}

/// Patch site reported back by the backend for a pending branch.
#[derive(Debug, Clone, Copy)]
pub struct RelocRequest {
    pub offset: usize,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Immediate operand policy for one input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmPolicy {
    /// The encoding has no immediate form; constants are materialized.
    Never,
    /// Constants fitting a signed 32-bit immediate stay immediates.
    Imm32,
    /// Any 64-bit constant is acceptable.
    Any,
}

/// Register constraint for one input slot.
#[derive(Debug, Clone, Copy)]
pub struct InCt {
    pub regs: RegSet,
    pub imm: ImmPolicy,
}

/// Register constraint for one output slot.
#[derive(Debug, Clone, Copy)]
pub struct OutCt {
    pub regs: RegSet,
    /// Two-address encoding: the output must land in the register of the
    /// given input slot.
    pub alias_in: Option<u8>,
    /// The output register must differ from every input register.
    pub new_reg: bool,
}

/// Full constraint set for one op.
#[derive(Debug, Clone, Copy)]
pub struct OpConstraints {
    pub ins: [InCt; 4],
    pub outs: [OutCt; 2],
    /// Registers the encoding destroys beyond its outputs.
    pub clobbers: RegSet,
}

impl OpConstraints {
    pub fn none() -> Self {
        OpConstraints {
            ins: [InCt {
                regs: RegSet::EMPTY,
                imm: ImmPolicy::Never,
            }; 4],
            outs: [OutCt {
                regs: RegSet::EMPTY,
                alias_in: None,
                new_reg: false,
            }; 2],
            clobbers: RegSet::EMPTY,
        }
    }
}

/// Entry points for the soft-MMU slow path, supplied by the embedder.
/// Each helper takes (env, guest_addr, value-for-stores, packed-memop)
/// following the host calling convention.
#[derive(Debug, Clone, Copy)]
pub struct GuestMemHooks {
    pub load: usize,
    pub store: usize,
}

/// Startup capability probe: check that the backend encodes every op
/// shape a front end intends to emit, before any guest code runs.
pub fn probe_backend<B: HostBackend>(backend: &B, ops: &[Op]) -> TranslateResult<()> {
    for op in ops {
        if !backend.supports(op) {
            return Err(TranslateError::Unsupported { op: op.name() });
        }
    }
    Ok(())
}

/// A target backend: encodes lowered ops and describes its register
/// file to the allocator.
pub trait HostBackend {
    /// Whether the backend has an encoding path for this op.
    fn supports(&self, op: &Op) -> bool;

    /// Register constraints for an op the backend supports.
    fn constraints(&self, op: &Op) -> OpConstraints;

    /// Allocation preference order for a register bank.
    fn reg_alloc_order(&self, vector: bool) -> &[HostReg];

    /// Registers the allocator must never hand out.
    fn reserved_regs(&self) -> RegSet;

    /// Spill-frame layout as (base register, start offset, size).
    fn spill_frame(&self) -> (HostReg, i32, i32);

    /// Caller-saved registers destroyed by any helper call.
    fn call_clobber_regs(&self) -> RegSet;

    /// Integer argument registers in ABI order.
    fn call_arg_regs(&self) -> &[HostReg];

    /// Integer return-value register.
    fn call_ret_reg(&self) -> HostReg;

    /// Register-to-register move.
    fn mov(&self, buf: &mut CodeBuffer, ty: ValType, dst: HostReg, src: HostReg)
        -> TranslateResult<()>;

    /// Load a constant into a register.
    fn movi(&self, buf: &mut CodeBuffer, ty: ValType, dst: HostReg, val: i64)
        -> TranslateResult<()>;

    /// Load from [base + offset].
    fn ld(
        &self,
        buf: &mut CodeBuffer,
        ty: ValType,
        dst: HostReg,
        base: HostReg,
        offset: i32,
    ) -> TranslateResult<()>;

    /// Store to [base + offset].
    fn st(
        &self,
        buf: &mut CodeBuffer,
        ty: ValType,
        src: HostReg,
        base: HostReg,
        offset: i32,
    ) -> TranslateResult<()>;

    /// Encode one lowered op. Forward branches return the patch site.
    fn emit_op(
        &self,
        buf: &mut CodeBuffer,
        lowered: &LoweredOp<'_>,
    ) -> TranslateResult<Option<RelocRequest>>;

    /// Patch a recorded relocation now that its target is known.
    fn patch_reloc(&self, buf: &mut CodeBuffer, reloc: &Relocation, target: usize);

    /// Call an absolute host address.
    fn emit_call(&self, buf: &mut CodeBuffer, func: usize) -> TranslateResult<()>;

    /// Helper entry point for a guest memory access.
    fn guest_mem_helper(&self, is_load: bool) -> usize;
}
