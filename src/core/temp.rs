//! The temporary/value model: typed virtual registers and their locations.
//!
//! Every operand of the IR is a *temporary*, a virtual register the code
//! generator later maps onto a host register, a stack slot, or a known
//! constant. Temporaries come in five kinds with different lifetimes:
//! fixed hardware registers and machine-state globals persist for the
//! whole translation unit, block-local temporaries live until the unit
//! ends, EBB-local temporaries die at the next extended-basic-block
//! boundary, and constants are read-only and deduplicated.

/// Hard ceiling on temporaries per translation unit. Exceeding it is a
/// front-end bug, not a runtime condition.
pub const MAX_TEMPS: usize = 512;

/// Number of register banks (general purpose, vector).
pub const REG_BANKS: usize = 2;

/// Registers per bank; linear indices are `bank * REGS_PER_BANK + id`.
pub const REGS_PER_BANK: usize = 32;

/// Total linear register slots tracked by the allocator.
pub const NB_REGS: usize = REG_BANKS * REGS_PER_BANK;

/// A host register, identified by bank and id within the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostReg {
    pub bank: u8,
    pub id: u8,
}

impl HostReg {
    pub const fn new(bank: u8, id: u8) -> Self {
        Self { bank, id }
    }

    /// General-purpose register shorthand.
    pub const fn gp(id: u8) -> Self {
        Self { bank: 0, id }
    }

    /// Vector register shorthand.
    pub const fn vec(id: u8) -> Self {
        Self { bank: 1, id }
    }

    pub const fn is_vector(self) -> bool {
        self.bank == 1
    }

    /// Linear index for array/bitset addressing.
    pub const fn linear(self) -> usize {
        self.bank as usize * REGS_PER_BANK + self.id as usize
    }

    pub const fn from_linear(index: usize) -> Self {
        Self {
            bank: (index / REGS_PER_BANK) as u8,
            id: (index % REGS_PER_BANK) as u8,
        }
    }
}

/// Bit set over the linear register space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegSet(pub u64);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    pub const fn single(reg: HostReg) -> Self {
        RegSet(1u64 << reg.linear())
    }

    pub const fn contains(self, reg: HostReg) -> bool {
        self.0 & (1u64 << reg.linear()) != 0
    }

    pub fn set(&mut self, reg: HostReg) {
        self.0 |= 1u64 << reg.linear();
    }

    pub fn clear(&mut self, reg: HostReg) {
        self.0 &= !(1u64 << reg.linear());
    }

    pub const fn union(self, other: RegSet) -> RegSet {
        RegSet(self.0 | other.0)
    }

    pub const fn without(self, other: RegSet) -> RegSet {
        RegSet(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Value types a temporary can carry. The type is fixed at creation.
///
/// 128-bit integers are represented by front ends as lo/hi pairs of `I64`
/// temporaries and coupled through the pair ops; the variant exists for
/// capability queries and pair-allocation helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    I128,
    V128,
}

impl ValType {
    pub const fn size_bytes(self) -> usize {
        match self {
            ValType::I32 => 4,
            ValType::I64 => 8,
            ValType::I128 | ValType::V128 => 16,
        }
    }

    pub const fn is_vector(self) -> bool {
        matches!(self, ValType::V128)
    }

    /// Register bank this type allocates from.
    pub const fn bank(self) -> u8 {
        match self {
            ValType::V128 => 1,
            _ => 0,
        }
    }
}

/// Classification of a temporary; see the module docs for lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TempKind {
    /// Bound permanently to one host register; never spilled or
    /// reassigned by the allocator.
    Fixed,
    /// A whole-machine-state field at a fixed offset from the state base
    /// pointer; persistent across translation units.
    Global,
    /// Block-local, live until the end of the translation unit.
    LocalBlock,
    /// Block-local, dead at the next extended-basic-block boundary.
    LocalEbb,
    /// Compile-time constant; read-only to the allocator.
    Const,
}

/// Where a temporary's value currently lives during code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValLocation {
    /// No current value.
    Dead,
    /// Live in a host register.
    Reg(HostReg),
    /// Live only in its backing memory slot.
    Mem,
    /// Known constant, not yet materialized anywhere.
    Const(i64),
}

/// Handle to a temporary. Handles embed the translation-unit generation
/// so that a stale handle from a reset unit trips an assertion instead of
/// silently aliasing a reused slot. Globals and fixed registers outlive
/// resets and are exempt from the generation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempId {
    pub(crate) index: u16,
    pub(crate) generation: u32,
}

impl TempId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// One temporary's record in the context's table.
#[derive(Debug, Clone)]
pub struct Temp {
    pub kind: TempKind,
    pub ty: ValType,
    pub loc: ValLocation,
    /// Backing slot: base register plus byte offset. For globals this is
    /// the machine-state base; for spilled locals the stack frame base.
    pub mem_base: HostReg,
    pub mem_offset: i32,
    /// Whether the backing slot currently matches the register value.
    pub mem_coherent: bool,
    /// Whether a backing slot has been assigned at all.
    pub mem_allocated: bool,
    /// Constant value for `Const` kind temporaries.
    pub val: i64,
    /// Debug name; globals and fixed registers are named at setup.
    pub name: Option<&'static str>,
}

impl Temp {
    pub(crate) fn new(kind: TempKind, ty: ValType) -> Self {
        Self {
            kind,
            ty,
            loc: ValLocation::Dead,
            mem_base: HostReg::gp(0),
            mem_offset: 0,
            mem_coherent: false,
            mem_allocated: false,
            val: 0,
            name: None,
        }
    }

    /// True when the allocator must never move or spill this temporary.
    pub fn is_fixed(&self) -> bool {
        self.kind == TempKind::Fixed
    }
}
