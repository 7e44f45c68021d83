//! IR core: temporaries, ops, the op stream, labels and the translation
//! context that ties them together.

pub mod context;
pub mod error;
pub mod label;
pub mod op;
pub mod stream;
pub mod temp;

pub use context::TranslationContext;
pub use error::{TranslateError, TranslateResult};
pub use label::{LabelId, RelocKind, Relocation};
pub use op::{ArithOp, CallFlags, Cond, MemOp, MemSize, Op, UnaryOp, VecOp, VecWidth};
pub use stream::{OpRef, OpStream, MAX_OPS};
pub use temp::{
    HostReg, RegSet, Temp, TempId, TempKind, ValLocation, ValType, MAX_TEMPS, NB_REGS,
};
