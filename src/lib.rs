//! tbgen - A one-pass dynamic binary translation core.
//!
//! Guest instructions are described as a stream of typed IR ops over
//! virtual temporaries, then compiled to host machine code in a single
//! forward pass with on-the-fly register allocation. The design trades
//! peak code quality for translation speed: every op is visited once by
//! the optimizer, once by liveness analysis and once by the code
//! generator.
//!
//! # Primary Usage
//!
//! ```ignore
//! use tbgen::core::{TranslationContext, ValType, ArithOp};
//! use tbgen::host::{CodeBuffer, GuestMemHooks};
//! use tbgen::x64::{X64Backend, ENV_BASE};
//!
//! let mut ctx = TranslationContext::new();
//! ctx.set_env_base(ENV_BASE, "env");
//! let r0 = ctx.global(ValType::I64, 0x00, "r0");
//! let r1 = ctx.global(ValType::I64, 0x08, "r1");
//!
//! // Front end: decode one guest block into ops.
//! ctx.insn_start(0x1000);
//! let t = ctx.local_ebb(ValType::I64);
//! ctx.arith(ArithOp::Add, t, r0, r1);
//! ctx.mov(r0, t);
//! ctx.exit_block(0);
//!
//! // Back end: optimize, allocate, encode.
//! let backend = X64Backend::new(GuestMemHooks { load: 0, store: 0 });
//! let mut buf = CodeBuffer::new(64 * 1024);
//! let block = tbgen::codegen::generate(&mut ctx, &backend, &mut buf, 0x1000..0x1004, 0)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - IR model: temporaries, ops, the op stream, labels
//! - [`opt`] - Constant folding, copy propagation, branch simplification
//! - [`codegen`] - Liveness analysis and the one-pass register allocator
//! - [`host`] - Backend trait and the code buffer
//! - [`x64`] - x86-64 encodings via iced-x86
//! - [`registry`] - Lookup and invalidation of completed translations

pub mod codegen;
pub mod core;
pub mod host;
pub mod opt;
pub mod registry;
pub mod x64;

pub use crate::core::{
    ArithOp, CallFlags, Cond, HostReg, LabelId, MemOp, MemSize, Op, RegSet, TempId,
    TranslateError, TranslateResult, TranslationContext, UnaryOp, ValType,
};
pub use codegen::generate;
pub use host::{probe_backend, CodeBuffer, GuestMemHooks, HostBackend};
pub use registry::{BlockRegistry, TranslatedBlock};
pub use x64::X64Backend;
