//! x86-64 backend: System V ABI, integer and SSE2 vector encodings.

mod backend;

pub use backend::{X64Backend, ENV_BASE, FRAME_SIZE, FRAME_START};
