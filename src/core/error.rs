//! Error types for the translator.
//!
//! Only conditions the embedding code cache can actually recover from are
//! modeled as errors. Capacity overruns and invariant violations inside a
//! translation unit are front-end bugs and panic instead: a unit whose
//! bounds were exceeded cannot be locally repaired without risking wrong
//! code.

use thiserror::Error;

/// Recoverable translation failures.
#[derive(Error, Debug)]
pub enum TranslateError {
    /// The shared host code buffer ran out of space mid-generation. The
    /// caller is expected to evict cached blocks and retranslate from
    /// scratch; no partial output is published.
    #[error("code buffer full: {needed} bytes needed, {available} available")]
    CodeBufferFull { needed: usize, available: usize },

    /// The host backend reported no encoding for an op the front end
    /// emitted. A configuration error, normally caught by probing
    /// capabilities at startup.
    #[error("host backend does not support op {op}")]
    Unsupported { op: &'static str },

    /// Instruction encoding failed inside the host backend.
    #[error("encoding error: {0}")]
    Encode(String),
}

/// Result type alias for translation operations.
pub type TranslateResult<T> = Result<T, TranslateError>;
