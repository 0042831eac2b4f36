//! Decoder-only causal transformer: weight file codec, per-layer KV cache,
//! and the prefill/decode runtime producing logits.
//!
//! The crate is split along the data/compute boundary: [`weights`] owns the
//! on-disk format and the immutable tensor tables, [`runtime`] owns the
//! mutable session state (KV cache and cursor) and the single-token step
//! both prefill and decode share.

#![deny(unsafe_code)]

pub mod runtime;
pub mod weights;

pub use runtime::{KvCache, Runtime};
pub use weights::{LayerWeights, MlpKind, ModelConfig, NormKind, TokenKind, Weights};

use thiserror::Error;

/// Errors surfaced by weight loading and the decode runtime.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Malformed weight file or inconsistent tensor shapes. Fatal at load.
    #[error("invalid model: {0}")]
    InvalidModel(String),
    /// Underlying file error while reading or writing weights.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The prompt tokenized to zero tokens.
    #[error("empty input")]
    EmptyInput,
    /// The session cursor reached `max_seq`; no further tokens fit.
    #[error("context window exhausted")]
    ContextExhausted,
}
