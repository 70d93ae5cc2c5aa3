//! # nestdec-core
//!
//! Hierarchical (word/character) joint beam-search decoding with
//! inter-decoder attention.
//!
//! ## Architecture
//!
//! ```text
//! EncodedSequence(sub) → SubDecoder ─ beam/greedy search ─► char hypothesis
//!                                          │
//!                              SubTaskContext (decoder outputs)
//!                                          │
//! EncodedSequence(main) → main TaskDecoder (acoustic + cross attention)
//!                                          │
//!                                beam/greedy search ─► word hypothesis
//! ```
//!
//! Searches only see the `StepDecoder` trait; the neural `TaskDecoder` and
//! the function-driven `ScriptedDecoder` both implement it. The library only
//! emits `tracing` events and never installs a subscriber.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod encoded;
pub mod engine;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod nn;
pub mod report;
pub mod search;

// Convenience re-exports for downstream crates
pub use config::{
    AttentionConfig, AttentionKind, ContextFusion, DecodeConfig, DecodingOrder, Direction,
    EncoderType, HeadCombine, InitDecoderState, ModelConfig, RnnType, SearchConfig,
    SubContextUsage, TaskConfig,
};
pub use encoded::{EncodedSequence, Utterance};
pub use engine::{
    decode_batch, decode_batch_parallel, BatchDecoder, DecodeDiagnostics, DiagnosticsSnapshot,
    HierarchicalModel, SubDecoder, SubTaskContext,
};
pub use error::{NestdecError, Result};
pub use inference::{ScriptedDecoder, StepDecoder, TaskDecoder};
pub use metrics::{ErrorAccumulator, ErrorRates};
pub use report::{DecodeReport, TaskHypothesis, UtteranceDecode};
pub use search::{search, Hypothesis, SearchOutcome, TokenSource};
