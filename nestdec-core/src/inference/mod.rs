//! Step decoder abstraction.
//!
//! The `StepDecoder` trait decouples the searches from any specific network:
//! the beam and greedy searches only ever see log-probabilities, alignments
//! and opaque per-hypothesis states.
//!
//! A step is split in two. `expand` scores every next token for one
//! hypothesis; `commit` realizes one chosen token into a child state. The
//! searches call `commit` only for candidates that survive pruning, so the
//! cost of a recurrence (and of copying its state) is paid per survivor
//! rather than per candidate.

pub mod stub;
pub mod task;

use ndarray::{Array1, Array2};

use crate::error::Result;
use crate::search::Hypothesis;

pub use stub::ScriptedDecoder;
pub use task::{CrossLevel, TaskDecoder, TaskStep};

/// What the root hypothesis is built from.
#[derive(Debug, Clone)]
pub struct Start<S> {
    pub state: S,
    pub output: Array1<f32>,
    pub alignment: Array2<f32>,
    pub cross_alignment: Option<Array2<f32>>,
}

/// Scores for every next token of one hypothesis.
#[derive(Debug, Clone)]
pub struct Expansion<P> {
    /// Log-probabilities over the whole vocabulary.
    pub log_probs: Array1<f32>,
    /// Acoustic alignment of this step, `(max_time, heads)`.
    pub alignment: Array2<f32>,
    /// Cross-level alignment of this step, when the decoder has one.
    pub cross_alignment: Option<Array2<f32>>,
    /// Decoder-specific intermediate values `commit` needs.
    pub pending: P,
}

/// A realized child state.
#[derive(Debug, Clone)]
pub struct Committed<S> {
    pub state: S,
    pub output: Array1<f32>,
}

/// Contract for one task decoder bound to one utterance.
pub trait StepDecoder {
    type State: Clone;
    type Pending;

    /// Shared start/end token index.
    fn eos(&self) -> usize;

    fn vocab_size(&self) -> usize;

    /// Root state, output and alignment.
    ///
    /// # Errors
    /// Returns an error if the source sequence does not fit the decoder.
    fn start(&self) -> Result<Start<Self::State>>;

    /// Scores the next token of `hyp`.
    ///
    /// # Errors
    /// Propagates shape errors from the underlying primitives.
    fn expand(&self, hyp: &Hypothesis<Self::State>) -> Result<Expansion<Self::Pending>>;

    /// Realizes `token` as the child of `hyp`. `pending` comes from the
    /// `expand` call on the same hypothesis.
    ///
    /// # Errors
    /// Propagates shape errors from the underlying primitives.
    fn commit(
        &self,
        hyp: &Hypothesis<Self::State>,
        pending: &Self::Pending,
        token: usize,
    ) -> Result<Committed<Self::State>>;
}
