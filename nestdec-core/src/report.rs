//! Serializable decode results.
//!
//! All types serialize with camelCase field names.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::engine::diagnostics::DiagnosticsSnapshot;
use crate::metrics::ErrorRates;

/// Best hypothesis of one task, in reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHypothesis {
    /// Emitted tokens without the start token and the closing EOS.
    pub tokens: Vec<usize>,
    /// Final ranking score, penalties included.
    pub score: f32,
    /// Sum of the token log-probabilities, EOS included.
    pub log_likelihood: f32,
    pub token_log_probs: Vec<f32>,
    /// `false` when the search hit its step cap without reaching EOS.
    pub completed: bool,
    /// `(tokens, source max_time)`, heads averaged.
    pub alignment: Array2<f32>,
}

/// Both hypotheses of one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtteranceDecode {
    /// Word-level result.
    pub main: TaskHypothesis,
    /// Character-level result.
    pub sub: TaskHypothesis,
    /// `(main tokens, sub history length)`: how much each word step attended
    /// to each character step, heads averaged.
    pub cross_alignment: Array2<f32>,
}

/// Whole-batch output written by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeReport {
    pub utterances: Vec<UtteranceDecode>,
    pub diagnostics: DiagnosticsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rates: Option<ErrorRates>,
}
