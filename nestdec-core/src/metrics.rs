//! Token error rates (WER for words, CER for characters).

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Levenshtein operation counts of one hypothesis against its reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditCounts {
    pub substitutions: usize,
    pub insertions: usize,
    pub deletions: usize,
    pub reference_len: usize,
}

impl EditCounts {
    pub fn errors(&self) -> usize {
        self.substitutions + self.insertions + self.deletions
    }

    /// Errors over reference length. An empty reference scores 0 when the
    /// hypothesis is empty too and 1 otherwise.
    pub fn error_rate(&self) -> f64 {
        if self.reference_len == 0 {
            if self.errors() == 0 {
                0.0
            } else {
                1.0
            }
        } else {
            self.errors() as f64 / self.reference_len as f64
        }
    }
}

impl AddAssign for EditCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.substitutions += rhs.substitutions;
        self.insertions += rhs.insertions;
        self.deletions += rhs.deletions;
        self.reference_len += rhs.reference_len;
    }
}

#[derive(Clone, Copy)]
enum Op {
    Keep,
    Substitute,
    Insert,
    Delete,
}

/// Minimum edit alignment of `hypothesis` against `reference`. On equal cost
/// the backtrace prefers match/substitution, then deletion, then insertion.
pub fn align<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> EditCounts {
    let (n, m) = (reference.len(), hypothesis.len());
    let mut cost = vec![vec![0usize; m + 1]; n + 1];
    let mut ops = vec![vec![Op::Keep; m + 1]; n + 1];
    for (i, row) in cost.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=m {
        cost[0][j] = j;
    }
    for i in 1..=n {
        ops[i][0] = Op::Delete;
    }
    for j in 1..=m {
        ops[0][j] = Op::Insert;
    }
    for i in 1..=n {
        for j in 1..=m {
            let same = reference[i - 1] == hypothesis[j - 1];
            let diag = cost[i - 1][j - 1] + usize::from(!same);
            let delete = cost[i - 1][j] + 1;
            let insert = cost[i][j - 1] + 1;
            let (c, op) = if diag <= delete && diag <= insert {
                (diag, if same { Op::Keep } else { Op::Substitute })
            } else if delete <= insert {
                (delete, Op::Delete)
            } else {
                (insert, Op::Insert)
            };
            cost[i][j] = c;
            ops[i][j] = op;
        }
    }

    let mut counts = EditCounts {
        reference_len: n,
        ..EditCounts::default()
    };
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        match ops[i][j] {
            Op::Keep => {
                i -= 1;
                j -= 1;
            }
            Op::Substitute => {
                counts.substitutions += 1;
                i -= 1;
                j -= 1;
            }
            Op::Delete => {
                counts.deletions += 1;
                i -= 1;
            }
            Op::Insert => {
                counts.insertions += 1;
                j -= 1;
            }
        }
    }
    counts
}

/// Corpus-level and per-utterance-mean rate of one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub counts: EditCounts,
    pub utterances: usize,
    /// Total errors over total reference length.
    pub corpus_rate: f64,
    /// Mean of the per-utterance rates.
    pub mean_utterance_rate: f64,
}

/// Running totals for one task.
#[derive(Debug, Clone, Default)]
pub struct ErrorAccumulator {
    counts: EditCounts,
    rate_sum: f64,
    utterances: usize,
}

impl ErrorAccumulator {
    pub fn push<T: PartialEq>(&mut self, reference: &[T], hypothesis: &[T]) -> EditCounts {
        let counts = align(reference, hypothesis);
        self.counts += counts;
        self.rate_sum += counts.error_rate();
        self.utterances += 1;
        counts
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            counts: self.counts,
            utterances: self.utterances,
            corpus_rate: self.counts.error_rate(),
            mean_utterance_rate: if self.utterances == 0 {
                0.0
            } else {
                self.rate_sum / self.utterances as f64
            },
        }
    }
}

/// Word and character error rates of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRates {
    pub wer: ErrorSummary,
    pub cer: ErrorSummary,
}
