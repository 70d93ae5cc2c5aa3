//! Searches over a [`StepDecoder`].
//!
//! ```text
//!   root ─► expand every live hypothesis ─► top-k per hypothesis
//!             ▲                                 │ reject early EOS
//!             │                                 │ score + penalties
//!             │                      sort, keep beam_width
//!             │                                 │ commit survivors
//!             └──── open ◄── split ──► completed (capped at beam_width)
//! ```
//!
//! Width 1 runs the dedicated greedy loop, which picks the same tokens as the
//! beam loop would. Replaying reference labels runs the beam loop at width 1
//! with the candidate fixed to the next label.

pub mod beam;
pub mod greedy;
pub mod hypothesis;
pub mod penalty;

pub use hypothesis::Hypothesis;

use crate::config::SearchConfig;
use crate::engine::diagnostics::DecodeDiagnostics;
use crate::error::{NestdecError, Result};
use crate::inference::StepDecoder;

/// Where each step's token comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource<'a> {
    /// Ranked by the decoder's log-probabilities.
    Search,
    /// Reference labels without start or end token; EOS follows the last one.
    Forced(&'a [usize]),
}

/// Result of one search.
#[derive(Debug, Clone)]
pub struct SearchOutcome<S> {
    pub best: Hypothesis<S>,
    /// Remaining finalists, best first.
    pub runners_up: Vec<Hypothesis<S>>,
    /// `false` when the step cap hit before anything reached EOS and the open
    /// beam stood in for the completed set.
    pub completed: bool,
    pub steps: usize,
}

impl<S> SearchOutcome<S> {
    pub fn finalists(&self) -> impl Iterator<Item = &Hypothesis<S>> {
        std::iter::once(&self.best).chain(&self.runners_up)
    }
}

/// Runs one search, dispatching on the token source and the beam width.
///
/// # Errors
/// Returns an error for an invalid configuration, for forced labels outside
/// the vocabulary and for anything the decoder reports.
pub fn search<D: StepDecoder>(
    decoder: &D,
    config: &SearchConfig,
    source: TokenSource<'_>,
    diagnostics: &DecodeDiagnostics,
) -> Result<SearchOutcome<D::State>> {
    config.validate("search")?;
    diagnostics.add(&diagnostics.searches, 1);
    match source {
        TokenSource::Forced(labels) => {
            if let Some(bad) = labels
                .iter()
                .find(|&&t| t >= decoder.vocab_size() || t == decoder.eos())
            {
                return Err(NestdecError::InvalidInput(format!(
                    "forced label {bad} is not an output class"
                )));
            }
            diagnostics.add(&diagnostics.forced_replays, 1);
            let forced = SearchConfig {
                beam_width: 1,
                ..*config
            };
            beam::run(decoder, &forced, source, diagnostics)
        }
        TokenSource::Search if config.is_greedy() => greedy::run(decoder, config, diagnostics),
        TokenSource::Search => beam::run(decoder, config, source, diagnostics),
    }
}
