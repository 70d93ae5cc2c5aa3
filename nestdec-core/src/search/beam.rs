use tracing::{debug, trace, warn};

use super::penalty::{finalize_score, step_score};
use super::{Hypothesis, SearchOutcome, TokenSource};
use crate::config::SearchConfig;
use crate::engine::diagnostics::DecodeDiagnostics;
use crate::error::{NestdecError, Result};
use crate::inference::StepDecoder;
use crate::nn::math::{by_score_desc, top_k};

/// A scored extension not yet realized into a child state.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    parent: usize,
    token: usize,
    log_prob: f32,
    score: f32,
}

/// Generic beam search.
///
/// Per step, every live hypothesis proposes its `beam_width` best tokens
/// (or the next forced label). EOS is refused while the hypothesis is
/// shorter than `min_decode_len`. The pooled candidates are stably sorted by
/// score and cut to `beam_width`; survivors are committed, completed ones
/// (ending in EOS) leave the beam for good. The search stops once
/// `beam_width` hypotheses have completed, when no candidate is left, or
/// after `max_decode_len` steps.
pub fn run<D: StepDecoder>(
    decoder: &D,
    config: &SearchConfig,
    source: TokenSource<'_>,
    diagnostics: &DecodeDiagnostics,
) -> Result<SearchOutcome<D::State>> {
    let eos = decoder.eos();
    let width = config.beam_width;
    let mut beam = vec![Hypothesis::root(eos, decoder.start()?)];
    let mut completed: Vec<Hypothesis<D::State>> = Vec::new();
    let mut steps = 0;

    for step in 0..config.max_decode_len {
        let mut expansions = Vec::with_capacity(beam.len());
        let mut candidates = Vec::with_capacity(beam.len() * width);

        for (parent, hyp) in beam.iter().enumerate() {
            let expansion = decoder.expand(hyp)?;
            let picks = match source {
                TokenSource::Search => top_k(expansion.log_probs.view(), width),
                TokenSource::Forced(labels) => {
                    let token = labels.get(hyp.len() - 1).copied().unwrap_or(eos);
                    let log_prob = expansion.log_probs.get(token).copied().ok_or_else(|| {
                        NestdecError::InvalidInput(format!(
                            "forced token {token} outside vocabulary"
                        ))
                    })?;
                    vec![(token, log_prob)]
                }
            };
            for (token, log_prob) in picks {
                if token == eos
                    && source == TokenSource::Search
                    && hyp.len() < config.min_decode_len
                {
                    diagnostics.add(&diagnostics.eos_rejected, 1);
                    continue;
                }
                candidates.push(Candidate {
                    parent,
                    token,
                    log_prob,
                    score: step_score(hyp, log_prob, config),
                });
            }
            expansions.push(expansion);
        }
        diagnostics.add(&diagnostics.expansions, expansions.len());

        if candidates.is_empty() {
            debug!(step, "no admissible candidate, stopping early");
            break;
        }
        steps = step + 1;
        diagnostics.add(&diagnostics.search_steps, 1);

        candidates.sort_by(|a, b| by_score_desc(a.score, b.score));
        candidates.truncate(width);

        let mut open = Vec::with_capacity(width);
        for cand in candidates {
            let parent = &beam[cand.parent];
            let expansion = &expansions[cand.parent];
            let committed = decoder.commit(parent, &expansion.pending, cand.token)?;
            let child = parent.extend(cand.token, cand.log_prob, cand.score, committed, expansion);
            if cand.token == eos {
                completed.push(child);
            } else {
                open.push(child);
            }
        }
        trace!(step, open = open.len(), completed = completed.len(), "beam step");

        if completed.len() >= width {
            completed.truncate(width);
            break;
        }
        beam = open;
    }

    let terminated = !completed.is_empty();
    if terminated {
        diagnostics.add(&diagnostics.completed_hypotheses, completed.len());
    } else {
        warn!(steps, "no hypothesis reached EOS, falling back to the open beam");
        diagnostics.add(&diagnostics.open_beam_fallbacks, 1);
        completed = beam;
    }
    debug!(steps, finalists = completed.len(), terminated, "beam search done");
    finalize(completed, config, terminated, steps)
}

/// Applies the finalize length bonus, ranks and splits off the winner.
pub(super) fn finalize<S: Clone>(
    mut finalists: Vec<Hypothesis<S>>,
    config: &SearchConfig,
    completed: bool,
    steps: usize,
) -> Result<SearchOutcome<S>> {
    for hyp in finalists.iter_mut() {
        hyp.score = finalize_score(hyp, config);
    }
    finalists.sort_by(|a, b| by_score_desc(a.score, b.score));
    let mut finalists = finalists.into_iter();
    let best = finalists
        .next()
        .ok_or_else(|| NestdecError::Other(anyhow::anyhow!("search ended without hypotheses")))?;
    Ok(SearchOutcome {
        best,
        runners_up: finalists.collect(),
        completed,
        steps,
    })
}
