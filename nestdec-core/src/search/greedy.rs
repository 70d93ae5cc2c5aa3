use tracing::{debug, warn};

use super::beam::finalize;
use super::penalty::step_score;
use super::{Hypothesis, SearchOutcome};
use crate::config::SearchConfig;
use crate::engine::diagnostics::DecodeDiagnostics;
use crate::error::Result;
use crate::inference::StepDecoder;
use crate::nn::math::argmax;

/// Width-1 search without candidate pooling or sorting.
///
/// Picks exactly the tokens the beam loop picks at width 1: the arg-max with
/// ties to the lowest index, a refused early EOS ends the search (the beam
/// loop has no other candidate at that point), and the fallback and final
/// scoring rules are shared.
pub fn run<D: StepDecoder>(
    decoder: &D,
    config: &SearchConfig,
    diagnostics: &DecodeDiagnostics,
) -> Result<SearchOutcome<D::State>> {
    let eos = decoder.eos();
    let mut hyp = Hypothesis::root(eos, decoder.start()?);
    let mut steps = 0;
    let mut terminated = false;

    for step in 0..config.max_decode_len {
        let expansion = decoder.expand(&hyp)?;
        diagnostics.add(&diagnostics.expansions, 1);
        let Some((token, log_prob)) = argmax(expansion.log_probs.view()) else {
            break;
        };
        if token == eos && hyp.len() < config.min_decode_len {
            diagnostics.add(&diagnostics.eos_rejected, 1);
            debug!(step, "early EOS refused, stopping");
            break;
        }
        steps = step + 1;
        diagnostics.add(&diagnostics.search_steps, 1);

        let score = step_score(&hyp, log_prob, config);
        let committed = decoder.commit(&hyp, &expansion.pending, token)?;
        hyp = hyp.extend(token, log_prob, score, committed, &expansion);
        if token == eos {
            terminated = true;
            break;
        }
    }

    if terminated {
        diagnostics.add(&diagnostics.completed_hypotheses, 1);
    } else {
        warn!(steps, "no hypothesis reached EOS, falling back to the open beam");
        diagnostics.add(&diagnostics.open_beam_fallbacks, 1);
    }
    debug!(steps, terminated, "greedy search done");
    finalize(vec![hyp], config, terminated, steps)
}
