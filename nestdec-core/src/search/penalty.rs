//! Score adjustments applied during and after a search.
//!
//! Only the threshold form of the coverage term is used: the sum of the
//! cumulative attention mass at every source position (and head) where that
//! mass exceeds [`COVERAGE_THRESHOLD`]. The capped-sum form
//! `Σ log(min(cum, 1))` from GNMT is not applied.

use ndarray::Array2;

use super::Hypothesis;
use crate::config::SearchConfig;

pub const COVERAGE_THRESHOLD: f32 = 0.5;

/// Sum of cumulative attention over positions above the threshold.
pub fn coverage(cumulative: &Array2<f32>) -> f32 {
    cumulative
        .iter()
        .filter(|&&mass| mass > COVERAGE_THRESHOLD)
        .sum()
}

/// Score of extending `parent` with a token of log-probability `log_prob`.
/// Coverage is read from the parent's alignments and only computed when the
/// weight is positive.
pub fn step_score<S: Clone>(parent: &Hypothesis<S>, log_prob: f32, config: &SearchConfig) -> f32 {
    let mut score = parent.score + log_prob + config.length_penalty;
    if config.coverage_penalty > 0.0 {
        score += config.coverage_penalty * coverage(parent.cumulative_alignment());
    }
    score
}

/// Length bonus added once more when the finalists are ranked.
pub fn finalize_score<S: Clone>(hyp: &Hypothesis<S>, config: &SearchConfig) -> f32 {
    if config.length_penalty > 0.0 {
        hyp.score + hyp.len() as f32 * config.length_penalty
    } else {
        hyp.score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{Committed, Expansion, Start};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    fn step(alignment: Array2<f32>) -> Expansion<()> {
        Expansion {
            log_probs: Array1::zeros(3),
            alignment,
            cross_alignment: None,
            pending: (),
        }
    }

    fn hypothesis(steps: &[Array2<f32>]) -> Hypothesis<()> {
        let mut hyp = Hypothesis::root(
            0,
            Start {
                state: (),
                output: Array1::zeros(1),
                alignment: Array2::zeros((3, 1)),
                cross_alignment: None,
            },
        );
        for a in steps {
            let committed = Committed {
                state: (),
                output: Array1::zeros(1),
            };
            hyp = hyp.extend(1, -1.0, hyp.score - 1.0, committed, &step(a.clone()));
        }
        hyp
    }

    #[test]
    fn coverage_counts_only_mass_above_threshold() {
        // cumulative = [0.8, 0.8, 0.4]
        assert_abs_diff_eq!(coverage(&array![[0.8f32], [0.8], [0.4]]), 1.6, epsilon = 1e-6);
        assert_eq!(coverage(&Array2::zeros((3, 1))), 0.0);
    }

    #[test]
    fn coverage_sums_heads() {
        assert_abs_diff_eq!(coverage(&array![[0.9f32, 0.7], [0.1, 0.3]]), 1.6, epsilon = 1e-6);
    }

    #[test]
    fn step_score_adds_penalties_from_parent() {
        let parent = hypothesis(&[array![[0.4f32], [0.6], [0.0]], array![[0.4f32], [0.2], [0.4]]]);
        let plain = SearchConfig::default();
        assert_abs_diff_eq!(step_score(&parent, -0.5, &plain), -2.5, epsilon = 1e-6);

        let penalized = SearchConfig {
            length_penalty: 0.1,
            coverage_penalty: 2.0,
            ..SearchConfig::default()
        };
        // -2 - 0.5 + 0.1 + 2 * 1.6
        assert_abs_diff_eq!(step_score(&parent, -0.5, &penalized), 0.8, epsilon = 1e-5);
    }

    #[test]
    fn finalize_adds_length_bonus_only_when_positive() {
        let hyp = hypothesis(&[array![[1.0f32], [0.0], [0.0]]]);
        let plain = SearchConfig::default();
        assert_eq!(finalize_score(&hyp, &plain), hyp.score);
        let lp = SearchConfig {
            length_penalty: 0.5,
            ..SearchConfig::default()
        };
        assert_abs_diff_eq!(finalize_score(&hyp, &lp), hyp.score + 1.0, epsilon = 1e-6);
    }
}
