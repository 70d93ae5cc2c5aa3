use std::sync::Arc;

use ndarray::{Array1, Array2};

use crate::inference::{Committed, Expansion, Start};

/// One partial or complete output sequence.
///
/// Index 0 of every history belongs to the root: the start token, the initial
/// decoder output and the all-zero alignment. Step `i` appends entry `i` to
/// each history. History entries are immutable once recorded and shared
/// between a parent and its children; only the decoder state is cloned.
#[derive(Debug, Clone)]
pub struct Hypothesis<S> {
    pub tokens: Vec<usize>,
    pub score: f32,
    pub state: S,
    pub outputs: Vec<Arc<Array1<f32>>>,
    /// `(max_time, heads)` per step.
    pub alignments: Vec<Arc<Array2<f32>>>,
    /// Cross-level alignments; empty for decoders without one.
    pub cross_alignments: Vec<Arc<Array2<f32>>>,
    /// Log-probability of each emitted token, start token excluded.
    pub token_log_probs: Vec<f32>,
    /// Running sum of `alignments`.
    cumulative: Array2<f32>,
}

impl<S: Clone> Hypothesis<S> {
    pub fn root(sos: usize, start: Start<S>) -> Self {
        Self {
            tokens: vec![sos],
            score: 0.0,
            state: start.state,
            outputs: vec![Arc::new(start.output)],
            cumulative: start.alignment.clone(),
            alignments: vec![Arc::new(start.alignment)],
            cross_alignments: start.cross_alignment.map(Arc::new).into_iter().collect(),
            token_log_probs: Vec::new(),
        }
    }

    /// Token count, start token included.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn last_token(&self) -> usize {
        self.tokens.last().copied().unwrap_or_default()
    }

    pub fn last_output(&self) -> Option<&Array1<f32>> {
        self.outputs.last().map(|o| &**o)
    }

    pub fn last_alignment(&self) -> Option<&Array2<f32>> {
        self.alignments.last().map(|a| &**a)
    }

    pub fn last_cross_alignment(&self) -> Option<&Array2<f32>> {
        self.cross_alignments.last().map(|a| &**a)
    }

    pub fn ends_with(&self, token: usize) -> bool {
        self.len() > 1 && self.last_token() == token
    }

    /// Sum of the step's token log-probabilities.
    pub fn log_likelihood(&self) -> f32 {
        self.token_log_probs.iter().sum()
    }

    /// Element-wise sum of every recorded alignment.
    pub fn cumulative_alignment(&self) -> &Array2<f32> {
        &self.cumulative
    }

    /// Child hypothesis extended by `token`. The parent is left untouched;
    /// the child shares its recorded history and appends one entry.
    pub(crate) fn extend<P>(
        &self,
        token: usize,
        log_prob: f32,
        score: f32,
        committed: Committed<S>,
        expansion: &Expansion<P>,
    ) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(token);
        let mut outputs = self.outputs.clone();
        outputs.push(Arc::new(committed.output));
        let mut cumulative = self.cumulative.clone();
        cumulative += &expansion.alignment;
        let mut alignments = self.alignments.clone();
        alignments.push(Arc::new(expansion.alignment.clone()));
        let mut cross_alignments = self.cross_alignments.clone();
        if let Some(cross) = &expansion.cross_alignment {
            cross_alignments.push(Arc::new(cross.clone()));
        }
        let mut token_log_probs = self.token_log_probs.clone();
        token_log_probs.push(log_prob);
        Self {
            tokens,
            score,
            state: committed.state,
            outputs,
            alignments,
            cross_alignments,
            token_log_probs,
            cumulative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Hypothesis<u8> {
        Hypothesis::root(
            9,
            Start {
                state: 0,
                output: Array1::zeros(2),
                alignment: Array2::zeros((3, 1)),
                cross_alignment: None,
            },
        )
    }

    fn expansion(position: usize) -> Expansion<()> {
        let mut alignment = Array2::zeros((3, 1));
        alignment[[position, 0]] = 1.0;
        Expansion {
            log_probs: Array1::zeros(10),
            alignment,
            cross_alignment: None,
            pending: (),
        }
    }

    fn committed(state: u8) -> Committed<u8> {
        Committed {
            state,
            output: Array1::from_elem(2, state as f32),
        }
    }

    #[test]
    fn root_holds_only_start_token() {
        let hyp = root();
        assert_eq!(hyp.tokens, vec![9]);
        assert_eq!(hyp.len(), 1);
        assert!(!hyp.ends_with(9));
        assert_eq!(hyp.outputs.len(), 1);
        assert!(hyp.cross_alignments.is_empty());
    }

    #[test]
    fn extend_leaves_parent_untouched() {
        let parent = root();
        let a = parent.extend(1, -0.5, -0.5, committed(1), &expansion(0));
        let b = parent.extend(2, -1.0, -1.0, committed(2), &expansion(1));
        assert_eq!(parent.len(), 1);
        assert_eq!(a.tokens, vec![9, 1]);
        assert_eq!(b.tokens, vec![9, 2]);
        assert_eq!(a.state, 1);
        assert_eq!(b.state, 2);
        assert_eq!(a.alignments.len(), 2);
        assert_eq!(b.alignments[1][[1, 0]], 1.0);
        assert_eq!(a.alignments[1][[1, 0]], 0.0);
    }

    #[test]
    fn siblings_share_parent_history() {
        let parent = root().extend(1, -0.5, -0.5, committed(1), &expansion(0));
        let a = parent.extend(1, -0.5, -1.0, committed(3), &expansion(1));
        let b = parent.extend(2, -0.7, -1.2, committed(4), &expansion(2));
        for i in 0..parent.alignments.len() {
            assert!(Arc::ptr_eq(&a.alignments[i], &parent.alignments[i]));
            assert!(Arc::ptr_eq(&b.alignments[i], &parent.alignments[i]));
            assert!(Arc::ptr_eq(&a.outputs[i], &b.outputs[i]));
        }
        assert!(!Arc::ptr_eq(&a.alignments[2], &b.alignments[2]));
        assert_eq!(parent.cumulative_alignment().column(0).to_vec(), vec![1.0, 0.0, 0.0]);
        assert_eq!(a.cumulative_alignment().column(0).to_vec(), vec![1.0, 1.0, 0.0]);
        assert_eq!(b.cumulative_alignment().column(0).to_vec(), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn cumulative_alignment_sums_steps() {
        let hyp = root()
            .extend(1, -0.1, -0.1, committed(1), &expansion(0))
            .extend(1, -0.1, -0.2, committed(1), &expansion(0))
            .extend(2, -0.1, -0.3, committed(2), &expansion(2));
        let total = hyp.cumulative_alignment();
        assert_eq!(total.column(0).to_vec(), vec![2.0, 0.0, 1.0]);
        assert!((hyp.log_likelihood() + 0.3).abs() < 1e-6);
    }
}
