//! `ScriptedDecoder`: a step decoder driven by a plain function instead of a
//! network.
//!
//! Used to exercise the searches end to end with hand-picked distributions.
//! The alignment of step `t` is one-hot at source position `t` (clamped to
//! the last valid position), so coverage behaves predictably.

use ndarray::{Array1, Array2};
use tracing::debug;

use crate::error::{check_dim, Result};
use crate::inference::{Committed, Expansion, Start, StepDecoder};
use crate::nn::math::log_softmax;
use crate::search::Hypothesis;

type Script = dyn Fn(&[usize]) -> Vec<f32> + Send + Sync;

pub struct ScriptedDecoder {
    eos: usize,
    vocab: usize,
    source_len: usize,
    script: Box<Script>,
}

impl ScriptedDecoder {
    /// `script` maps the tokens so far (start token included) to logits over
    /// the vocabulary.
    pub fn new<F>(eos: usize, vocab: usize, source_len: usize, script: F) -> Self
    where
        F: Fn(&[usize]) -> Vec<f32> + Send + Sync + 'static,
    {
        Self {
            eos,
            vocab,
            source_len,
            script: Box::new(script),
        }
    }

    /// Strongly prefers `labels[t]` at step `t`, then EOS.
    pub fn following(labels: Vec<usize>, eos: usize, vocab: usize, source_len: usize) -> Self {
        Self::new(eos, vocab, source_len, move |tokens| {
            let step = tokens.len().saturating_sub(1);
            let target = labels.get(step).copied().unwrap_or(eos);
            (0..vocab)
                .map(|v| if v == target { 4.0 } else { 0.0 })
                .collect()
        })
    }

    pub fn source_len(&self) -> usize {
        self.source_len
    }
}

impl std::fmt::Debug for ScriptedDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedDecoder")
            .field("eos", &self.eos)
            .field("vocab", &self.vocab)
            .field("source_len", &self.source_len)
            .finish_non_exhaustive()
    }
}

impl StepDecoder for ScriptedDecoder {
    /// Steps taken so far.
    type State = usize;
    type Pending = ();

    fn eos(&self) -> usize {
        self.eos
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn start(&self) -> Result<Start<usize>> {
        debug!(vocab = self.vocab, source_len = self.source_len, "scripted decoder start");
        Ok(Start {
            state: 0,
            output: Array1::zeros(2),
            alignment: Array2::zeros((self.source_len, 1)),
            cross_alignment: None,
        })
    }

    fn expand(&self, hyp: &Hypothesis<usize>) -> Result<Expansion<()>> {
        let logits = Array1::from((self.script)(&hyp.tokens));
        check_dim("scripted logits", self.vocab, logits.len())?;
        let mut alignment = Array2::zeros((self.source_len, 1));
        if self.source_len > 0 {
            let position = hyp.state.min(self.source_len - 1);
            alignment[[position, 0]] = 1.0;
        }
        Ok(Expansion {
            log_probs: log_softmax(logits.view()),
            alignment,
            cross_alignment: None,
            pending: (),
        })
    }

    fn commit(&self, hyp: &Hypothesis<usize>, _pending: &(), token: usize) -> Result<Committed<usize>> {
        Ok(Committed {
            state: hyp.state + 1,
            output: Array1::from(vec![token as f32, hyp.len() as f32]),
        })
    }
}
