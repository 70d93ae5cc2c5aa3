//! Hierarchical decoding: the sub-task (character) search first, then the
//! main-task (word) search attending over the winning sub hypothesis.
//!
//! ```text
//!  Utterance.sub ──► SubDecoder ──beam──► best char hypothesis
//!                                             │ decoder outputs (len × units)
//!                                             ▼
//!  Utterance.main ─► main TaskDecoder ◄── SubTaskContext
//!                         │ acoustic + cross-level attention per step
//!                         ▼
//!                   best word hypothesis + word→char cross alignment
//! ```
//!
//! The main search of an utterance never starts before its sub search has
//! finished; `SubTaskContext` is the only way to hand the history across.

pub mod batch;
pub mod diagnostics;

use std::sync::Arc;
use std::time::Instant;

use ndarray::{s, Array2, ArrayView2};
use tracing::debug;

use crate::config::{DecodeConfig, Direction, ModelConfig, SearchConfig};
use crate::encoded::Utterance;
use crate::error::{NestdecError, Result};
use crate::inference::TaskDecoder;
use crate::nn::attention::head_mean;
use crate::nn::{DecoderState, ParamInit};
use crate::report::{TaskHypothesis, UtteranceDecode};
use crate::search::{search, Hypothesis, SearchOutcome, TokenSource};

pub use batch::{decode_batch, decode_batch_parallel, BatchDecoder};
pub use diagnostics::{DecodeDiagnostics, DiagnosticsSnapshot};

/// Sub-task decoder, tagged with its reading direction. A backward decoder
/// emits the transcript last token first.
#[derive(Debug, Clone, PartialEq)]
pub enum SubDecoder {
    Forward(TaskDecoder),
    Backward(TaskDecoder),
}

impl SubDecoder {
    pub fn new(direction: Direction, decoder: TaskDecoder) -> Self {
        match direction {
            Direction::Forward => SubDecoder::Forward(decoder),
            Direction::Backward => SubDecoder::Backward(decoder),
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            SubDecoder::Forward(_) => Direction::Forward,
            SubDecoder::Backward(_) => Direction::Backward,
        }
    }

    pub fn decoder(&self) -> &TaskDecoder {
        match self {
            SubDecoder::Forward(decoder) | SubDecoder::Backward(decoder) => decoder,
        }
    }
}

/// Decoder-output history of a finished sub search, in decoding order.
#[derive(Debug, Clone, PartialEq)]
pub struct SubTaskContext {
    history: Array2<f32>,
    len: usize,
}

impl SubTaskContext {
    /// `history` must hold exactly `len` rows.
    pub fn new(history: Array2<f32>, len: usize) -> Result<Self> {
        if history.nrows() != len {
            return Err(NestdecError::LengthMismatch {
                expected: len,
                actual: history.nrows(),
            });
        }
        Ok(Self { history, len })
    }

    /// Outputs after every emitted token (EOS included), without the initial
    /// output the root was built from.
    pub(crate) fn from_hypothesis(hyp: &Hypothesis<DecoderState>, units: usize) -> Result<Self> {
        let steps = hyp.outputs.get(1..).unwrap_or_default();
        let mut history = Array2::zeros((steps.len(), units));
        for (mut row, output) in history.rows_mut().into_iter().zip(steps) {
            if output.len() != units {
                return Err(NestdecError::DimensionMismatch {
                    what: "sub decoder output",
                    expected: units,
                    got: output.len(),
                });
            }
            row.assign(&**output);
        }
        Self::new(history, hyp.len().saturating_sub(1))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn history(&self) -> ArrayView2<'_, f32> {
        self.history.view()
    }
}

/// Result of a sub search: the reading-order hypothesis and the history the
/// main search attends over.
#[derive(Debug, Clone)]
pub struct SubTaskOutcome {
    pub hypothesis: TaskHypothesis,
    pub context: SubTaskContext,
}

#[derive(Debug, Clone)]
pub struct MainTaskOutcome {
    pub hypothesis: TaskHypothesis,
    pub cross_alignment: Array2<f32>,
}

/// Sub-task decoder plus main-task decoder with cross-level attention.
#[derive(Debug, Clone)]
pub struct HierarchicalModel {
    config: ModelConfig,
    main: TaskDecoder,
    sub: SubDecoder,
}

impl HierarchicalModel {
    /// Validates `config` and draws every parameter from a generator seeded
    /// with `seed`.
    ///
    /// # Errors
    /// `Configuration` for an invalid configuration.
    pub fn new(config: ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut init = ParamInit::new(seed, config.parameter_init);
        let sub = TaskDecoder::init(&mut init, &config, &config.sub, None);
        let main = TaskDecoder::init(&mut init, &config, &config.main, Some(config.sub.units));
        debug!(
            order = %config.decoding_order,
            usage = %config.usage_dec_sub,
            direction = %config.sub_direction(),
            "hierarchical model built"
        );
        Ok(Self {
            sub: SubDecoder::new(config.sub_direction(), sub),
            main,
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn main_decoder(&self) -> &TaskDecoder {
        &self.main
    }

    pub fn sub_decoder(&self) -> &SubDecoder {
        &self.sub
    }

    /// Sub-task search. With `labels` (reading order, no start or end token)
    /// the search replays them at width 1 instead.
    pub fn decode_sub(
        &self,
        utterance: &Utterance,
        config: &SearchConfig,
        labels: Option<&[usize]>,
        diagnostics: &DecodeDiagnostics,
    ) -> Result<SubTaskOutcome> {
        utterance.validate()?;
        let direction = self.sub.direction();
        let decoder = self.sub.decoder();
        let step = decoder.bind((utterance.sub.view(), utterance.sub.len), None)?;

        let replay = labels.map(|labels| {
            let mut replay = labels.to_vec();
            direction.to_reading_order(&mut replay);
            replay
        });
        let source = match &replay {
            Some(replay) => TokenSource::Forced(replay),
            None => TokenSource::Search,
        };
        let outcome = search(&step, config, source, diagnostics)?;
        let context = SubTaskContext::from_hypothesis(&outcome.best, decoder.units())?;
        let (hypothesis, _) = emit(&outcome, decoder.eos(), direction);
        debug!(
            tokens = hypothesis.tokens.len(),
            history = context.len(),
            completed = hypothesis.completed,
            "sub-task search finished"
        );
        Ok(SubTaskOutcome {
            hypothesis,
            context,
        })
    }

    /// Main-task search over `utterance.main` and the finished sub history.
    pub fn decode_main(
        &self,
        utterance: &Utterance,
        sub: &SubTaskContext,
        config: &SearchConfig,
        labels: Option<&[usize]>,
        diagnostics: &DecodeDiagnostics,
    ) -> Result<MainTaskOutcome> {
        utterance.validate()?;
        let step = self.main.bind(
            (utterance.main.view(), utterance.main.len),
            Some((sub.history(), sub.len())),
        )?;
        let source = labels.map_or(TokenSource::Search, TokenSource::Forced);
        let outcome = search(&step, config, source, diagnostics)?;
        let (hypothesis, cross_alignment) = emit(&outcome, self.main.eos(), Direction::Forward);
        debug!(
            tokens = hypothesis.tokens.len(),
            completed = hypothesis.completed,
            "main-task search finished"
        );
        Ok(MainTaskOutcome {
            hypothesis,
            cross_alignment: cross_alignment.unwrap_or_else(|| Array2::zeros((0, sub.len()))),
        })
    }

    /// Both searches for one utterance, sub first.
    pub fn decode(
        &self,
        utterance: &Utterance,
        config: &DecodeConfig,
        diagnostics: &DecodeDiagnostics,
    ) -> Result<UtteranceDecode> {
        self.decode_with(utterance, config, None, diagnostics)
    }

    /// Like [`decode`](Self::decode) but the sub search replays `labels_sub`
    /// at width 1.
    pub fn decode_teacher_forced(
        &self,
        utterance: &Utterance,
        labels_sub: &[usize],
        config: &DecodeConfig,
        diagnostics: &DecodeDiagnostics,
    ) -> Result<UtteranceDecode> {
        self.decode_with(utterance, &config.teacher_forced(), Some(labels_sub), diagnostics)
    }

    /// Replays reference labels for both tasks through the same step
    /// machinery and returns their per-token log-probabilities, alignments
    /// and cross alignment.
    pub fn force_decode(
        &self,
        utterance: &Utterance,
        labels: &[usize],
        labels_sub: &[usize],
    ) -> Result<UtteranceDecode> {
        let diagnostics = DecodeDiagnostics::default();
        let forced = |len: usize| SearchConfig {
            beam_width: 1,
            max_decode_len: len + 1,
            ..SearchConfig::default()
        };
        let sub = self.decode_sub(
            utterance,
            &forced(labels_sub.len()),
            Some(labels_sub),
            &diagnostics,
        )?;
        let main = self.decode_main(
            utterance,
            &sub.context,
            &forced(labels.len()),
            Some(labels),
            &diagnostics,
        )?;
        Ok(UtteranceDecode {
            main: main.hypothesis,
            sub: sub.hypothesis,
            cross_alignment: main.cross_alignment,
        })
    }

    pub(crate) fn decode_with(
        &self,
        utterance: &Utterance,
        config: &DecodeConfig,
        labels_sub: Option<&[usize]>,
        diagnostics: &DecodeDiagnostics,
    ) -> Result<UtteranceDecode> {
        let started = Instant::now();
        let sub = self.decode_sub(utterance, &config.sub, labels_sub, diagnostics)?;
        let main = self.decode_main(utterance, &sub.context, &config.main, None, diagnostics)?;
        diagnostics.record_latency(started.elapsed().as_secs_f64() * 1000.0);
        diagnostics.add(&diagnostics.utterances_decoded, 1);
        Ok(UtteranceDecode {
            main: main.hypothesis,
            sub: sub.hypothesis,
            cross_alignment: main.cross_alignment,
        })
    }
}

/// Turns the best hypothesis into reading-order output: start token and
/// closing EOS dropped, alignments trimmed to the emitted tokens and
/// averaged over heads. Returns the cross alignment when the decoder has
/// one.
pub(crate) fn emit<S: Clone>(
    outcome: &SearchOutcome<S>,
    eos: usize,
    direction: Direction,
) -> (TaskHypothesis, Option<Array2<f32>>) {
    let best = &outcome.best;
    let mut tokens: Vec<usize> = best.tokens.iter().skip(1).copied().collect();
    if best.ends_with(eos) {
        tokens.pop();
    }
    let emitted = tokens.len();
    direction.to_reading_order(&mut tokens);

    let alignment = stack_steps(&best.alignments, emitted, direction);
    let cross = (!best.cross_alignments.is_empty())
        .then(|| stack_steps(&best.cross_alignments, emitted, direction));

    let hypothesis = TaskHypothesis {
        tokens,
        score: best.score,
        log_likelihood: best.log_likelihood(),
        token_log_probs: best.token_log_probs.clone(),
        completed: outcome.completed,
        alignment,
    };
    (hypothesis, cross)
}

/// Rows `1..=emitted` of a per-step history, heads averaged, in reading
/// order.
fn stack_steps(steps: &[Arc<Array2<f32>>], emitted: usize, direction: Direction) -> Array2<f32> {
    let width = steps.first().map_or(0, |a| a.nrows());
    let mut order: Vec<usize> = (1..=emitted).collect();
    direction.to_reading_order(&mut order);
    let mut out = Array2::zeros((emitted, width));
    for (row, step) in order.into_iter().enumerate() {
        if let Some(a) = steps.get(step) {
            out.slice_mut(s![row, ..]).assign(&head_mean(a.view()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttentionConfig;
    use crate::encoded::EncodedSequence;
    use crate::inference::ScriptedDecoder;

    #[test]
    fn sub_context_rejects_mismatched_history() {
        let err = SubTaskContext::new(Array2::zeros((3, 4)), 2).unwrap_err();
        assert!(matches!(
            err,
            NestdecError::LengthMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(SubTaskContext::new(Array2::zeros((2, 4)), 2).unwrap().len(), 2);
    }

    #[test]
    fn emit_trims_and_reverses_backward_output() {
        let dec = ScriptedDecoder::following(vec![2, 3, 2], 1, 4, 5);
        let diag = DecodeDiagnostics::default();
        let cfg = SearchConfig {
            beam_width: 2,
            max_decode_len: 8,
            ..SearchConfig::default()
        };
        let outcome = search(&dec, &cfg, TokenSource::Search, &diag).unwrap();
        assert_eq!(outcome.best.tokens, vec![1, 2, 3, 2, 1]);

        let (forward, cross) = emit(&outcome, 1, Direction::Forward);
        assert!(cross.is_none());
        assert_eq!(forward.tokens, vec![2, 3, 2]);
        assert_eq!(forward.alignment.dim(), (3, 5));
        assert_eq!(forward.alignment[[0, 0]], 1.0);
        assert_eq!(forward.alignment[[2, 2]], 1.0);
        assert_eq!(forward.token_log_probs.len(), 4);

        let (backward, _) = emit(&outcome, 1, Direction::Backward);
        assert_eq!(backward.tokens, vec![2, 3, 2]);
        assert_eq!(backward.alignment[[0, 2]], 1.0);
        assert_eq!(backward.alignment[[2, 0]], 1.0);
    }

    fn tiny_model() -> HierarchicalModel {
        let task = |classes| crate::config::TaskConfig {
            num_classes: classes,
            encoder_dim: 3,
            units: 5,
            layers: 1,
            embedding_dim: 3,
            bottleneck_dim: 4,
            attention: AttentionConfig {
                dim: 4,
                ..AttentionConfig::default()
            },
        };
        let config = ModelConfig {
            main: task(4),
            sub: task(6),
            cross_attention: AttentionConfig {
                dim: 4,
                ..AttentionConfig::default()
            },
            ..ModelConfig::default()
        };
        HierarchicalModel::new(config, 5).unwrap()
    }

    fn utterance() -> Utterance {
        let frames = Array2::from_shape_fn((6, 3), |(t, d)| ((t * 3 + d) as f32 * 0.21).sin());
        Utterance::shared(EncodedSequence::new(frames, 5).unwrap())
    }

    #[test]
    fn sub_history_length_matches_hypothesis() {
        let model = tiny_model();
        let diag = DecodeDiagnostics::default();
        let cfg = SearchConfig {
            beam_width: 3,
            max_decode_len: 7,
            ..SearchConfig::default()
        };
        let sub = model.decode_sub(&utterance(), &cfg, None, &diag).unwrap();
        let steps = sub.hypothesis.tokens.len() + usize::from(sub.hypothesis.completed);
        assert_eq!(sub.context.len(), steps);
        assert_eq!(sub.context.history().ncols(), 5);
        assert!(sub.context.len() <= 7);
    }

    #[test]
    fn force_decode_replays_both_tasks() {
        let model = tiny_model();
        let out = model.force_decode(&utterance(), &[1, 2], &[0, 5, 5]).unwrap();
        assert_eq!(out.main.tokens, vec![1, 2]);
        assert_eq!(out.sub.tokens, vec![0, 5, 5]);
        assert!(out.main.completed && out.sub.completed);
        assert_eq!(out.main.token_log_probs.len(), 3);
        assert_eq!(out.sub.alignment.dim(), (3, 6));
        // Sub history is three tokens plus EOS.
        assert_eq!(out.cross_alignment.dim(), (2, 4));
        assert!(out.main.log_likelihood < 0.0);
    }

    #[test]
    fn forced_labels_must_be_output_classes() {
        let model = tiny_model();
        // 6 is the sub task's shared start/end index.
        assert!(matches!(
            model.force_decode(&utterance(), &[1], &[6]),
            Err(NestdecError::InvalidInput(_))
        ));
    }
}
