//! Attention-based recurrent task decoder.
//!
//! One `TaskDecoder` serves either task. The main-task decoder additionally
//! carries a [`CrossLevel`] block that attends over the sub decoder's output
//! history; the sub-task decoder has none.
//!
//! ```text
//!  attend_generate_update:  ctx = att(out[t-1])  → logits(out[t-1], ctx)
//!                           → out[t] = rnn([y[t]; ctx], state)
//!  attend_update_generate:  ctx = att(out[t-1])  → out[t] = rnn([y[t-1]; ctx], state)
//!                           → logits(out[t], ctx)
//!  conditional:             h = rnn₁(y[t-1], state) → ctx = att(h)
//!                           → out[t] = rnn₂(ctx, state') → logits(out[t], ctx)
//! ```
//!
//! `ctx` above is the acoustic context followed by the cross-level context
//! when the decoder has one. Logits are
//! `fc(tanh(W_d·out + W_c·ctx_enc [+ W_c_dec·ctx_dec]))`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::config::{
    AttentionConfig, ContextFusion, DecodingOrder, InitDecoderState, ModelConfig, RnnType,
    SubContextUsage, TaskConfig,
};
use crate::error::{NestdecError, Result};
use crate::inference::{Committed, Expansion, Start, StepDecoder};
use crate::nn::math::log_softmax;
use crate::nn::{
    concat, AttentionMechanism, AttentionStep, DecoderState, Embedding, Linear, ParamInit,
    PreparedSource, RnnStack,
};
use crate::search::Hypothesis;

/// Step ordering together with the cells it drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Recurrence {
    AttendGenerateUpdate(RnnStack),
    AttendUpdateGenerate(RnnStack),
    Conditional { first: RnnStack, second: RnnStack },
}

impl Recurrence {
    pub fn order(&self) -> DecodingOrder {
        match self {
            Recurrence::AttendGenerateUpdate(_) => DecodingOrder::AttendGenerateUpdate,
            Recurrence::AttendUpdateGenerate(_) => DecodingOrder::AttendUpdateGenerate,
            Recurrence::Conditional { .. } => DecodingOrder::Conditional,
        }
    }

    fn state_shape(&self) -> &RnnStack {
        match self {
            Recurrence::AttendGenerateUpdate(cells) | Recurrence::AttendUpdateGenerate(cells) => {
                cells
            }
            Recurrence::Conditional { first, .. } => first,
        }
    }
}

/// Main-task attention over the sub decoder outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossLevel {
    attention: AttentionMechanism,
    usage: SubContextUsage,
    fusion: ContextFusion,
    /// Output projection of the cross context, summed fusion only.
    w_out: Option<Linear>,
    relax: Option<Linear>,
}

impl CrossLevel {
    fn init(
        init: &mut ParamInit,
        model: &ModelConfig,
        attention: &AttentionConfig,
        source_dim: usize,
        query_dim: usize,
        bottleneck_dim: usize,
    ) -> Self {
        let attention = AttentionMechanism::init(init, attention, source_dim, query_dim);
        let ctx_dim = attention.context_dim();
        let w_out = (model.usage_dec_sub == SubContextUsage::All
            && model.context_fusion == ContextFusion::Sum)
            .then(|| Linear::init(init, ctx_dim, bottleneck_dim));
        let relax = model
            .relax_context_vec_dec
            .then(|| Linear::init(init, ctx_dim, ctx_dim));
        Self {
            attention,
            usage: model.usage_dec_sub,
            fusion: model.context_fusion,
            w_out,
            relax,
        }
    }

    pub fn usage(&self) -> SubContextUsage {
        self.usage
    }

    pub fn context_dim(&self) -> usize {
        self.attention.context_dim()
    }

    fn concat_into_output(&self) -> bool {
        self.usage == SubContextUsage::All && self.fusion == ContextFusion::Concat
    }
}

/// How the initial decoder state is derived from the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum InitProjection {
    Zero,
    Encoder {
        mode: InitDecoderState,
        proj: Linear,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDecoder {
    recurrence: Recurrence,
    attention: AttentionMechanism,
    embed: Embedding,
    w_d: Linear,
    w_c: Linear,
    fc: Linear,
    init: InitProjection,
    cross: Option<CrossLevel>,
    eos: usize,
    logits_temperature: f32,
}

impl TaskDecoder {
    /// Builds a decoder for `task`. `cross_source_dim` is the width of the sub
    /// decoder outputs for the main-task decoder and `None` for the sub-task
    /// decoder.
    pub fn init(
        init: &mut ParamInit,
        model: &ModelConfig,
        task: &TaskConfig,
        cross_source_dim: Option<usize>,
    ) -> Self {
        let kind = model.decoder_type;
        let forget_one = model.init_forget_gate_bias_with_one;
        let attention = AttentionMechanism::init(init, &task.attention, task.encoder_dim, task.units);
        let cross = cross_source_dim.map(|dim| {
            CrossLevel::init(
                init,
                model,
                &model.cross_attention,
                dim,
                task.units,
                task.bottleneck_dim,
            )
        });
        let ctx_enc = attention.context_dim();
        let ctx_dec = cross.as_ref().map_or(0, CrossLevel::context_dim);
        let stack = |init: &mut ParamInit, input: usize| {
            RnnStack::init(init, kind, input, task.units, task.layers, forget_one)
        };
        let recurrence = match model.decoding_order {
            DecodingOrder::AttendGenerateUpdate => Recurrence::AttendGenerateUpdate(stack(
                init,
                task.embedding_dim + ctx_enc + ctx_dec,
            )),
            DecodingOrder::AttendUpdateGenerate => Recurrence::AttendUpdateGenerate(stack(
                init,
                task.embedding_dim + ctx_enc + ctx_dec,
            )),
            DecodingOrder::Conditional => Recurrence::Conditional {
                first: stack(init, task.embedding_dim),
                second: stack(init, ctx_enc + ctx_dec),
            },
        };
        let w_c_input = match &cross {
            Some(cross) if cross.concat_into_output() => ctx_enc + ctx_dec,
            _ => ctx_enc,
        };
        let init_projection = match model.init_dec_state {
            InitDecoderState::Zero => InitProjection::Zero,
            mode => InitProjection::Encoder {
                mode,
                proj: Linear::init(init, task.encoder_dim, task.units),
            },
        };
        Self {
            recurrence,
            attention,
            embed: Embedding::init(init, task.vocab_size(), task.embedding_dim),
            w_d: Linear::init(init, task.units, task.bottleneck_dim),
            w_c: Linear::init(init, w_c_input, task.bottleneck_dim),
            fc: Linear::init(init, task.bottleneck_dim, task.vocab_size()),
            init: init_projection,
            cross,
            eos: task.eos(),
            logits_temperature: model.logits_temperature,
        }
    }

    pub fn order(&self) -> DecodingOrder {
        self.recurrence.order()
    }

    pub fn rnn_type(&self) -> RnnType {
        self.recurrence.state_shape().kind()
    }

    pub fn units(&self) -> usize {
        self.recurrence.state_shape().units()
    }

    pub fn eos(&self) -> usize {
        self.eos
    }

    pub fn vocab_size(&self) -> usize {
        self.embed.vocab_size()
    }

    pub fn cross_level(&self) -> Option<&CrossLevel> {
        self.cross.as_ref()
    }

    /// Binds the decoder to one utterance. `encoded` is the acoustic
    /// sequence and its valid length; `sub_history` the sub decoder outputs
    /// and their length, required exactly when the decoder has a cross-level
    /// block.
    pub fn bind<'a>(
        &'a self,
        encoded: (ArrayView2<'a, f32>, usize),
        sub_history: Option<(ArrayView2<'a, f32>, usize)>,
    ) -> Result<TaskStep<'a>> {
        let acoustic = self.attention.prepare(encoded.0, encoded.1)?;
        let cross = match (&self.cross, sub_history) {
            (Some(cross), Some((values, len))) => Some(cross.attention.prepare(values, len)?),
            (None, None) => None,
            (Some(_), None) => {
                return Err(NestdecError::InvalidInput(
                    "main-task decoder needs the sub decoder history".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(NestdecError::InvalidInput(
                    "sub decoder history given to a decoder without cross attention".into(),
                ))
            }
        };
        Ok(TaskStep {
            decoder: self,
            acoustic,
            cross,
        })
    }

    fn initial_state(&self, acoustic: &PreparedSource<'_>) -> Result<(DecoderState, Array1<f32>)> {
        let shape = self.recurrence.state_shape();
        let zero = || (shape.zero_state(), Array1::zeros(shape.units()));
        let InitProjection::Encoder { mode, proj } = &self.init else {
            return Ok(zero());
        };
        if acoustic.is_empty() {
            return Ok(zero());
        }
        let valid = acoustic.values();
        let frame = match mode {
            InitDecoderState::First => valid.row(0).to_owned(),
            InitDecoderState::Final => valid.row(acoustic.len() - 1).to_owned(),
            _ => valid
                .slice(ndarray::s![..acoustic.len(), ..])
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(valid.ncols())),
        };
        let h0 = proj.forward(frame.view())?.mapv(f32::tanh);
        let state = DecoderState::broadcast_hidden(shape.kind(), shape.layers(), h0.clone());
        Ok((state, h0))
    }

    fn generate(
        &self,
        output: ArrayView1<'_, f32>,
        context: &Array1<f32>,
        cross_context: Option<&Array1<f32>>,
    ) -> Result<Array1<f32>> {
        let mut hidden = self.w_d.forward(output)?;
        match (&self.cross, cross_context) {
            (Some(cross), Some(ctx_dec)) if cross.usage == SubContextUsage::All => {
                match (&cross.w_out, cross.fusion) {
                    (Some(w_out), ContextFusion::Sum) => {
                        hidden += &self.w_c.forward(context.view())?;
                        hidden += &w_out.forward(ctx_dec.view())?;
                    }
                    _ => {
                        let joint = concat(&[context.view(), ctx_dec.view()])?;
                        hidden += &self.w_c.forward(joint.view())?;
                    }
                }
            }
            _ => hidden += &self.w_c.forward(context.view())?,
        }
        let logits = self.fc.forward(hidden.mapv(f32::tanh).view())? / self.logits_temperature;
        Ok(log_softmax(logits.view()))
    }

    fn recurrence_input<'v>(
        &self,
        prefix: Option<ArrayView1<'v, f32>>,
        context: &'v Array1<f32>,
        cross_context: Option<&'v Array1<f32>>,
    ) -> Result<Array1<f32>> {
        let mut parts = Vec::with_capacity(3);
        parts.extend(prefix);
        parts.push(context.view());
        if let Some(ctx_dec) = cross_context {
            parts.push(ctx_dec.view());
        }
        concat(&parts)
    }
}

/// Intermediate values of one `expand` call.
#[derive(Debug, Clone)]
pub struct StepPending {
    context: Array1<f32>,
    cross_context: Option<Array1<f32>>,
    /// Already-advanced state and output for orderings that recur before
    /// generating.
    advanced: Option<(DecoderState, Array1<f32>)>,
}

/// A `TaskDecoder` bound to one utterance's sources.
#[derive(Debug, Clone)]
pub struct TaskStep<'a> {
    decoder: &'a TaskDecoder,
    acoustic: PreparedSource<'a>,
    cross: Option<PreparedSource<'a>>,
}

impl TaskStep<'_> {
    fn attend(
        &self,
        query: ArrayView1<'_, f32>,
        prev_alignment: &Array2<f32>,
        prev_cross: Option<&Array2<f32>>,
    ) -> Result<(AttentionStep, Option<AttentionStep>)> {
        let acoustic = self
            .decoder
            .attention
            .score(&self.acoustic, query, prev_alignment.view())?;
        let cross = match (&self.decoder.cross, &self.cross) {
            (Some(level), Some(source)) => {
                let prev = prev_cross.ok_or_else(|| {
                    NestdecError::InvalidInput("hypothesis lacks cross-level alignments".into())
                })?;
                let mut step = level.attention.score(source, query, prev.view())?;
                if let Some(relax) = &level.relax {
                    step.context = relax.forward(step.context.view())?;
                }
                Some(step)
            }
            _ => None,
        };
        Ok((acoustic, cross))
    }
}

fn history<S: Clone>(hyp: &Hypothesis<S>) -> Result<(&Array1<f32>, &Array2<f32>)> {
    match (hyp.last_output(), hyp.last_alignment()) {
        (Some(output), Some(alignment)) => Ok((output, alignment)),
        _ => Err(NestdecError::InvalidInput(
            "hypothesis has no decoder history".into(),
        )),
    }
}

impl StepDecoder for TaskStep<'_> {
    type State = DecoderState;
    type Pending = StepPending;

    fn eos(&self) -> usize {
        self.decoder.eos
    }

    fn vocab_size(&self) -> usize {
        self.decoder.vocab_size()
    }

    fn start(&self) -> Result<Start<DecoderState>> {
        let (state, output) = self.decoder.initial_state(&self.acoustic)?;
        Ok(Start {
            state,
            output,
            alignment: self.decoder.attention.initial_alignment(&self.acoustic),
            cross_alignment: match (&self.decoder.cross, &self.cross) {
                (Some(level), Some(source)) => Some(level.attention.initial_alignment(source)),
                _ => None,
            },
        })
    }

    fn expand(&self, hyp: &Hypothesis<DecoderState>) -> Result<Expansion<StepPending>> {
        let dec = self.decoder;
        let (prev_output, prev_alignment) = history(hyp)?;
        let prev_cross = hyp.last_cross_alignment();

        let (acoustic, cross, output, advanced) = match &dec.recurrence {
            Recurrence::AttendGenerateUpdate(_) => {
                let (acoustic, cross) = self.attend(prev_output.view(), prev_alignment, prev_cross)?;
                (acoustic, cross, prev_output.clone(), None)
            }
            Recurrence::AttendUpdateGenerate(cells) => {
                let (acoustic, cross) = self.attend(prev_output.view(), prev_alignment, prev_cross)?;
                let y = dec.embed.lookup(hyp.last_token())?;
                let input = dec.recurrence_input(
                    Some(y),
                    &acoustic.context,
                    cross.as_ref().map(|c| &c.context),
                )?;
                let (output, state) = cells.step(input.view(), &hyp.state)?;
                (acoustic, cross, output.clone(), Some((state, output)))
            }
            Recurrence::Conditional { first, second } => {
                let y = dec.embed.lookup(hyp.last_token())?;
                let (query, mid_state) = first.step(y, &hyp.state)?;
                let (acoustic, cross) = self.attend(query.view(), prev_alignment, prev_cross)?;
                let input =
                    dec.recurrence_input(None, &acoustic.context, cross.as_ref().map(|c| &c.context))?;
                let (output, state) = second.step(input.view(), &mid_state)?;
                (acoustic, cross, output.clone(), Some((state, output)))
            }
        };

        let log_probs = dec.generate(
            output.view(),
            &acoustic.context,
            cross.as_ref().map(|c| &c.context),
        )?;
        let (cross_alignment, cross_context) = match cross {
            Some(step) => (Some(step.alignment), Some(step.context)),
            None => (None, None),
        };
        Ok(Expansion {
            log_probs,
            alignment: acoustic.alignment,
            cross_alignment,
            pending: StepPending {
                context: acoustic.context,
                cross_context,
                advanced,
            },
        })
    }

    fn commit(
        &self,
        hyp: &Hypothesis<DecoderState>,
        pending: &StepPending,
        token: usize,
    ) -> Result<Committed<DecoderState>> {
        let dec = self.decoder;
        match (&dec.recurrence, &pending.advanced) {
            (Recurrence::AttendGenerateUpdate(cells), _) => {
                let y = dec.embed.lookup(token)?;
                let input =
                    dec.recurrence_input(Some(y), &pending.context, pending.cross_context.as_ref())?;
                let (output, state) = cells.step(input.view(), &hyp.state)?;
                Ok(Committed { state, output })
            }
            (_, Some((state, output))) => Ok(Committed {
                state: state.branch(),
                output: output.clone(),
            }),
            (_, None) => Err(NestdecError::InvalidInput(
                "step committed without an advanced state".into(),
            )),
        }
    }
}
