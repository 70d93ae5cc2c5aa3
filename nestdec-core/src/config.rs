//! Model and search configuration.
//!
//! `ModelConfig` describes the shape of a hierarchical model: one sub-task
//! (character) decoder and one main-task (word) decoder that additionally
//! attends over the sub decoder's outputs. `DecodeConfig` carries the search
//! hyperparameters for both tasks, which are independent of each other.
//!
//! Every enum accepts its snake_case name through both serde and `FromStr`;
//! unknown names surface as `NestdecError::Configuration`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NestdecError, Result};

macro_rules! named_enum {
    ($name:ident, $what:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = NestdecError;

            fn from_str(raw: &str) -> Result<Self> {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($label => Ok($name::$variant),)+
                    other => Err(NestdecError::Configuration(format!(
                        "unknown {} '{}'",
                        $what, other
                    ))),
                }
            }
        }
    };
}

/// Order in which attention, recurrence and generation happen within a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodingOrder {
    /// Attend with the previous output, generate, then run the recurrence
    /// with the realized token.
    #[default]
    AttendGenerateUpdate,
    /// Run the recurrence with the previous token and a fresh context, then
    /// generate.
    AttendUpdateGenerate,
    /// Two cells: the first consumes the token, attention scores against its
    /// output, the second consumes the context.
    Conditional,
}

named_enum!(DecodingOrder, "decoding order", {
    AttendGenerateUpdate => "attend_generate_update",
    AttendUpdateGenerate => "attend_update_generate",
    Conditional => "conditional",
});

/// Where the cross-level (sub decoder) context is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubContextUsage {
    /// Feeds both the recurrence and the output projection.
    #[default]
    All,
    /// Feeds the recurrence only. Still computed and recorded.
    UpdateDecoder,
}

named_enum!(SubContextUsage, "sub context usage", {
    All => "all",
    UpdateDecoder => "update_decoder",
});

/// How acoustic and cross-level contexts enter the output projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextFusion {
    /// Separate projections whose results are summed.
    #[default]
    Sum,
    /// One projection over the concatenated contexts.
    Concat,
}

named_enum!(ContextFusion, "context fusion", {
    Sum => "sum",
    Concat => "concat",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// Additive (Bahdanau) scoring.
    #[default]
    Content,
    /// Additive scoring plus a 1-D convolution over the previous alignment.
    Location,
    /// Scaled dot product between projected keys and query.
    DotProduct,
}

named_enum!(AttentionKind, "attention type", {
    Content => "content",
    Location => "location",
    DotProduct => "dot_product",
});

/// Combination of per-head contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadCombine {
    #[default]
    Concat,
    Average,
}

named_enum!(HeadCombine, "head combination", {
    Concat => "concat",
    Average => "average",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RnnType {
    #[default]
    Lstm,
    Gru,
}

named_enum!(RnnType, "rnn type", {
    Lstm => "lstm",
    Gru => "gru",
});

/// Recurrent family of the (external) acoustic encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderType {
    #[default]
    Lstm,
    Gru,
    Cnn,
}

named_enum!(EncoderType, "encoder type", {
    Lstm => "lstm",
    Gru => "gru",
    Cnn => "cnn",
});

impl EncoderType {
    fn matches(self, decoder: RnnType) -> bool {
        matches!(
            (self, decoder),
            (EncoderType::Lstm, RnnType::Lstm) | (EncoderType::Gru, RnnType::Gru)
        )
    }
}

/// Source of the decoder's initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitDecoderState {
    #[default]
    Zero,
    /// First encoder frame.
    First,
    /// Last valid encoder frame.
    Final,
    /// Mean over valid encoder frames.
    Mean,
}

named_enum!(InitDecoderState, "initial decoder state", {
    Zero => "zero",
    First => "first",
    Final => "final",
    Mean => "mean",
});

/// Reading direction of the sub-task decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

named_enum!(Direction, "direction", {
    Forward => "forward",
    Backward => "backward",
});

impl Direction {
    /// Puts a sequence produced in this direction into reading order.
    /// Backward output is reversed, forward output is left untouched.
    pub fn to_reading_order<T>(self, items: &mut [T]) {
        if self == Direction::Backward {
            items.reverse();
        }
    }
}

/// Attention settings for one attention module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub kind: AttentionKind,
    pub dim: usize,
    pub heads: usize,
    pub combine: HeadCombine,
    /// Multiplies energies before normalization.
    pub sharpening_factor: f32,
    /// Replace the softmax with `sigmoid(e) / Σ sigmoid(e)`.
    pub sigmoid_smoothing: bool,
    pub conv_channels: usize,
    pub conv_width: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            kind: AttentionKind::Content,
            dim: 128,
            heads: 1,
            combine: HeadCombine::Concat,
            sharpening_factor: 1.0,
            sigmoid_smoothing: false,
            conv_channels: 10,
            conv_width: 201,
        }
    }
}

impl AttentionConfig {
    fn validate(&self, what: &str) -> Result<()> {
        if self.dim == 0 || self.heads == 0 {
            return Err(NestdecError::Configuration(format!(
                "{what}: attention dim and heads must be positive"
            )));
        }
        if !(self.sharpening_factor.is_finite() && self.sharpening_factor > 0.0) {
            return Err(NestdecError::Configuration(format!(
                "{what}: sharpening factor must be positive and finite"
            )));
        }
        if self.kind == AttentionKind::Location
            && (self.conv_channels == 0 || self.conv_width == 0)
        {
            return Err(NestdecError::Configuration(format!(
                "{what}: location attention needs conv channels and width"
            )));
        }
        Ok(())
    }
}

/// Shape of one task decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Real output classes. SOS and EOS share the extra index `num_classes`.
    pub num_classes: usize,
    /// Width of the encoded frames this task attends over.
    pub encoder_dim: usize,
    pub units: usize,
    pub layers: usize,
    pub embedding_dim: usize,
    pub bottleneck_dim: usize,
    pub attention: AttentionConfig,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            encoder_dim: 64,
            units: 64,
            layers: 1,
            embedding_dim: 32,
            bottleneck_dim: 64,
            attention: AttentionConfig::default(),
        }
    }
}

impl TaskConfig {
    /// Shared start/end index.
    pub fn eos(&self) -> usize {
        self.num_classes
    }

    pub fn vocab_size(&self) -> usize {
        self.num_classes + 1
    }

    fn validate(&self, what: &str) -> Result<()> {
        let dims = [
            ("num_classes", self.num_classes),
            ("encoder_dim", self.encoder_dim),
            ("units", self.units),
            ("layers", self.layers),
            ("embedding_dim", self.embedding_dim),
            ("bottleneck_dim", self.bottleneck_dim),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(NestdecError::Configuration(format!(
                "{what}: {name} must be positive"
            )));
        }
        self.attention.validate(what)
    }
}

/// Full description of a hierarchical model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub encoder_type: EncoderType,
    pub decoder_type: RnnType,
    pub main: TaskConfig,
    pub sub: TaskConfig,
    /// Main decoder attention over the sub decoder outputs.
    pub cross_attention: AttentionConfig,
    pub decoding_order: DecodingOrder,
    pub usage_dec_sub: SubContextUsage,
    pub context_fusion: ContextFusion,
    pub backward_sub: bool,
    pub init_dec_state: InitDecoderState,
    /// Extra linear layer over the cross-level context.
    pub relax_context_vec_dec: bool,
    /// Divides logits before the log-softmax.
    pub logits_temperature: f32,
    pub parameter_init: f32,
    pub init_forget_gate_bias_with_one: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            encoder_type: EncoderType::Lstm,
            decoder_type: RnnType::Lstm,
            main: TaskConfig::default(),
            sub: TaskConfig {
                num_classes: 30,
                ..TaskConfig::default()
            },
            cross_attention: AttentionConfig {
                conv_width: 21,
                ..AttentionConfig::default()
            },
            decoding_order: DecodingOrder::AttendGenerateUpdate,
            usage_dec_sub: SubContextUsage::All,
            context_fusion: ContextFusion::Sum,
            backward_sub: false,
            init_dec_state: InitDecoderState::Zero,
            relax_context_vec_dec: false,
            logits_temperature: 1.0,
            parameter_init: 0.1,
            init_forget_gate_bias_with_one: true,
        }
    }
}

impl ModelConfig {
    /// Rejects configurations a model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        self.main.validate("main task")?;
        self.sub.validate("sub task")?;
        self.cross_attention.validate("cross attention")?;
        if self.init_dec_state != InitDecoderState::Zero
            && !self.encoder_type.matches(self.decoder_type)
        {
            return Err(NestdecError::Configuration(format!(
                "encoder type '{}' differs from decoder type '{}'; init_dec_state must be 'zero'",
                self.encoder_type, self.decoder_type
            )));
        }
        if !(self.logits_temperature.is_finite() && self.logits_temperature > 0.0) {
            return Err(NestdecError::Configuration(
                "logits temperature must be positive and finite".into(),
            ));
        }
        if !(self.parameter_init.is_finite() && self.parameter_init >= 0.0) {
            return Err(NestdecError::Configuration(
                "parameter init range must be non-negative".into(),
            ));
        }
        Ok(())
    }

    pub fn sub_direction(&self) -> Direction {
        if self.backward_sub {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }
}

/// Search hyperparameters for one task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub beam_width: usize,
    pub max_decode_len: usize,
    /// Minimum hypothesis length (start token included) before EOS is accepted.
    ///
    /// Only guaranteed for `beam_width >= 2`. At width 1 a refused EOS leaves
    /// no survivor, so the search stops and returns the open hypothesis, which
    /// may have emitted nothing.
    pub min_decode_len: usize,
    pub length_penalty: f32,
    pub coverage_penalty: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            beam_width: 1,
            max_decode_len: MAX_DECODE_LEN_WORD,
            min_decode_len: 0,
            length_penalty: 0.0,
            coverage_penalty: 0.0,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self, what: &str) -> Result<()> {
        if self.beam_width == 0 {
            return Err(NestdecError::Configuration(format!(
                "{what}: beam width must be at least 1"
            )));
        }
        if self.min_decode_len > self.max_decode_len {
            return Err(NestdecError::Configuration(format!(
                "{what}: min_decode_len {} exceeds max_decode_len {}",
                self.min_decode_len, self.max_decode_len
            )));
        }
        if !self.length_penalty.is_finite() || !self.coverage_penalty.is_finite() {
            return Err(NestdecError::Configuration(format!(
                "{what}: penalties must be finite"
            )));
        }
        Ok(())
    }

    pub fn is_greedy(&self) -> bool {
        self.beam_width <= 1
    }
}

pub const MAX_DECODE_LEN_WORD: usize = 200;
pub const MAX_DECODE_LEN_CHAR: usize = 600;

/// Search hyperparameters for both tasks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub main: SearchConfig,
    pub sub: SearchConfig,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            main: SearchConfig::default(),
            sub: SearchConfig {
                max_decode_len: MAX_DECODE_LEN_CHAR,
                ..SearchConfig::default()
            },
        }
    }
}

impl DecodeConfig {
    /// Both tasks share the length and coverage penalties.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        beam_width: usize,
        max_decode_len: usize,
        min_decode_len: usize,
        beam_width_sub: usize,
        max_decode_len_sub: usize,
        min_decode_len_sub: usize,
        length_penalty: f32,
        coverage_penalty: f32,
    ) -> Self {
        Self {
            main: SearchConfig {
                beam_width,
                max_decode_len,
                min_decode_len,
                length_penalty,
                coverage_penalty,
            },
            sub: SearchConfig {
                beam_width: beam_width_sub,
                max_decode_len: max_decode_len_sub,
                min_decode_len: min_decode_len_sub,
                length_penalty,
                coverage_penalty,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.main.validate("main search")?;
        self.sub.validate("sub search")
    }

    /// Sub search forced to width 1, used when replaying reference labels.
    pub fn teacher_forced(mut self) -> Self {
        self.sub.beam_width = 1;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_names_parse_case_insensitively() {
        assert_eq!(
            "Attend_Update_Generate".parse::<DecodingOrder>().unwrap(),
            DecodingOrder::AttendUpdateGenerate
        );
        assert_eq!(
            "update_decoder".parse::<SubContextUsage>().unwrap(),
            SubContextUsage::UpdateDecoder
        );
        for order in DecodingOrder::ALL {
            assert_eq!(order.as_str().parse::<DecodingOrder>().unwrap(), *order);
        }
    }

    #[test]
    fn unknown_names_are_configuration_errors() {
        let err = "attend_twice".parse::<DecodingOrder>().unwrap_err();
        assert!(matches!(err, NestdecError::Configuration(_)));
        let err = "both".parse::<SubContextUsage>().unwrap_err();
        assert!(matches!(err, NestdecError::Configuration(_)));
    }

    #[test]
    fn serde_rejects_unknown_ordering() {
        let raw = r#"{ "decoding_order": "sideways" }"#;
        assert!(serde_json::from_str::<ModelConfig>(raw).is_err());
    }

    #[test]
    fn serde_fills_defaults() {
        let cfg: ModelConfig = serde_json::from_str(r#"{ "backward_sub": true }"#).unwrap();
        assert_eq!(cfg.sub_direction(), Direction::Backward);
        assert_eq!(cfg.main, TaskConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn mismatched_encoder_requires_zero_init() {
        let mut cfg = ModelConfig {
            encoder_type: EncoderType::Gru,
            decoder_type: RnnType::Lstm,
            init_dec_state: InitDecoderState::Final,
            ..ModelConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(NestdecError::Configuration(_))
        ));
        cfg.init_dec_state = InitDecoderState::Zero;
        cfg.validate().unwrap();
    }

    #[test]
    fn search_config_bounds() {
        let mut cfg = SearchConfig::default();
        cfg.validate("t").unwrap();
        cfg.beam_width = 0;
        assert!(cfg.validate("t").is_err());
        cfg.beam_width = 2;
        cfg.min_decode_len = cfg.max_decode_len + 1;
        assert!(cfg.validate("t").is_err());
    }

    #[test]
    fn decode_defaults_follow_word_and_char_caps() {
        let cfg = DecodeConfig::default();
        assert_eq!(cfg.main.max_decode_len, 200);
        assert_eq!(cfg.sub.max_decode_len, 600);
        assert_eq!(cfg.teacher_forced().sub.beam_width, 1);
    }

    #[test]
    fn backward_reading_order_reverses() {
        let mut items = vec![1, 2, 3];
        Direction::Forward.to_reading_order(&mut items);
        assert_eq!(items, vec![1, 2, 3]);
        Direction::Backward.to_reading_order(&mut items);
        assert_eq!(items, vec![3, 2, 1]);
    }
}
