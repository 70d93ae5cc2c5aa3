//! Attention over a source sequence.
//!
//! ```text
//!   source (T × D) ──key proj──► keys (len × A)      once per sequence
//!                                    │
//!   query (Q) ──query proj──► q (A)  │   prev alignment (T × heads)
//!                               │    │        │ (location only: conv)
//!                               ▼    ▼        ▼
//!                           energies e (T), masked beyond len
//!                                    │
//!                       softmax(e · sharpening) | sigmoid smoothing
//!                                    │
//!                 alignment (T × heads) ─► context = Σ a_t · source_t
//! ```
//!
//! The same mechanism serves the acoustic attention of both decoders and the
//! main decoder's cross-level attention over the sub decoder outputs; only
//! the source differs.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::math::{masked_sigmoid_smoothing, masked_softmax};
use super::{concat, Linear, ParamInit};
use crate::config::{AttentionConfig, AttentionKind, HeadCombine};
use crate::error::{check_dim, NestdecError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LocationConv {
    /// `(channels, width)`, centered on the current position.
    filters: Array2<f32>,
    proj: Linear,
}

impl LocationConv {
    /// Convolves one head's previous alignment over the valid positions.
    fn features(&self, prev: ArrayView1<'_, f32>, len: usize) -> Array2<f32> {
        let (channels, width) = self.filters.dim();
        let pad = width / 2;
        let mut out = Array2::zeros((len, channels));
        for t in 0..len {
            for k in 0..width {
                let Some(src) = (t + k).checked_sub(pad) else {
                    continue;
                };
                if src >= len {
                    break;
                }
                let a = prev[src];
                if a == 0.0 {
                    continue;
                }
                for c in 0..channels {
                    out[[t, c]] += self.filters[[c, k]] * a;
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AttentionHead {
    key: Linear,
    query: Linear,
    v: Array1<f32>,
    conv: Option<LocationConv>,
}

/// Keys of one source sequence, computed once and reused at every step.
#[derive(Debug, Clone)]
pub struct PreparedSource<'a> {
    values: ArrayView2<'a, f32>,
    len: usize,
    keys: Vec<Array2<f32>>,
}

impl<'a> PreparedSource<'a> {
    /// Valid positions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Padded length; alignments are this long.
    pub fn max_time(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> ArrayView2<'a, f32> {
        self.values
    }
}

/// Result of scoring one query.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionStep {
    pub context: Array1<f32>,
    /// `(max_time, heads)`; zero beyond the valid length.
    pub alignment: Array2<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionMechanism {
    kind: AttentionKind,
    heads: Vec<AttentionHead>,
    combine: HeadCombine,
    sharpening_factor: f32,
    sigmoid_smoothing: bool,
    source_dim: usize,
    query_dim: usize,
    dim: usize,
}

impl AttentionMechanism {
    pub fn init(
        init: &mut ParamInit,
        config: &AttentionConfig,
        source_dim: usize,
        query_dim: usize,
    ) -> Self {
        let heads = (0..config.heads)
            .map(|_| AttentionHead {
                key: Linear::init(init, source_dim, config.dim),
                query: Linear::init(init, query_dim, config.dim),
                v: init.vector(config.dim),
                conv: (config.kind == AttentionKind::Location).then(|| LocationConv {
                    filters: init.matrix(config.conv_channels, config.conv_width),
                    proj: Linear::init(init, config.conv_channels, config.dim),
                }),
            })
            .collect();
        Self {
            kind: config.kind,
            heads,
            combine: config.combine,
            sharpening_factor: config.sharpening_factor,
            sigmoid_smoothing: config.sigmoid_smoothing,
            source_dim,
            query_dim,
            dim: config.dim,
        }
    }

    pub fn kind(&self) -> AttentionKind {
        self.kind
    }

    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    pub fn query_dim(&self) -> usize {
        self.query_dim
    }

    pub fn context_dim(&self) -> usize {
        match self.combine {
            HeadCombine::Concat => self.source_dim * self.heads.len(),
            HeadCombine::Average => self.source_dim,
        }
    }

    /// Projects the valid part of `values` into keys for every head.
    pub fn prepare<'a>(&self, values: ArrayView2<'a, f32>, len: usize) -> Result<PreparedSource<'a>> {
        check_dim("attention source width", self.source_dim, values.ncols())?;
        if len > values.nrows() {
            return Err(NestdecError::InvalidInput(format!(
                "valid length {len} exceeds sequence of {} frames",
                values.nrows()
            )));
        }
        let valid = values.slice(s![..len, ..]);
        let keys = self
            .heads
            .iter()
            .map(|head| head.key.forward_rows(valid))
            .collect::<Result<Vec<_>>>()?;
        Ok(PreparedSource { values, len, keys })
    }

    /// All-zero alignment, the state before the first step.
    pub fn initial_alignment(&self, source: &PreparedSource<'_>) -> Array2<f32> {
        Array2::zeros((source.max_time(), self.heads.len()))
    }

    pub fn score(
        &self,
        source: &PreparedSource<'_>,
        query: ArrayView1<'_, f32>,
        prev_alignment: ArrayView2<'_, f32>,
    ) -> Result<AttentionStep> {
        check_dim("previous alignment length", source.max_time(), prev_alignment.nrows())?;
        check_dim("previous alignment heads", self.heads.len(), prev_alignment.ncols())?;

        let len = source.len;
        let valid = source.values.slice(s![..len, ..]);
        let mut alignment = Array2::zeros((source.max_time(), self.heads.len()));
        let mut contexts = Vec::with_capacity(self.heads.len());

        for (h, (head, keys)) in self.heads.iter().zip(&source.keys).enumerate() {
            let q = head.query.forward(query)?;
            let mut energies = Array1::zeros(source.max_time());
            match self.kind {
                AttentionKind::Content => {
                    for t in 0..len {
                        let hidden = (&keys.row(t) + &q).mapv(f32::tanh);
                        energies[t] = head.v.dot(&hidden);
                    }
                }
                AttentionKind::Location => {
                    let conv = head.conv.as_ref().ok_or_else(|| {
                        NestdecError::Configuration("location attention without conv".into())
                    })?;
                    let features = conv.features(prev_alignment.column(h), len);
                    let location = conv.proj.forward_rows(features.view())?;
                    for t in 0..len {
                        let hidden = (&keys.row(t) + &q + &location.row(t)).mapv(f32::tanh);
                        energies[t] = head.v.dot(&hidden);
                    }
                }
                AttentionKind::DotProduct => {
                    let scale = (self.dim as f32).sqrt();
                    for t in 0..len {
                        energies[t] = keys.row(t).dot(&q) / scale;
                    }
                }
            }
            energies.mapv_inplace(|e| e * self.sharpening_factor);

            let weights = if self.sigmoid_smoothing {
                masked_sigmoid_smoothing(energies.view(), len)
            } else {
                masked_softmax(energies.view(), len)
            };
            contexts.push(valid.t().dot(&weights.slice(s![..len])));
            alignment.column_mut(h).assign(&weights);
        }

        let context = match self.combine {
            HeadCombine::Concat => {
                let views: Vec<_> = contexts.iter().map(|c| c.view()).collect();
                concat(&views)?
            }
            HeadCombine::Average => {
                let mut sum = Array1::zeros(self.source_dim);
                for c in &contexts {
                    sum += c;
                }
                sum / self.heads.len() as f32
            }
        };
        Ok(AttentionStep { context, alignment })
    }
}

/// Mean over heads: `(max_time, heads)` to `(max_time,)`.
pub fn head_mean(alignment: ArrayView2<'_, f32>) -> Array1<f32> {
    alignment
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(alignment.nrows()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn config(kind: AttentionKind, heads: usize) -> AttentionConfig {
        AttentionConfig {
            kind,
            dim: 8,
            heads,
            conv_channels: 3,
            conv_width: 5,
            ..AttentionConfig::default()
        }
    }

    fn source(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(t, d)| ((t * cols + d) as f32 * 0.37).sin())
    }

    #[test]
    fn every_kind_masks_padding_and_normalizes() {
        let values = source(6, 4);
        for kind in AttentionKind::ALL {
            let mut init = ParamInit::new(11, 0.3);
            let att = AttentionMechanism::init(&mut init, &config(*kind, 2), 4, 5);
            let prepared = att.prepare(values.view(), 4).unwrap();
            let prev = att.initial_alignment(&prepared);
            let step = att
                .score(&prepared, Array1::from_elem(5, 0.2).view(), prev.view())
                .unwrap();
            assert_eq!(step.alignment.dim(), (6, 2));
            assert_eq!(step.context.len(), 8);
            for h in 0..2 {
                let col = step.alignment.column(h);
                assert_abs_diff_eq!(col.sum(), 1.0, epsilon = 1e-5);
                assert_eq!(col[4], 0.0);
                assert_eq!(col[5], 0.0);
            }
        }
    }

    #[test]
    fn empty_source_gives_zero_context() {
        let values = source(3, 4);
        let mut init = ParamInit::new(1, 0.3);
        let mut cfg = config(AttentionKind::Content, 1);
        cfg.combine = HeadCombine::Average;
        let att = AttentionMechanism::init(&mut init, &cfg, 4, 2);
        let prepared = att.prepare(values.view(), 0).unwrap();
        let step = att
            .score(&prepared, Array1::zeros(2).view(), att.initial_alignment(&prepared).view())
            .unwrap();
        assert!(step.context.iter().all(|&v| v == 0.0));
        assert!(step.alignment.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn sharp_single_position_copies_frame() {
        let values = source(5, 3);
        let mut init = ParamInit::new(5, 0.3);
        let att = AttentionMechanism::init(&mut init, &config(AttentionKind::Content, 1), 3, 2);
        let prepared = att.prepare(values.view(), 1).unwrap();
        let step = att
            .score(&prepared, Array1::ones(2).view(), att.initial_alignment(&prepared).view())
            .unwrap();
        for d in 0..3 {
            assert_abs_diff_eq!(step.context[d], values[[0, d]], epsilon = 1e-6);
        }
    }

    #[test]
    fn location_conv_spreads_previous_mass() {
        let conv = LocationConv {
            filters: Array2::ones((1, 3)),
            proj: Linear::new(Array2::ones((1, 1)), Array1::zeros(1)).unwrap(),
        };
        let prev = ndarray::array![0.0f32, 1.0, 0.0, 0.0];
        let f = conv.features(prev.view(), 3);
        assert_eq!(f.column(0).to_vec(), vec![1.0, 1.0, 1.0]);
        let f = conv.features(prev.view(), 1);
        assert_eq!(f.column(0).to_vec(), vec![0.0]);
    }

    #[test]
    fn rejects_bad_lengths_and_widths() {
        let values = source(3, 4);
        let mut init = ParamInit::new(1, 0.3);
        let att = AttentionMechanism::init(&mut init, &config(AttentionKind::Content, 1), 4, 2);
        assert!(matches!(
            att.prepare(values.view(), 4),
            Err(NestdecError::InvalidInput(_))
        ));
        let wide = source(3, 5);
        assert!(att.prepare(wide.view(), 3).is_err());
    }

    #[test]
    fn head_mean_averages_columns() {
        let a = ndarray::array![[1.0f32, 0.0], [0.0, 1.0], [0.0, 0.0]];
        assert_eq!(head_mean(a.view()), ndarray::array![0.5f32, 0.5, 0.0]);
    }
}
