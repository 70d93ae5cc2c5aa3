//! Recurrent cells and the stacked decoder state.
//!
//! Gate layout follows the usual `[input, forget, cell, output]` order for
//! LSTM and `[reset, update, new]` for GRU, so weights trained elsewhere can
//! be dropped in row for row.

use ndarray::{s, Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use super::math::sigmoid;
use super::ParamInit;
use crate::config::RnnType;
use crate::error::{check_dim, NestdecError, Result};

/// Hidden (and, for LSTM, cell) vector of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerState {
    pub h: Array1<f32>,
    pub c: Option<Array1<f32>>,
}

/// Recurrent state of a stacked decoder. Owned by exactly one hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderState {
    layers: Vec<LayerState>,
}

impl DecoderState {
    pub fn zeros(kind: RnnType, layers: usize, units: usize) -> Self {
        let layer = LayerState {
            h: Array1::zeros(units),
            c: (kind == RnnType::Lstm).then(|| Array1::zeros(units)),
        };
        Self {
            layers: vec![layer; layers],
        }
    }

    /// Every layer starts from `h`; cell vectors start at zero.
    pub fn broadcast_hidden(kind: RnnType, layers: usize, h: Array1<f32>) -> Self {
        let units = h.len();
        let layer = LayerState {
            c: (kind == RnnType::Lstm).then(|| Array1::zeros(units)),
            h,
        };
        Self {
            layers: vec![layer; layers],
        }
    }

    /// Deep copy for a child hypothesis. Siblings never share state.
    pub fn branch(&self) -> Self {
        self.clone()
    }

    pub fn layers(&self) -> &[LayerState] {
        &self.layers
    }

    /// Top layer hidden vector.
    pub fn output(&self) -> Option<ArrayView1<'_, f32>> {
        self.layers.last().map(|l| l.h.view())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GateWeights {
    w_ih: Array2<f32>,
    w_hh: Array2<f32>,
    b_ih: Array1<f32>,
    b_hh: Array1<f32>,
}

impl GateWeights {
    fn init(init: &mut ParamInit, gates: usize, input: usize, units: usize) -> Self {
        Self {
            w_ih: init.matrix(gates * units, input),
            w_hh: init.matrix(gates * units, units),
            b_ih: Array1::zeros(gates * units),
            b_hh: Array1::zeros(gates * units),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmCell {
    weights: GateWeights,
    units: usize,
}

impl LstmCell {
    pub fn init(init: &mut ParamInit, input: usize, units: usize, forget_bias_one: bool) -> Self {
        let mut weights = GateWeights::init(init, 4, input, units);
        if forget_bias_one {
            weights.b_ih.slice_mut(s![units..2 * units]).fill(1.0);
        }
        Self { weights, units }
    }

    pub fn step(
        &self,
        x: ArrayView1<'_, f32>,
        h: ArrayView1<'_, f32>,
        c: ArrayView1<'_, f32>,
    ) -> (Array1<f32>, Array1<f32>) {
        let w = &self.weights;
        let gates = w.w_ih.dot(&x) + &w.b_ih + w.w_hh.dot(&h) + &w.b_hh;
        let n = self.units;
        let i = gates.slice(s![..n]).mapv(sigmoid);
        let f = gates.slice(s![n..2 * n]).mapv(sigmoid);
        let g = gates.slice(s![2 * n..3 * n]).mapv(f32::tanh);
        let o = gates.slice(s![3 * n..]).mapv(sigmoid);
        let c_next = &f * &c + &i * &g;
        let h_next = &o * &c_next.mapv(f32::tanh);
        (h_next, c_next)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GruCell {
    weights: GateWeights,
    units: usize,
}

impl GruCell {
    pub fn init(init: &mut ParamInit, input: usize, units: usize) -> Self {
        Self {
            weights: GateWeights::init(init, 3, input, units),
            units,
        }
    }

    pub fn step(&self, x: ArrayView1<'_, f32>, h: ArrayView1<'_, f32>) -> Array1<f32> {
        let w = &self.weights;
        let gi = w.w_ih.dot(&x) + &w.b_ih;
        let gh = w.w_hh.dot(&h) + &w.b_hh;
        let n = self.units;
        let r = (&gi.slice(s![..n]) + &gh.slice(s![..n])).mapv(sigmoid);
        let z = (&gi.slice(s![n..2 * n]) + &gh.slice(s![n..2 * n])).mapv(sigmoid);
        let cand = (&gi.slice(s![2 * n..]) + &(&r * &gh.slice(s![2 * n..]))).mapv(f32::tanh);
        &z.mapv(|v| 1.0 - v) * &cand + &z * &h
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RnnCell {
    Lstm(LstmCell),
    Gru(GruCell),
}

/// Stack of recurrent layers advanced one step at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RnnStack {
    kind: RnnType,
    cells: Vec<RnnCell>,
    input_dim: usize,
    units: usize,
}

impl RnnStack {
    pub fn init(
        init: &mut ParamInit,
        kind: RnnType,
        input_dim: usize,
        units: usize,
        layers: usize,
        forget_bias_one: bool,
    ) -> Self {
        let cells = (0..layers)
            .map(|layer| {
                let input = if layer == 0 { input_dim } else { units };
                match kind {
                    RnnType::Lstm => {
                        RnnCell::Lstm(LstmCell::init(init, input, units, forget_bias_one))
                    }
                    RnnType::Gru => RnnCell::Gru(GruCell::init(init, input, units)),
                }
            })
            .collect();
        Self {
            kind,
            cells,
            input_dim,
            units,
        }
    }

    pub fn kind(&self) -> RnnType {
        self.kind
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn layers(&self) -> usize {
        self.cells.len()
    }

    pub fn zero_state(&self) -> DecoderState {
        DecoderState::zeros(self.kind, self.layers(), self.units)
    }

    /// One recurrence step. Pure: `state` is left untouched and the advanced
    /// state is returned alongside the top-layer output.
    pub fn step(
        &self,
        input: ArrayView1<'_, f32>,
        state: &DecoderState,
    ) -> Result<(Array1<f32>, DecoderState)> {
        check_dim("rnn input", self.input_dim, input.len())?;
        check_dim("rnn state layers", self.cells.len(), state.layers.len())?;

        let mut layers = Vec::with_capacity(self.cells.len());
        let mut x = input.to_owned();
        for (cell, prev) in self.cells.iter().zip(&state.layers) {
            check_dim("rnn hidden", self.units, prev.h.len())?;
            let next = match (cell, &prev.c) {
                (RnnCell::Lstm(cell), Some(c)) => {
                    let (h, c) = cell.step(x.view(), prev.h.view(), c.view());
                    LayerState { h, c: Some(c) }
                }
                (RnnCell::Gru(cell), None) => LayerState {
                    h: cell.step(x.view(), prev.h.view()),
                    c: None,
                },
                _ => {
                    return Err(NestdecError::InvalidInput(format!(
                        "decoder state does not match a {} stack",
                        self.kind
                    )))
                }
            };
            x = next.h.clone();
            layers.push(next);
        }
        Ok((x, DecoderState { layers }))
    }
}
