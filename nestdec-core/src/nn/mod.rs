//! Dense building blocks for the step decoders.
//!
//! Everything here is plain `ndarray` math on single vectors: decoding runs
//! one hypothesis at a time, so there is no batch axis anywhere below the
//! engine.

pub mod attention;
pub mod math;
pub mod rnn;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{check_dim, NestdecError, Result};

pub use attention::{AttentionMechanism, AttentionStep, PreparedSource};
pub use rnn::{DecoderState, LayerState, RnnStack};

/// Uniform parameter initializer backed by a seeded RNG.
pub struct ParamInit {
    rng: StdRng,
    range: f32,
}

impl ParamInit {
    pub fn new(seed: u64, range: f32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            range,
        }
    }

    fn sample(&mut self) -> f32 {
        if self.range == 0.0 {
            0.0
        } else {
            self.rng.gen_range(-self.range..=self.range)
        }
    }

    pub fn matrix(&mut self, rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_simple_fn((rows, cols), || self.sample())
    }

    pub fn vector(&mut self, len: usize) -> Array1<f32> {
        Array1::from_shape_simple_fn(len, || self.sample())
    }
}

/// `y = W x + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        check_dim("linear bias", weight.nrows(), bias.len())?;
        Ok(Self { weight, bias })
    }

    /// Random weights, zero bias.
    pub fn init(init: &mut ParamInit, input: usize, output: usize) -> Self {
        Self {
            weight: init.matrix(output, input),
            bias: Array1::zeros(output),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: ArrayView1<'_, f32>) -> Result<Array1<f32>> {
        check_dim("linear input", self.input_dim(), x.len())?;
        Ok(self.weight.dot(&x) + &self.bias)
    }

    /// Row-wise forward over a `(rows, input)` matrix.
    pub fn forward_rows(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        check_dim("linear input", self.input_dim(), x.ncols())?;
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }
}

/// Token embedding table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    table: Array2<f32>,
}

impl Embedding {
    pub fn new(table: Array2<f32>) -> Self {
        Self { table }
    }

    pub fn init(init: &mut ParamInit, vocab: usize, dim: usize) -> Self {
        Self {
            table: init.matrix(vocab, dim),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    pub fn lookup(&self, token: usize) -> Result<ArrayView1<'_, f32>> {
        if token >= self.vocab_size() {
            return Err(NestdecError::InvalidInput(format!(
                "token {token} outside vocabulary of {}",
                self.vocab_size()
            )));
        }
        Ok(self.table.row(token))
    }
}

/// Concatenates vectors end to end.
pub fn concat(parts: &[ArrayView1<'_, f32>]) -> Result<Array1<f32>> {
    Ok(ndarray::concatenate(ndarray::Axis(0), parts)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn linear_forward_applies_weight_and_bias() {
        let layer = Linear::new(array![[1.0, 2.0], [0.0, -1.0]], array![0.5, 0.0]).unwrap();
        let y = layer.forward(array![1.0, 1.0].view()).unwrap();
        assert_eq!(y, array![3.5f32, -1.0]);
    }

    #[test]
    fn linear_rejects_wrong_input_width() {
        let layer = Linear::new(array![[1.0, 2.0]], array![0.0]).unwrap();
        let err = layer.forward(array![1.0, 2.0, 3.0].view()).unwrap_err();
        assert!(matches!(
            err,
            NestdecError::DimensionMismatch {
                expected: 2,
                got: 3,
                ..
            }
        ));
    }

    #[test]
    fn seeded_init_is_reproducible_and_bounded() {
        let a = ParamInit::new(7, 0.1).matrix(3, 4);
        let b = ParamInit::new(7, 0.1).matrix(3, 4);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.abs() <= 0.1));
    }

    #[test]
    fn embedding_rejects_out_of_vocab() {
        let emb = Embedding::new(Array2::zeros((3, 2)));
        assert!(emb.lookup(2).is_ok());
        assert!(matches!(emb.lookup(3), Err(NestdecError::InvalidInput(_))));
    }

    #[test]
    fn concat_joins_in_order() {
        let a = array![1.0f32, 2.0];
        let b = array![3.0f32];
        assert_eq!(concat(&[a.view(), b.view()]).unwrap(), array![1.0f32, 2.0, 3.0]);
    }
}
