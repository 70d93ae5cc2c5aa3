//! Encoder output handed to the decoders.

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{NestdecError, Result};

/// Per-frame encoder features, possibly padded, with the number of valid
/// frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedSequence {
    /// `(max_time, encoder_dim)`.
    pub frames: Array2<f32>,
    pub len: usize,
}

impl EncodedSequence {
    pub fn new(frames: Array2<f32>, len: usize) -> Result<Self> {
        let seq = Self { frames, len };
        seq.validate()?;
        Ok(seq)
    }

    /// Every frame valid.
    pub fn full(frames: Array2<f32>) -> Self {
        let len = frames.nrows();
        Self { frames, len }
    }

    pub fn validate(&self) -> Result<()> {
        if self.len > self.frames.nrows() {
            return Err(NestdecError::InvalidInput(format!(
                "valid length {} exceeds {} frames",
                self.len,
                self.frames.nrows()
            )));
        }
        Ok(())
    }

    pub fn max_time(&self) -> usize {
        self.frames.nrows()
    }

    pub fn dim(&self) -> usize {
        self.frames.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.frames.view()
    }

    pub fn valid(&self) -> ArrayView2<'_, f32> {
        self.frames.slice(s![..self.len, ..])
    }
}

/// Encoder outputs of one utterance for both tasks. The sub-task encoder
/// may stop at a lower layer or subsample differently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utterance {
    pub main: EncodedSequence,
    pub sub: EncodedSequence,
}

impl Utterance {
    pub fn new(main: EncodedSequence, sub: EncodedSequence) -> Self {
        Self { main, sub }
    }

    /// Both tasks read the same encoder output.
    pub fn shared(encoded: EncodedSequence) -> Self {
        Self {
            sub: encoded.clone(),
            main: encoded,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.main.validate()?;
        self.sub.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_length_beyond_frames() {
        assert!(EncodedSequence::new(Array2::zeros((3, 2)), 4).is_err());
        let seq = EncodedSequence::new(Array2::zeros((3, 2)), 2).unwrap();
        assert_eq!(seq.valid().dim(), (2, 2));
        assert_eq!(seq.max_time(), 3);
    }

    #[test]
    fn serde_round_trip_keeps_padding() {
        let utt = Utterance::shared(EncodedSequence::new(Array2::ones((4, 2)), 3).unwrap());
        let json = serde_json::to_string(&utt).unwrap();
        let back: Utterance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, utt);
        assert_eq!(back.sub.len, 3);
    }
}
