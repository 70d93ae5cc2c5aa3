//! Decode settings (JSON file next to the input batch).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nestdec_core::config::{MAX_DECODE_LEN_CHAR, MAX_DECODE_LEN_WORD};
use nestdec_core::{DecodeConfig, ModelConfig};
use serde::{Deserialize, Serialize};

const MAX_BEAM_WIDTH: usize = 64;
const MAX_WORKERS: usize = 64;
const MAX_DECODE_LEN_LIMIT: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DecodeSettings {
    pub model: ModelConfig,
    pub seed: u64,
    pub beam_width: usize,
    pub max_decode_len: usize,
    pub min_decode_len: usize,
    pub beam_width_sub: usize,
    pub max_decode_len_sub: usize,
    pub min_decode_len_sub: usize,
    pub length_penalty: f32,
    pub coverage_penalty: f32,
    pub workers: usize,
    /// Word ids left out of both sides before WER scoring.
    pub ignore_tokens: Vec<usize>,
    /// Character ids left out of both sides before CER scoring.
    pub ignore_tokens_sub: Vec<usize>,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            seed: 0,
            beam_width: 1,
            max_decode_len: MAX_DECODE_LEN_WORD,
            min_decode_len: 0,
            beam_width_sub: 1,
            max_decode_len_sub: MAX_DECODE_LEN_CHAR,
            min_decode_len_sub: 0,
            length_penalty: 0.0,
            coverage_penalty: 0.0,
            workers: 1,
            ignore_tokens: Vec::new(),
            ignore_tokens_sub: Vec::new(),
        }
    }
}

impl DecodeSettings {
    pub fn normalize(&mut self) {
        self.beam_width = self.beam_width.clamp(1, MAX_BEAM_WIDTH);
        self.beam_width_sub = self.beam_width_sub.clamp(1, MAX_BEAM_WIDTH);
        self.max_decode_len = self.max_decode_len.clamp(1, MAX_DECODE_LEN_LIMIT);
        self.max_decode_len_sub = self.max_decode_len_sub.clamp(1, MAX_DECODE_LEN_LIMIT);
        self.min_decode_len = self.min_decode_len.min(self.max_decode_len);
        self.min_decode_len_sub = self.min_decode_len_sub.min(self.max_decode_len_sub);
        self.length_penalty = finite_or_zero(self.length_penalty);
        self.coverage_penalty = finite_or_zero(self.coverage_penalty);
        self.workers = self.workers.clamp(1, MAX_WORKERS);
        self.ignore_tokens.sort_unstable();
        self.ignore_tokens.dedup();
        self.ignore_tokens_sub.sort_unstable();
        self.ignore_tokens_sub.dedup();
    }

    pub fn to_decode_config(&self) -> DecodeConfig {
        DecodeConfig::new(
            self.beam_width,
            self.max_decode_len,
            self.min_decode_len,
            self.beam_width_sub,
            self.max_decode_len_sub,
            self.min_decode_len_sub,
            self.length_penalty,
            self.coverage_penalty,
        )
    }
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Reads an explicitly requested settings file. Missing, unreadable or
/// malformed files are errors; only an absent `--settings` uses defaults.
pub fn load_settings(path: &Path) -> Result<DecodeSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading settings {}", path.display()))?;
    let mut settings: DecodeSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parsing settings {}", path.display()))?;
    settings.normalize();
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &DecodeSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestdec_core::DecodingOrder;

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut s = DecodeSettings {
            beam_width: 0,
            beam_width_sub: 500,
            max_decode_len: 5,
            min_decode_len: 9,
            length_penalty: f32::NAN,
            workers: 0,
            ignore_tokens: vec![4, 2, 4],
            ..DecodeSettings::default()
        };
        s.normalize();
        assert_eq!(s.beam_width, 1);
        assert_eq!(s.beam_width_sub, MAX_BEAM_WIDTH);
        assert_eq!(s.min_decode_len, 5);
        assert_eq!(s.length_penalty, 0.0);
        assert_eq!(s.workers, 1);
        assert_eq!(s.ignore_tokens, vec![2, 4]);
        assert!(s.to_decode_config().validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let raw = r#"{ "beamWidth": 4, "model": { "decoding_order": "conditional" } }"#;
        let s: DecodeSettings = serde_json::from_str(raw).unwrap();
        assert_eq!(s.beam_width, 4);
        assert_eq!(s.max_decode_len_sub, MAX_DECODE_LEN_CHAR);
        assert_eq!(s.model.decoding_order, DecodingOrder::Conditional);
        let cfg = s.to_decode_config();
        assert_eq!(cfg.main.beam_width, 4);
        assert_eq!(cfg.sub.beam_width, 1);
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("nestdec-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = DecodeSettings {
            seed: 42,
            beam_width_sub: 3,
            ..DecodeSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("nestdec-settings-does-not-exist.json");
        let err = load_settings(&path).unwrap_err();
        assert!(format!("{err:#}").contains("reading settings"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("nestdec-bad-settings-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        fs::write(&path, r#"{ "beamWidth": "wide" }"#).unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parsing settings"));
        let _ = fs::remove_dir_all(&dir);
    }
}
