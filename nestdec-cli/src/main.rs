//! `nestdec`: decodes a batch of encoder outputs with a seeded hierarchical
//! model and writes a JSON report.
//!
//! ```text
//! nestdec --input batch.json [--settings settings.json] [--output report.json]
//!         [--workers <n>] [--seed <s>] [--log-file nestdec.log]
//!         [--write-default-settings <file>]
//! ```

mod settings;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use nestdec_core::{
    decode_batch, decode_batch_parallel, BatchDecoder, DecodeDiagnostics, DecodeReport,
    EncodedSequence, ErrorAccumulator, ErrorRates, HierarchicalModel, Utterance, UtteranceDecode,
};
use serde::Deserialize;
use settings::{load_settings, save_settings, DecodeSettings};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Args {
    settings: Option<PathBuf>,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    log_file: Option<PathBuf>,
    workers: Option<usize>,
    seed: Option<u64>,
    write_default_settings: Option<PathBuf>,
}

/// One encoder output, rows are frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputSequence {
    frames: Vec<Vec<f32>>,
    /// Valid frames; all of them when absent.
    len: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputUtterance {
    main: InputSequence,
    /// The main-task frames are reused when absent.
    sub: Option<InputSequence>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reference {
    main: Vec<usize>,
    sub: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputBatch {
    utterances: Vec<InputUtterance>,
    #[serde(default)]
    references: Option<Vec<Reference>>,
    /// Character labels replayed instead of searching the sub task.
    #[serde(default)]
    sub_labels: Option<Vec<Vec<usize>>>,
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(2);
        }
    };
    if let Err(e) = init_tracing(args.log_file.as_deref()) {
        eprintln!("failed to initialize logging: {e:#}");
        std::process::exit(1);
    }
    if let Err(e) = run(args) {
        tracing::error!("decode failed: {e:#}");
        eprintln!("nestdec failed: {e:#}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        if arg == "--help" || arg == "-h" {
            println!(
                "Usage: nestdec --input <batch.json> [--settings <settings.json>] \\
  [--output <report.json>] [--workers <n>] [--seed <s>] [--log-file <file>] \\
  [--write-default-settings <file>]"
            );
            std::process::exit(0);
        }
        let Some(value) = it.next() else {
            bail!("missing value for {arg}");
        };
        match arg.as_str() {
            "--settings" => args.settings = Some(PathBuf::from(value)),
            "--input" => args.input = Some(PathBuf::from(value)),
            "--output" => args.output = Some(PathBuf::from(value)),
            "--log-file" => args.log_file = Some(PathBuf::from(value)),
            "--write-default-settings" => args.write_default_settings = Some(PathBuf::from(value)),
            "--workers" => {
                args.workers = Some(value.parse().context("invalid value for --workers")?);
            }
            "--seed" => {
                args.seed = Some(value.parse().context("invalid value for --seed")?);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nestdec=info,nestdec_core=info"))
    };
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    if let Some(path) = &args.write_default_settings {
        save_settings(path, &DecodeSettings::default())
            .with_context(|| format!("writing default settings to {}", path.display()))?;
        info!(path = %path.display(), "wrote default settings");
        if args.input.is_none() {
            return Ok(());
        }
    }

    let settings = resolve_settings(&args)?;

    let input_path = args.input.as_deref().context("--input is required")?;
    let raw = fs::read_to_string(input_path)
        .with_context(|| format!("reading input batch {}", input_path.display()))?;
    let batch: InputBatch = serde_json::from_str(&raw)
        .with_context(|| format!("parsing input batch {}", input_path.display()))?;
    let utterances = batch
        .utterances
        .iter()
        .enumerate()
        .map(|(index, utt)| {
            to_utterance(utt).with_context(|| format!("utterance {index} is malformed"))
        })
        .collect::<Result<Vec<_>>>()?;

    let model = HierarchicalModel::new(settings.model.clone(), settings.seed)
        .context("building hierarchical model")?;
    let config = settings.to_decode_config();
    let diagnostics = DecodeDiagnostics::default();
    info!(
        utterances = utterances.len(),
        beam_width = config.main.beam_width,
        beam_width_sub = config.sub.beam_width,
        workers = settings.workers,
        seed = settings.seed,
        "decoding"
    );

    let started = Instant::now();
    let decoded = match &batch.sub_labels {
        Some(labels) => {
            if settings.workers > 1 {
                warn!("teacher-forced decoding runs on one thread");
            }
            BatchDecoder::new(&model, &utterances, config, &diagnostics)?
                .with_sub_labels(labels)?
                .run()
        }
        None if settings.workers > 1 => {
            decode_batch_parallel(&model, &utterances, &config, settings.workers, &diagnostics)
        }
        None => decode_batch(&model, &utterances, &config, &diagnostics),
    }
    .context("decoding batch")?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch decoded"
    );

    let error_rates = match &batch.references {
        Some(references) => Some(score(&decoded, references, &settings)?),
        None => None,
    };
    if let Some(rates) = &error_rates {
        info!(
            wer = rates.wer.corpus_rate,
            cer = rates.cer.corpus_rate,
            "error rates"
        );
    }

    let report = DecodeReport {
        utterances: decoded,
        diagnostics: diagnostics.snapshot(),
        error_rates,
    };
    let json = serde_json::to_string_pretty(&report).context("serializing report")?;
    match &args.output {
        Some(out) => {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating output directory {}", parent.display()))?;
            }
            fs::write(out, json).with_context(|| format!("writing report {}", out.display()))?;
            info!(path = %out.display(), "wrote decode report");
        }
        None => println!("{json}"),
    }
    Ok(())
}

/// Defaults only when no settings file was named, then command-line
/// overrides.
fn resolve_settings(args: &Args) -> Result<DecodeSettings> {
    let mut settings = match &args.settings {
        Some(path) => load_settings(path)?,
        None => DecodeSettings::default(),
    };
    if let Some(workers) = args.workers {
        settings.workers = workers;
    }
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }
    settings.normalize();
    Ok(settings)
}

fn to_sequence(input: &InputSequence) -> Result<EncodedSequence> {
    let rows = input.frames.len();
    let cols = input.frames.first().map_or(0, Vec::len);
    if let Some(bad) = input.frames.iter().position(|row| row.len() != cols) {
        bail!("frame {bad} has {} values, expected {cols}", input.frames[bad].len());
    }
    let flat: Vec<f32> = input.frames.iter().flatten().copied().collect();
    let frames = Array2::from_shape_vec((rows, cols), flat)?;
    let len = input.len.unwrap_or(rows);
    Ok(EncodedSequence::new(frames, len)?)
}

fn to_utterance(input: &InputUtterance) -> Result<Utterance> {
    let main = to_sequence(&input.main).context("main frames")?;
    Ok(match &input.sub {
        Some(sub) => Utterance::new(main, to_sequence(sub).context("sub frames")?),
        None => Utterance::shared(main),
    })
}

fn score(
    decoded: &[UtteranceDecode],
    references: &[Reference],
    settings: &DecodeSettings,
) -> Result<ErrorRates> {
    if references.len() != decoded.len() {
        bail!(
            "{} references for {} utterances",
            references.len(),
            decoded.len()
        );
    }
    let keep = |ignore: &[usize], tokens: &[usize]| -> Vec<usize> {
        tokens
            .iter()
            .copied()
            .filter(|t| ignore.binary_search(t).is_err())
            .collect()
    };
    let mut wer = ErrorAccumulator::default();
    let mut cer = ErrorAccumulator::default();
    for (reference, decode) in references.iter().zip(decoded) {
        wer.push(
            &keep(&settings.ignore_tokens, &reference.main),
            &keep(&settings.ignore_tokens, &decode.main.tokens),
        );
        cer.push(
            &keep(&settings.ignore_tokens_sub, &reference.sub),
            &keep(&settings.ignore_tokens_sub, &decode.sub.tokens),
        );
    }
    Ok(ErrorRates {
        wer: wer.summary(),
        cer: cer.summary(),
    })
}
