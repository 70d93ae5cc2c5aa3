fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use nestdec_core::{
        decode_batch, decode_batch_parallel, DecodeConfig, DecodeDiagnostics, DecodingOrder,
        EncodedSequence, ErrorAccumulator, HierarchicalModel, ModelConfig, Utterance,
        UtteranceDecode,
    };
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde::Serialize;
    use std::path::PathBuf;
    use std::time::Instant;

    #[derive(Debug)]
    struct Args {
        utterances: usize,
        frames: usize,
        beam_widths: Vec<usize>,
        iterations: usize,
        workers: usize,
        seed: u64,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct CaseSummary {
        order: String,
        beam_width: usize,
        runs: usize,
        p50_latency_ms: f64,
        p95_latency_ms: f64,
        avg_latency_ms: f64,
        avg_search_steps: f64,
        fallback_rate: f64,
        /// Token error rate of this width against greedy output.
        word_divergence: f64,
        char_divergence: f64,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Summary {
        utterances: usize,
        frames: usize,
        iterations: usize,
        workers: usize,
        seed: u64,
        cases: Vec<CaseSummary>,
    }

    fn parse_args() -> Result<Args, String> {
        let mut args = Args {
            utterances: 8,
            frames: 40,
            beam_widths: vec![1, 4],
            iterations: 3,
            workers: 1,
            seed: 0,
            output: None,
        };

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            let mut value = |name: &str| {
                it.next()
                    .ok_or_else(|| format!("missing value for {name}"))
            };
            match arg.as_str() {
                "--utterances" => {
                    args.utterances = value("--utterances")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --utterances".to_string())?
                        .clamp(1, 1024);
                }
                "--frames" => {
                    args.frames = value("--frames")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --frames".to_string())?
                        .clamp(1, 4096);
                }
                "--beam" => {
                    args.beam_widths = value("--beam")?
                        .split(',')
                        .map(|w| w.trim().parse::<usize>().map(|w| w.max(1)))
                        .collect::<Result<_, _>>()
                        .map_err(|_| "invalid value for --beam".to_string())?;
                }
                "--iterations" => {
                    args.iterations = value("--iterations")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --iterations".to_string())?
                        .clamp(1, 100);
                }
                "--workers" => {
                    args.workers = value("--workers")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --workers".to_string())?
                        .clamp(1, 64);
                }
                "--seed" => {
                    args.seed = value("--seed")?
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --seed".to_string())?;
                }
                "--output" => {
                    args.output = Some(PathBuf::from(value("--output")?));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p nestdec-core --release --bin benchmark -- \\
  [--utterances <n>] [--frames <t>] [--beam <w,w,...>] [--iterations <n>] \\
  [--workers <n>] [--seed <s>] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => {
                    return Err(format!("unknown argument: {other}"));
                }
            }
        }
        Ok(args)
    }

    fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        if sorted.len() == 1 {
            return sorted[0];
        }
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn divergence(
        reference: &[UtteranceDecode],
        decoded: &[UtteranceDecode],
    ) -> (f64, f64) {
        let mut words = ErrorAccumulator::default();
        let mut chars = ErrorAccumulator::default();
        for (r, d) in reference.iter().zip(decoded) {
            words.push(&r.main.tokens, &d.main.tokens);
            chars.push(&r.sub.tokens, &d.sub.tokens);
        }
        (words.summary().corpus_rate, chars.summary().corpus_rate)
    }

    // Untrained weights rarely pick EOS, so keep the step caps short.
    fn limits(width: usize) -> DecodeConfig {
        DecodeConfig::new(width, 40, 0, width, 120, 0, 0.0, 0.0)
    }

    let args = parse_args()?;
    let config = ModelConfig::default();

    let mut rng = StdRng::seed_from_u64(args.seed ^ 0x5eed);
    let utterances: Vec<Utterance> = (0..args.utterances)
        .map(|_| {
            let len = rng.gen_range((args.frames / 2).max(1)..=args.frames);
            let frames = Array2::from_shape_simple_fn((args.frames, config.main.encoder_dim), || {
                rng.gen_range(-1.0f32..=1.0)
            });
            EncodedSequence::new(frames, len).map(Utterance::shared)
        })
        .collect::<Result<_, _>>()
        .map_err(|e| e.to_string())?;

    println!(
        "Running nestdec benchmark on {} utterances x {} frames (iterations={}, workers={})",
        args.utterances, args.frames, args.iterations, args.workers
    );

    let mut cases = Vec::new();
    for order in DecodingOrder::ALL {
        let model = HierarchicalModel::new(
            ModelConfig {
                decoding_order: *order,
                ..config.clone()
            },
            args.seed,
        )
        .map_err(|e| e.to_string())?;

        let greedy = decode_batch(
            &model,
            &utterances,
            &limits(1),
            &DecodeDiagnostics::default(),
        )
        .map_err(|e| e.to_string())?;

        for &width in &args.beam_widths {
            let decode = limits(width);
            let diagnostics = DecodeDiagnostics::default();
            let mut last = Vec::new();
            for iteration in 1..=args.iterations {
                let started = Instant::now();
                last = if args.workers > 1 {
                    decode_batch_parallel(&model, &utterances, &decode, args.workers, &diagnostics)
                } else {
                    decode_batch(&model, &utterances, &decode, &diagnostics)
                }
                .map_err(|e| e.to_string())?;
                let batch_ms = started.elapsed().as_secs_f64() * 1000.0;
                println!(
                    "{order} beam={width} [{iteration}/{iters}] {batch_ms:.1} ms",
                    iters = args.iterations
                );
            }

            let latencies = diagnostics.latencies_ms();
            let snap = diagnostics.snapshot();
            let (word_divergence, char_divergence) = divergence(&greedy, &last);
            cases.push(CaseSummary {
                order: order.to_string(),
                beam_width: width,
                runs: latencies.len(),
                p50_latency_ms: percentile(&latencies, 0.50),
                p95_latency_ms: percentile(&latencies, 0.95),
                avg_latency_ms: snap.mean_latency_ms,
                avg_search_steps: if snap.searches == 0 {
                    0.0
                } else {
                    snap.search_steps as f64 / snap.searches as f64
                },
                fallback_rate: if snap.searches == 0 {
                    0.0
                } else {
                    snap.open_beam_fallbacks as f64 / snap.searches as f64
                },
                word_divergence,
                char_divergence,
            });
        }
    }

    let summary = Summary {
        utterances: args.utterances,
        frames: args.frames,
        iterations: args.iterations,
        workers: args.workers,
        seed: args.seed,
        cases,
    };
    for case in &summary.cases {
        println!(
            "Done. {} beam={} p50={:.1}ms p95={:.1}ms fallback_rate={:.1}%",
            case.order,
            case.beam_width,
            case.p50_latency_ms,
            case.p95_latency_ms,
            case.fallback_rate * 100.0
        );
    }

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
