use nestdec_core::search::{beam, greedy};
use nestdec_core::{search, DecodeDiagnostics, ScriptedDecoder, SearchConfig, StepDecoder, TokenSource};

// Shared start/end index 1, a = 2, b = 3; index 0 is never preferred.
const EOS: usize = 1;
const A: usize = 2;

fn config(width: usize, max: usize, min: usize) -> SearchConfig {
    SearchConfig {
        beam_width: width,
        max_decode_len: max,
        min_decode_len: min,
        ..SearchConfig::default()
    }
}

/// Prefers `a` for the first two steps, then EOS.
fn prefers_a_then_eos() -> ScriptedDecoder {
    ScriptedDecoder::new(EOS, 4, 5, |tokens| {
        if tokens.len() < 3 {
            vec![-10.0, -10.0, 4.0, 0.0]
        } else {
            vec![-10.0, 4.0, -3.0, -3.0]
        }
    })
}

#[test]
fn two_a_then_eos_is_trimmed_to_two_tokens() {
    let dec = prefers_a_then_eos();
    let diag = DecodeDiagnostics::default();
    let out = search(&dec, &config(2, 4, 0), TokenSource::Search, &diag).unwrap();

    assert!(out.completed);
    assert_eq!(out.best.tokens, vec![EOS, A, A, EOS]);
    assert_eq!(out.steps, 3);
    // Both survivors of the last step closed.
    assert_eq!(out.finalists().count(), 2);
    assert!(out.finalists().all(|h| h.ends_with(EOS)));

    let emitted: Vec<usize> = out.best.tokens[1..out.best.len() - 1].to_vec();
    assert_eq!(emitted, vec![A, A]);
    // One alignment per emitted token over 5 source positions.
    let rows: Vec<_> = out.best.alignments[1..=emitted.len()].to_vec();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|a| a.dim() == (5, 1)));
}

#[test]
fn early_eos_is_refused_until_min_length() {
    // EOS = 0 always ranks first.
    let dec = ScriptedDecoder::new(0, 3, 4, |_| vec![5.0, 1.0, 0.5]);
    let diag = DecodeDiagnostics::default();
    let out = search(&dec, &config(2, 10, 3), TokenSource::Search, &diag).unwrap();

    assert!(out.completed);
    assert_eq!(out.best.tokens, vec![0, 1, 1, 0]);
    assert_eq!(diag.snapshot().eos_rejected, 2);
    assert!(out.finalists().all(|h| h.len() >= 4));
}

#[test]
fn refused_eos_at_width_one_falls_back() {
    let dec = ScriptedDecoder::new(0, 3, 4, |_| vec![5.0, 1.0, 0.5]);
    let diag = DecodeDiagnostics::default();
    let out = search(&dec, &config(1, 10, 3), TokenSource::Search, &diag).unwrap();

    assert!(!out.completed);
    assert_eq!(out.best.tokens, vec![0]);
    assert_eq!(diag.snapshot().open_beam_fallbacks, 1);
}

#[test]
fn min_length_holds_only_from_width_two() {
    let dec = ScriptedDecoder::new(0, 3, 4, |_| vec![5.0, 1.0, 0.5]);

    let narrow = search(
        &dec,
        &config(1, 10, 3),
        TokenSource::Search,
        &DecodeDiagnostics::default(),
    )
    .unwrap();
    assert!(!narrow.completed);
    assert!(narrow.best.len() < 3);

    let wide = search(
        &dec,
        &config(2, 10, 3),
        TokenSource::Search,
        &DecodeDiagnostics::default(),
    )
    .unwrap();
    assert!(wide.completed);
    assert!(wide.best.len() >= 3);
    assert!(wide.best.ends_with(0));
}

/// EOS or `a` from the root (EOS one nat ahead), then EOS almost surely.
fn short_or_long() -> ScriptedDecoder {
    ScriptedDecoder::new(EOS, 4, 5, |tokens| {
        if tokens.len() < 2 {
            vec![-10.0, 1.0, 0.0, -10.0]
        } else {
            vec![-10.0, 5.0, -10.0, -10.0]
        }
    })
}

#[test]
fn finalize_length_bonus_lets_longer_hypothesis_win() {
    let dec = short_or_long();

    let plain = search(
        &dec,
        &config(2, 5, 0),
        TokenSource::Search,
        &DecodeDiagnostics::default(),
    )
    .unwrap();
    assert!(plain.completed);
    assert_eq!(plain.best.tokens, vec![EOS, EOS]);
    let runner_up: Vec<_> = plain.runners_up.iter().map(|h| h.tokens.clone()).collect();
    assert_eq!(runner_up, vec![vec![EOS, A, EOS]]);

    // Long: two steps plus three at finalize; short: one step plus two.
    let rewarded = SearchConfig {
        length_penalty: 1.0,
        ..config(2, 5, 0)
    };
    let diag = DecodeDiagnostics::default();
    let out = search(&dec, &rewarded, TokenSource::Search, &diag).unwrap();
    assert!(out.completed);
    assert_eq!(out.best.tokens, vec![EOS, A, EOS]);
    assert_eq!(out.runners_up.len(), 1);
    assert_eq!(out.runners_up[0].tokens, vec![EOS, EOS]);
    assert!(out.best.score - out.runners_up[0].score > 0.5);
}

#[test]
fn greedy_matches_beam_at_width_one() {
    let dec = ScriptedDecoder::new(0, 5, 6, |tokens| {
        let n = tokens.len() as f32;
        vec![n - 4.0, (n * 1.3).sin(), (n * 0.7).cos(), 0.2 * n, -0.1 * n]
    });
    for cfg in [
        config(1, 12, 0),
        config(1, 12, 4),
        config(1, 2, 0),
        SearchConfig {
            length_penalty: 0.3,
            coverage_penalty: 0.5,
            ..config(1, 12, 0)
        },
    ] {
        let diag = DecodeDiagnostics::default();
        let g = greedy::run(&dec, &cfg, &diag).unwrap();
        let b = beam::run(&dec, &cfg, TokenSource::Search, &diag).unwrap();
        assert_eq!(g.best.tokens, b.best.tokens);
        assert_eq!(g.best.score.to_bits(), b.best.score.to_bits());
        assert_eq!(g.best.token_log_probs, b.best.token_log_probs);
        assert_eq!(g.best.alignments, b.best.alignments);
        assert_eq!(g.completed, b.completed);
        assert_eq!(g.steps, b.steps);
    }
}

#[test]
fn zero_coverage_weight_is_the_same_as_none() {
    let dec = ScriptedDecoder::new(0, 4, 3, |tokens| {
        let n = tokens.len() as f32;
        vec![n - 3.0, 1.0, 0.9, (n * 2.1).sin()]
    });
    let diag = DecodeDiagnostics::default();
    let plain = config(3, 8, 0);
    let zero = SearchConfig {
        coverage_penalty: 0.0,
        ..plain
    };
    let a = search(&dec, &plain, TokenSource::Search, &diag).unwrap();
    let b = search(&dec, &zero, TokenSource::Search, &diag).unwrap();
    let tokens = |o: &nestdec_core::SearchOutcome<usize>| {
        o.finalists()
            .map(|h| (h.tokens.clone(), h.score.to_bits()))
            .collect::<Vec<_>>()
    };
    assert_eq!(tokens(&a), tokens(&b));
}

#[test]
fn beam_never_exceeds_width_or_max_length() {
    let dec = ScriptedDecoder::new(0, 6, 8, |tokens| {
        let n = tokens.len() as f32;
        (0..6).map(|v| ((v as f32 + 1.0) * n * 0.37).sin()).collect()
    });
    for width in 1..=5 {
        for max in [1, 3, 7] {
            let diag = DecodeDiagnostics::default();
            let out = search(&dec, &config(width, max, 0), TokenSource::Search, &diag).unwrap();
            assert!(out.finalists().count() <= width);
            assert!(out.steps <= max);
            for hyp in out.finalists() {
                // Start token plus at most `max` steps.
                assert!(hyp.len() <= max + 1);
                assert_eq!(hyp.alignments.len(), hyp.len());
                if out.completed {
                    assert!(hyp.ends_with(dec.eos()));
                }
            }
        }
    }
}

#[test]
fn forced_labels_outside_vocabulary_are_rejected() {
    let dec = prefers_a_then_eos();
    let diag = DecodeDiagnostics::default();
    assert!(search(&dec, &config(2, 8, 0), TokenSource::Forced(&[2, 7]), &diag).is_err());
    assert!(search(&dec, &config(2, 8, 0), TokenSource::Forced(&[2, EOS]), &diag).is_err());
}

#[test]
fn forced_replay_ignores_min_length_and_beam_width() {
    let dec = prefers_a_then_eos();
    let diag = DecodeDiagnostics::default();
    let out = search(&dec, &config(4, 8, 5), TokenSource::Forced(&[3]), &diag).unwrap();
    assert!(out.completed);
    assert_eq!(out.best.tokens, vec![EOS, 3, EOS]);
    assert_eq!(out.runners_up.len(), 0);
    assert_eq!(diag.snapshot().forced_replays, 1);
}
