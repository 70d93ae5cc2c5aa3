use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Counters shared by every search of a decoding session. Safe to share
/// across worker threads.
#[derive(Debug, Default)]
pub struct DecodeDiagnostics {
    pub searches: AtomicUsize,
    pub search_steps: AtomicUsize,
    pub expansions: AtomicUsize,
    pub eos_rejected: AtomicUsize,
    pub completed_hypotheses: AtomicUsize,
    pub open_beam_fallbacks: AtomicUsize,
    pub forced_replays: AtomicUsize,
    pub utterances_decoded: AtomicUsize,
    latencies_ms: Mutex<Vec<f64>>,
}

impl DecodeDiagnostics {
    pub fn add(&self, counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_latency(&self, ms: f64) {
        self.latencies_ms.lock().push(ms);
    }

    /// Per-utterance wall time in milliseconds, in completion order.
    pub fn latencies_ms(&self) -> Vec<f64> {
        self.latencies_ms.lock().clone()
    }

    pub fn reset(&self) {
        self.searches.store(0, Ordering::Relaxed);
        self.search_steps.store(0, Ordering::Relaxed);
        self.expansions.store(0, Ordering::Relaxed);
        self.eos_rejected.store(0, Ordering::Relaxed);
        self.completed_hypotheses.store(0, Ordering::Relaxed);
        self.open_beam_fallbacks.store(0, Ordering::Relaxed);
        self.forced_replays.store(0, Ordering::Relaxed);
        self.utterances_decoded.store(0, Ordering::Relaxed);
        self.latencies_ms.lock().clear();
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let (mean_latency_ms, max_latency_ms) = {
            let log = self.latencies_ms.lock();
            if log.is_empty() {
                (0.0, 0.0)
            } else {
                let total: f64 = log.iter().sum();
                let max = log.iter().copied().fold(0.0, f64::max);
                (total / log.len() as f64, max)
            }
        };
        DiagnosticsSnapshot {
            searches: self.searches.load(Ordering::Relaxed),
            search_steps: self.search_steps.load(Ordering::Relaxed),
            expansions: self.expansions.load(Ordering::Relaxed),
            eos_rejected: self.eos_rejected.load(Ordering::Relaxed),
            completed_hypotheses: self.completed_hypotheses.load(Ordering::Relaxed),
            open_beam_fallbacks: self.open_beam_fallbacks.load(Ordering::Relaxed),
            forced_replays: self.forced_replays.load(Ordering::Relaxed),
            utterances_decoded: self.utterances_decoded.load(Ordering::Relaxed),
            mean_latency_ms,
            max_latency_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub searches: usize,
    pub search_steps: usize,
    pub expansions: usize,
    pub eos_rejected: usize,
    pub completed_hypotheses: usize,
    pub open_beam_fallbacks: usize,
    pub forced_replays: usize,
    pub utterances_decoded: usize,
    pub mean_latency_ms: f64,
    pub max_latency_ms: f64,
}
