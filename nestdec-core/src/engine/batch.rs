//! Batch decoding with a per-utterance two-phase barrier.
//!
//! Each utterance moves `Pending → SubDecoded → Done`. A main-task search for
//! an utterance still `Pending` is a `DependencyViolation`. Utterances are
//! independent of each other, so `decode_batch_parallel` spreads whole
//! utterances over scoped worker threads.

use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use tracing::{debug, info, info_span};

use super::diagnostics::DecodeDiagnostics;
use super::{HierarchicalModel, SubTaskOutcome};
use crate::config::DecodeConfig;
use crate::encoded::Utterance;
use crate::error::{NestdecError, Result};
use crate::report::UtteranceDecode;

#[derive(Debug)]
enum Stage {
    Pending,
    SubDecoded {
        outcome: SubTaskOutcome,
        elapsed: Duration,
    },
    Done(UtteranceDecode),
}

/// Drives both phases for a batch of utterances.
pub struct BatchDecoder<'a> {
    model: &'a HierarchicalModel,
    utterances: &'a [Utterance],
    labels_sub: Option<&'a [Vec<usize>]>,
    config: DecodeConfig,
    stages: Vec<Stage>,
    diagnostics: &'a DecodeDiagnostics,
}

impl<'a> BatchDecoder<'a> {
    /// # Errors
    /// `Configuration` when either search configuration is invalid.
    pub fn new(
        model: &'a HierarchicalModel,
        utterances: &'a [Utterance],
        config: DecodeConfig,
        diagnostics: &'a DecodeDiagnostics,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            utterances,
            labels_sub: None,
            config,
            stages: utterances.iter().map(|_| Stage::Pending).collect(),
            diagnostics,
        })
    }

    /// Replays reference sub-task labels (one sequence per utterance) instead
    /// of searching. Forces the sub beam width to 1.
    pub fn with_sub_labels(mut self, labels: &'a [Vec<usize>]) -> Result<Self> {
        if labels.len() != self.utterances.len() {
            return Err(NestdecError::InvalidInput(format!(
                "{} label sequences for {} utterances",
                labels.len(),
                self.utterances.len()
            )));
        }
        self.labels_sub = Some(labels);
        self.config = self.config.teacher_forced();
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    fn utterance(&self, index: usize) -> Result<&'a Utterance> {
        self.utterances.get(index).ok_or_else(|| {
            NestdecError::InvalidInput(format!(
                "utterance {index} out of range for a batch of {}",
                self.utterances.len()
            ))
        })
    }

    pub fn is_sub_decoded(&self, index: usize) -> bool {
        matches!(
            self.stages.get(index),
            Some(Stage::SubDecoded { .. } | Stage::Done(_))
        )
    }

    pub fn is_done(&self, index: usize) -> bool {
        matches!(self.stages.get(index), Some(Stage::Done(_)))
    }

    /// Phase one for utterance `index`. Idempotent once it has run.
    pub fn decode_sub(&mut self, index: usize) -> Result<()> {
        let utterance = self.utterance(index)?;
        if self.is_sub_decoded(index) {
            return Ok(());
        }
        let _span = info_span!("sub", utterance = index).entered();
        let labels = self
            .labels_sub
            .and_then(|labels| labels.get(index))
            .map(Vec::as_slice);
        let started = Instant::now();
        let outcome = self
            .model
            .decode_sub(utterance, &self.config.sub, labels, self.diagnostics)?;
        self.stages[index] = Stage::SubDecoded {
            outcome,
            elapsed: started.elapsed(),
        };
        Ok(())
    }

    /// Phase two for utterance `index`.
    ///
    /// # Errors
    /// `DependencyViolation` when phase one has not run for `index`.
    pub fn decode_main(&mut self, index: usize) -> Result<()> {
        let utterance = self.utterance(index)?;
        let (outcome, elapsed) = match &self.stages[index] {
            Stage::Pending => return Err(NestdecError::DependencyViolation { utterance: index }),
            Stage::Done(_) => return Ok(()),
            Stage::SubDecoded { outcome, elapsed } => (outcome, *elapsed),
        };
        let _span = info_span!("main", utterance = index).entered();
        let started = Instant::now();
        let main = self.model.decode_main(
            utterance,
            &outcome.context,
            &self.config.main,
            None,
            self.diagnostics,
        )?;
        let total = elapsed + started.elapsed();
        self.diagnostics.record_latency(total.as_secs_f64() * 1000.0);
        self.diagnostics.add(&self.diagnostics.utterances_decoded, 1);

        let Stage::SubDecoded { outcome, .. } = std::mem::replace(&mut self.stages[index], Stage::Pending)
        else {
            return Err(NestdecError::DependencyViolation { utterance: index });
        };
        self.stages[index] = Stage::Done(UtteranceDecode {
            main: main.hypothesis,
            sub: outcome.hypothesis,
            cross_alignment: main.cross_alignment,
        });
        Ok(())
    }

    /// Runs phase one for every utterance, then phase two for every
    /// utterance, and returns the results in input order.
    pub fn run(mut self) -> Result<Vec<UtteranceDecode>> {
        for index in 0..self.len() {
            self.decode_sub(index)?;
        }
        for index in 0..self.len() {
            self.decode_main(index)?;
        }
        self.finish()
    }

    /// Results in input order.
    ///
    /// # Errors
    /// `DependencyViolation` for the first utterance that is not done.
    pub fn finish(self) -> Result<Vec<UtteranceDecode>> {
        self.stages
            .into_iter()
            .enumerate()
            .map(|(index, stage)| match stage {
                Stage::Done(decode) => Ok(decode),
                _ => Err(NestdecError::DependencyViolation { utterance: index }),
            })
            .collect()
    }
}

/// Decodes every utterance on the calling thread. All or nothing: the first
/// error aborts the batch.
pub fn decode_batch(
    model: &HierarchicalModel,
    utterances: &[Utterance],
    config: &DecodeConfig,
    diagnostics: &DecodeDiagnostics,
) -> Result<Vec<UtteranceDecode>> {
    info!(utterances = utterances.len(), "decoding batch");
    BatchDecoder::new(model, utterances, *config, diagnostics)?.run()
}

/// Decodes utterances on up to `workers` scoped threads. Results come back in
/// input order; if any utterance fails, the error of the lowest failing index
/// is returned.
pub fn decode_batch_parallel(
    model: &HierarchicalModel,
    utterances: &[Utterance],
    config: &DecodeConfig,
    workers: usize,
    diagnostics: &DecodeDiagnostics,
) -> Result<Vec<UtteranceDecode>> {
    config.validate()?;
    let workers = workers.clamp(1, utterances.len().max(1));
    info!(utterances = utterances.len(), workers, "decoding batch in parallel");

    let (job_tx, job_rx) = unbounded::<usize>();
    let (result_tx, result_rx) = unbounded::<(usize, Result<UtteranceDecode>)>();
    for index in 0..utterances.len() {
        // Receiver is alive until the scope below ends.
        let _ = job_tx.send(index);
    }
    drop(job_tx);

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            scope.spawn(move || {
                for index in jobs.iter() {
                    let _span = info_span!("utterance", utterance = index, worker).entered();
                    let decoded = model.decode(&utterances[index], config, diagnostics);
                    if results.send((index, decoded)).is_err() {
                        break;
                    }
                }
                debug!(worker, "decode worker finished");
            });
        }
    });
    drop(result_tx);

    let mut slots: Vec<Option<Result<UtteranceDecode>>> = utterances.iter().map(|_| None).collect();
    for (index, decoded) in result_rx.iter() {
        slots[index] = Some(decoded);
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| {
                Err(NestdecError::Other(anyhow::anyhow!(
                    "utterance {index} produced no result"
                )))
            })
        })
        .collect()
}
