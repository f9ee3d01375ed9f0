use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::store::{put_with_retry, BlobStore};

const FLUSH_ATTEMPTS: u32 = 3;

/// Cheap per-step record, kept for every step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: u64,
    pub action: usize,
    pub reward: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub future_value: Option<f32>,
}

/// Heavy diagnostic payload, kept only for notable steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectiveSummary {
    pub step: u64,
    pub q_estimate: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<Vec<f32>>,
}

/// Decides which steps earn a selective record.
#[derive(Debug, Clone, Copy, Default)]
pub enum NotablePolicy {
    /// Selective lane stays empty. The default.
    #[default]
    Never,
    /// Every step is notable; enabled by the `--tracking` flag.
    Always,
    /// Steps whose training loss exceeds the threshold.
    LossAbove(f32),
}

impl NotablePolicy {
    pub fn is_notable(&self, summary: &StepSummary) -> bool {
        match *self {
            NotablePolicy::Never => false,
            NotablePolicy::Always => true,
            NotablePolicy::LossAbove(threshold) => {
                summary.loss.is_some_and(|loss| loss > threshold)
            }
        }
    }
}

/// Lookup of a step outside the retained metrics window. Both cases are
/// recoverable by the caller (skip the visualization) and leave the buffers
/// untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("step {0} has not been recorded yet")]
    TooRecent(u64),
    #[error("step {0} was flushed or evicted from the metrics window")]
    Evicted(u64),
}

/// Buffers per-step telemetry and flushes it to durable storage.
///
/// Two lanes: `common` takes a [`StepSummary`] every step, `selective` takes
/// the heavier payload only when the policy flags the step. A flush fires
/// when the common lane is full or the wall-clock gap since the last flush
/// reaches `min_write_gap`, whichever comes first; each flush appends at
/// most one object per lane under a zero-padded sequence key, then clears
/// both lanes. The loop only ever blocks at the flush instant itself.
pub struct Evaluator {
    common: VecDeque<StepSummary>,
    selective: VecDeque<SelectiveSummary>,
    capacity: usize,
    min_write_gap: Duration,
    last_flush: Instant,
    write_seq: u64,
    counter: u64,
    policy: NotablePolicy,
    store: Box<dyn BlobStore>,
}

impl Evaluator {
    pub fn new(
        store: Box<dyn BlobStore>,
        capacity: usize,
        min_write_gap: Duration,
        policy: NotablePolicy,
    ) -> Self {
        assert!(capacity > 0);
        Self {
            common: VecDeque::with_capacity(capacity),
            selective: VecDeque::new(),
            capacity,
            min_write_gap,
            last_flush: Instant::now(),
            write_seq: 0,
            counter: 0,
            policy,
            store,
        }
    }

    /// Number of steps summarized so far; doubles as the next step index.
    pub fn count(&self) -> u64 {
        self.counter
    }

    /// Records one step. The selective payload is only built when the
    /// policy flags the step, so the closure can be as expensive as it
    /// likes on the common path.
    pub fn record_step(
        &mut self,
        summary: StepSummary,
        selective: impl FnOnce() -> SelectiveSummary,
    ) -> Result<()> {
        debug_assert_eq!(summary.step, self.counter, "step summaries must arrive in order");
        if self.policy.is_notable(&summary) {
            self.selective.push_back(selective());
        }
        self.common.push_back(summary);
        self.counter += 1;

        if self.common.len() >= self.capacity || self.last_flush.elapsed() >= self.min_write_gap {
            self.flush()?;
        }
        Ok(())
    }

    /// Serializes both lanes (selective only if non-empty) under the next
    /// write sequence number, then clears them and resets the flush timer.
    pub fn flush(&mut self) -> Result<()> {
        if self.common.is_empty() {
            return Ok(());
        }
        let common_key = format!("common/{:08}", self.write_seq);
        put_with_retry(
            self.store.as_ref(),
            &common_key,
            &json_lines(self.common.iter())?,
            FLUSH_ATTEMPTS,
        )?;
        if !self.selective.is_empty() {
            let selective_key = format!("selective/{:08}", self.write_seq);
            put_with_retry(
                self.store.as_ref(),
                &selective_key,
                &json_lines(self.selective.iter())?,
                FLUSH_ATTEMPTS,
            )?;
        }
        debug!(
            "flushed {} common / {} selective records as sequence {}",
            self.common.len(),
            self.selective.len(),
            self.write_seq
        );
        self.common.clear();
        self.selective.clear();
        self.write_seq += 1;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// The common record for `step`, if it is still in the retained window.
    pub fn summary_at(&self, step: u64) -> Result<&StepSummary, WindowError> {
        if step >= self.counter {
            return Err(WindowError::TooRecent(step));
        }
        let oldest = self.counter - self.common.len() as u64;
        if step < oldest {
            return Err(WindowError::Evicted(step));
        }
        Ok(&self.common[(step - oldest) as usize])
    }
}

fn json_lines<'a, T: Serialize + 'a>(records: impl Iterator<Item = &'a T>) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for record in records {
        serde_json::to_writer(&mut body, record)?;
        body.push(b'\n');
    }
    Ok(body)
}
