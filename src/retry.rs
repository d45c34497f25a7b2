use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::ScreenError;

/// Bounded linear backoff: attempt `n` (1-based) sleeps `base_delay × n`
/// before the next try; the final failure propagates with its cause intact.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Run `operation` up to `max_attempts` times. Only transient provider
    /// errors are retried; anything else escalates on first occurrence.
    pub fn run<T, F>(&self, mut operation: F) -> Result<T, ScreenError>
    where
        F: FnMut() -> Result<T, ScreenError>,
    {
        let mut attempt = 1u32;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    warn!(attempt, "transient provider failure, retrying: {err}");
                    thread::sleep(self.base_delay * attempt);
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(ScreenError::RetriesExhausted {
                        attempts: self.max_attempts,
                        cause: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Wraps provider calls with retry and a fixed inter-call delay. The delay
/// runs after every successful call, unconditionally.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    pub policy: RetryPolicy,
    pub inter_call_delay: Duration,
}

impl Throttle {
    pub fn new(policy: RetryPolicy, inter_call_delay: Duration) -> Self {
        Self {
            policy,
            inter_call_delay,
        }
    }

    pub fn call<T, F>(&self, operation: F) -> Result<T, ScreenError>
    where
        F: FnMut() -> Result<T, ScreenError>,
    {
        let value = self.policy.run(operation)?;
        if !self.inter_call_delay.is_zero() {
            thread::sleep(self.inter_call_delay);
        }
        Ok(value)
    }
}

/// Capacity limit a source imposes on one batched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchLimit {
    /// Maximum number of targets per batch.
    Items(usize),
    /// Maximum serialized length of the comma-joined targets.
    Chars(usize),
}

/// Partition `targets` into the minimum number of contiguous batches none of
/// which exceeds `limit`. Order is preserved and every target lands in
/// exactly one batch. A single target that alone exceeds a character limit
/// is a capacity violation, reported immediately and never retried.
pub fn chunk_targets(targets: &[String], limit: BatchLimit) -> Result<Vec<Vec<String>>, ScreenError> {
    match limit {
        BatchLimit::Items(max_items) => {
            if max_items == 0 {
                return Err(ScreenError::BatchCapacity(
                    "batch item limit must be positive".to_string(),
                ));
            }
            Ok(targets
                .chunks(max_items)
                .map(|chunk| chunk.to_vec())
                .collect())
        }
        BatchLimit::Chars(max_chars) => chunk_by_chars(targets, max_chars),
    }
}

fn chunk_by_chars(targets: &[String], max_chars: usize) -> Result<Vec<Vec<String>>, ScreenError> {
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_length = 0usize;
    for target in targets {
        if target.len() > max_chars {
            return Err(ScreenError::BatchCapacity(format!(
                "target '{target}' is longer than the {max_chars}-char batch limit"
            )));
        }
        // +1 for the separator that joins it to the batch so far.
        let added = target.len() + usize::from(!current.is_empty());
        if current_length + added > max_chars {
            batches.push(std::mem::take(&mut current));
            current.push(target.clone());
            current_length = target.len();
        } else {
            current.push(target.clone());
            current_length += added;
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}
