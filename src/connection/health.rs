//! Connection health tracking
//!
//! Probe latency samples and the rolling success rate of a connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::types::HealthState;
use crate::config::HealthConfig;

/// Classify one probe result against the thresholds
pub fn classify(latency: Option<Duration>, config: &HealthConfig) -> HealthState {
    match latency {
        None => HealthState::Failed,
        Some(l) if l.as_millis() as u64 >= config.degraded_latency_ms => HealthState::Degraded,
        Some(_) => HealthState::Healthy,
    }
}

/// Recent latency samples (bounded ring) plus command/error counters
pub struct HealthTracker {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
    commands: AtomicU64,
    errors: AtomicU64,
}

impl HealthTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            commands: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record_latency(&self, latency_ms: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    pub fn record_command(&self, ok: bool) {
        self.commands.fetch_add(1, Ordering::SeqCst);
        if !ok {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn last_latency_ms(&self) -> Option<u64> {
        self.samples.lock().back().copied()
    }

    pub fn avg_latency_ms(&self) -> Option<u64> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<u64>() / samples.len() as u64)
    }

    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    /// (commands - errors) / commands; 1.0 before anything ran
    pub fn success_rate(&self) -> f64 {
        let commands = self.commands();
        if commands == 0 {
            return 1.0;
        }
        let errors = self.errors().min(commands);
        (commands - errors) as f64 / commands as f64
    }
}
