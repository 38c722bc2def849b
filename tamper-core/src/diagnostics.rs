//! Structured record of what declarative hooks did.
//!
//! Patch hooks never fail an exchange. When their URL matched, the outcome
//! (applied, or skipped with a reason) lands here so a test can assert the
//! hook actually fired instead of reading log output.

use crate::hooks::{HookId, HookOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    pub hook: HookId,
    pub label: String,
    /// Path and query of the matched request
    pub url: String,
    pub outcome: HookOutcome,
    pub at: DateTime<Utc>,
}

/// Bounded, shared buffer of [`HookEvent`]s. Oldest events are dropped first.
#[derive(Debug, Clone)]
pub struct HookDiagnostics {
    events: Arc<Mutex<VecDeque<HookEvent>>>,
    capacity: usize,
}

impl Default for HookDiagnostics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl HookDiagnostics {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, hook: HookId, label: &str, url: &str, outcome: HookOutcome) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(HookEvent {
            hook,
            label: label.to_string(),
            url: url.to_string(),
            outcome,
            at: Utc::now(),
        });
    }

    /// Snapshot of all retained events, oldest first.
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Outcomes recorded for one hook, oldest first.
    pub fn outcomes_for(&self, hook: HookId) -> Vec<HookOutcome> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.hook == hook)
            .map(|event| event.outcome.clone())
            .collect()
    }

    /// Number of times the hook mutated a response.
    pub fn applied_count(&self, hook: HookId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.hook == hook && event.outcome == HookOutcome::Applied)
            .count()
    }

    /// Number of times the hook matched a URL but found nothing to change.
    pub fn skipped_count(&self, hook: HookId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.hook == hook && matches!(event.outcome, HookOutcome::Skipped(_)))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
