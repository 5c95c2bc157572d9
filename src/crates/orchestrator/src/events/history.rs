//! Bounded per-task event history for replay-on-connect

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::kind::{EventKind, TaskEvent};

/// Replay filter
#[derive(Debug, Clone, Default)]
pub struct ReplayCriteria {
    /// Only events with a sequence strictly greater than this
    pub after_sequence: Option<u64>,
    /// Only these event names
    pub event_types: Option<Vec<String>>,
}

impl ReplayCriteria {
    pub fn after(sequence: u64) -> Self {
        Self {
            after_sequence: Some(sequence),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &TaskEvent) -> bool {
        if let Some(after) = self.after_sequence {
            if event.sequence <= after {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event.name()) {
                return false;
            }
        }

        true
    }
}

struct Inner {
    events: VecDeque<TaskEvent>,
    next_sequence: u64,
}

/// Ring buffer of one task's most recent events
///
/// Sequence assignment and insertion happen under one lock, so the buffer
/// is always in sequence order.
#[derive(Clone)]
pub struct EventHistory {
    inner: Arc<Mutex<Inner>>,
    max_size: usize,
}

impl EventHistory {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                events: VecDeque::with_capacity(max_size),
                next_sequence: 1,
            })),
            max_size,
        }
    }

    /// Stamp and store an event, evicting the oldest at capacity
    pub fn record(&self, task_id: &str, kind: EventKind) -> TaskEvent {
        let mut inner = self.inner.lock();
        let event = TaskEvent {
            sequence: inner.next_sequence,
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            event: kind,
        };
        inner.next_sequence += 1;

        if inner.events.len() >= self.max_size {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        event
    }

    pub fn get_events(&self, criteria: &ReplayCriteria) -> Vec<TaskEvent> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|e| criteria.matches(e))
            .cloned()
            .collect()
    }

    pub fn get_all(&self) -> Vec<TaskEvent> {
        self.inner.lock().events.iter().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Sequence the next recorded event will get
    pub fn next_sequence(&self) -> u64 {
        self.inner.lock().next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let history = EventHistory::new(3);
        for _ in 0..5 {
            history.record("t1", EventKind::TaskResumed);
        }

        let events = history.get_all();
        assert_eq!(events.len(), 3);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        assert_eq!(history.next_sequence(), 6);
    }

    #[test]
    fn test_replay_after_sequence_and_type() {
        let history = EventHistory::new(10);
        history.record("t1", EventKind::PlanningStarted);
        history.record("t1", EventKind::TaskPaused);
        history.record("t1", EventKind::TaskResumed);

        let after_first = history.get_events(&ReplayCriteria::after(1));
        assert_eq!(after_first.len(), 2);

        let only_paused = history.get_events(&ReplayCriteria {
            after_sequence: None,
            event_types: Some(vec!["task_paused".to_string()]),
        });
        assert_eq!(only_paused.len(), 1);
        assert_eq!(only_paused[0].sequence, 2);
    }
}
