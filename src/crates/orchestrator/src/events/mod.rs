//! Lifecycle event publication
//!
//! Every significant transition is published as JSON on the task's cache
//! channel (`task:{id}:events`) and kept in a bounded per-task history so
//! late subscribers can replay what they missed. Publishing is best-effort:
//! a cache failure is logged and never fails the operation that emitted it.
//!
//! A task that reaches a terminal status is retired. Once the retention
//! window has passed, [`EventPublisher::prune`] drops its history, its
//! cached recent-events list and its channel.

pub mod history;
pub mod kind;

pub use history::{EventHistory, ReplayCriteria};
pub use kind::{EventKind, TaskEvent};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{keys, CacheStore};
use crate::Result;

const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

pub struct EventPublisher {
    cache: Arc<dyn CacheStore>,
    histories: DashMap<String, EventHistory>,
    history_size: usize,
    /// Finished tasks and when they finished
    retired: DashMap<String, Instant>,
    retention: Duration,
}

impl EventPublisher {
    pub fn new(cache: Arc<dyn CacheStore>, history_size: usize) -> Self {
        Self {
            cache,
            histories: DashMap::new(),
            history_size: history_size.max(1),
            retired: DashMap::new(),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn history(&self, task_id: &str) -> EventHistory {
        self.histories
            .entry(task_id.to_string())
            .or_insert_with(|| EventHistory::new(self.history_size))
            .clone()
    }

    /// Record and broadcast an event
    pub async fn publish(&self, task_id: &str, kind: EventKind) -> TaskEvent {
        let event = self.history(task_id).record(task_id, kind);

        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to serialize event");
                return event;
            }
        };

        if let Err(e) = self
            .cache
            .push_bounded(&keys::recent_events(task_id), payload.clone(), self.history_size)
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to store recent event");
        }

        match self
            .cache
            .publish(&keys::events_channel(task_id), payload)
            .await
        {
            Ok(receivers) => debug!(
                task_id = %task_id,
                event = event.event.name(),
                sequence = event.sequence,
                receivers = receivers,
                "Published event"
            ),
            Err(e) => warn!(
                task_id = %task_id,
                event = event.event.name(),
                error = %e,
                "Failed to publish event"
            ),
        }

        event
    }

    /// Events after `since` (all retained events when `None`)
    pub fn replay(&self, task_id: &str, since: Option<u64>) -> Vec<TaskEvent> {
        match self.histories.get(task_id) {
            Some(history) => history.get_events(&ReplayCriteria {
                after_sequence: since,
                event_types: None,
            }),
            None => Vec::new(),
        }
    }

    /// Replay with an arbitrary filter
    pub fn replay_matching(&self, task_id: &str, criteria: &ReplayCriteria) -> Vec<TaskEvent> {
        self.histories
            .get(task_id)
            .map(|history| history.get_events(criteria))
            .unwrap_or_default()
    }

    /// Recent events as stored in the cache, for processes that did not
    /// publish them; undecodable entries are skipped
    pub async fn recent_from_cache(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let raw = self.cache.range(&keys::recent_events(task_id)).await?;
        Ok(raw
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect())
    }

    /// Mark a task finished; its events stay replayable for the retention window
    pub fn retire(&self, task_id: &str) {
        self.retired
            .entry(task_id.to_string())
            .or_insert_with(Instant::now);
    }

    /// Drop events of tasks retired longer than the retention window
    ///
    /// Returns the number of tasks pruned. Cache failures are logged; the
    /// local history is dropped regardless.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .retired
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) >= self.retention)
            .map(|entry| entry.key().clone())
            .collect();

        for task_id in &expired {
            self.retired.remove(task_id);
            self.histories.remove(task_id);
            if let Err(e) = self.cache.delete(&keys::recent_events(task_id)).await {
                warn!(task_id = %task_id, error = %e, "Failed to drop recent events");
            }
            if let Err(e) = self.cache.close_channel(&keys::events_channel(task_id)).await {
                warn!(task_id = %task_id, error = %e, "Failed to close event channel");
            }
        }

        if !expired.is_empty() {
            debug!(pruned = expired.len(), "Pruned finished task events");
        }
        expired.len()
    }

    /// Live receiver plus the backlog recorded before it was attached
    ///
    /// The receiver is attached first, so an event published concurrently
    /// may appear in both; consumers deduplicate by sequence.
    pub fn subscribe(
        &self,
        task_id: &str,
    ) -> Result<(Vec<TaskEvent>, broadcast::Receiver<String>)> {
        let receiver = self.cache.subscribe(&keys::events_channel(task_id))?;
        let backlog = self.replay(task_id, None);
        Ok((backlog, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    fn publisher(size: usize) -> (Arc<InMemoryCache>, EventPublisher) {
        let cache = Arc::new(InMemoryCache::new());
        let publisher = EventPublisher::new(cache.clone(), size);
        (cache, publisher)
    }

    #[tokio::test]
    async fn test_subscriber_receives_json_events() {
        let (_cache, publisher) = publisher(10);
        let (backlog, mut rx) = publisher.subscribe("t1").unwrap();
        assert!(backlog.is_empty());

        publisher.publish("t1", EventKind::TaskPaused).await;

        let payload = rx.recv().await.unwrap();
        let event: TaskEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(event.event, EventKind::TaskPaused);
        assert_eq!(event.sequence, 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_backlog() {
        let (_cache, publisher) = publisher(2);
        publisher.publish("t1", EventKind::PlanningStarted).await;
        publisher.publish("t1", EventKind::TaskPaused).await;
        publisher.publish("t1", EventKind::TaskResumed).await;

        let (backlog, _rx) = publisher.subscribe("t1").unwrap();
        let names: Vec<&str> = backlog.iter().map(|e| e.event.name()).collect();
        assert_eq!(names, vec!["task_paused", "task_resumed"]);

        assert_eq!(publisher.replay("t1", Some(2)).len(), 1);
        assert!(publisher.replay("other", None).is_empty());
    }

    #[tokio::test]
    async fn test_sequences_are_per_task() {
        let (_cache, publisher) = publisher(10);
        publisher.publish("a", EventKind::TaskPaused).await;
        let event = publisher.publish("b", EventKind::TaskPaused).await;
        assert_eq!(event.sequence, 1);
    }

    #[tokio::test]
    async fn test_publish_survives_cache_outage() {
        let (cache, publisher) = publisher(10);
        cache.set_available(false);

        let event = publisher.publish("t1", EventKind::TaskCancelled).await;
        assert_eq!(event.sequence, 1);
        assert_eq!(publisher.replay("t1", None).len(), 1);

        cache.set_available(true);
        assert!(publisher.recent_from_cache("t1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_task_is_pruned_after_retention() {
        let (cache, publisher) = publisher(10);
        let publisher = publisher.with_retention(Duration::from_secs(60));
        publisher.publish("done", EventKind::TaskCompleted).await;
        publisher.publish("live", EventKind::TaskPaused).await;
        let (_, mut rx) = publisher.subscribe("done").unwrap();

        publisher.retire("done");
        assert_eq!(publisher.prune().await, 0);
        assert_eq!(publisher.replay("done", None).len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(publisher.prune().await, 1);
        assert!(publisher.replay("done", None).is_empty());
        assert!(publisher.recent_from_cache("done").await.unwrap().is_empty());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        // tasks that never finished are kept
        assert_eq!(publisher.replay("live", None).len(), 1);
        assert_eq!(cache.range(&keys::recent_events("live")).await.unwrap().len(), 1);
        assert_eq!(publisher.prune().await, 0);
    }

    #[tokio::test]
    async fn test_recent_events_mirrored_in_cache() {
        let (_cache, publisher) = publisher(10);
        publisher.publish("t1", EventKind::TaskPaused).await;
        publisher.publish("t1", EventKind::TaskResumed).await;

        let recent = publisher.recent_from_cache("t1").await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].event, EventKind::TaskResumed);
    }
}
