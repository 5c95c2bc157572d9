//! Cache key layout

/// Snapshot of a whole task
pub fn task(task_id: &str) -> String {
    format!("task:{}", task_id)
}

/// Snapshot of one step
pub fn step(task_id: &str, step_id: &str) -> String {
    format!("task:{}:step:{}", task_id, step_id)
}

/// Cooperative cancellation marker
pub fn cancel(task_id: &str) -> String {
    format!("task:{}:cancel", task_id)
}

/// Pub/sub channel carrying JSON lifecycle events
pub fn events_channel(task_id: &str) -> String {
    format!("task:{}:events", task_id)
}

/// Bounded list of the most recent events
pub fn recent_events(task_id: &str) -> String {
    format!("task:{}:events:recent", task_id)
}

/// Single-firer lock for an automation tick
pub fn automation_lock(automation_id: &str) -> String {
    format!("automation:{}:lock", automation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(task("t1"), "task:t1");
        assert_eq!(step("t1", "s1"), "task:t1:step:s1");
        assert_eq!(cancel("t1"), "task:t1:cancel");
        assert_eq!(events_channel("t1"), "task:t1:events");
        assert_eq!(automation_lock("a1"), "automation:a1:lock");
    }
}
