//! The coalescing "decision" event (spec §5, §9 design notes).
//!
//! Multiple schedules before the event is awaited collapse into a single
//! wake-up. [`tokio::sync::Notify`] already has exactly this semantic (it
//! stores at most one permit), so this is a thin, named wrapper rather than
//! a hand-rolled queue.

use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone, Debug, Default)]
pub struct DecisionEvent(Arc<Notify>);

impl DecisionEvent {
    pub fn new() -> Self {
        Self(Arc::new(Notify::new()))
    }

    /// Schedules the peer's decision logic to run. Safe to call repeatedly;
    /// it does not queue, it sets a single pending flag.
    pub fn schedule(&self) {
        self.0.notify_one();
    }

    /// Waits for the next scheduled decision.
    pub async fn wait(&self) {
        self.0.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn repeated_schedules_before_a_wait_coalesce() {
        let event = DecisionEvent::new();
        event.schedule();
        event.schedule();
        event.schedule();
        // All three collapse into the single pending permit Notify stores;
        // the first wait consumes it immediately.
        tokio::time::timeout(Duration::from_millis(50), event.wait())
            .await
            .expect("a schedule was pending");
        // No further schedules were issued, so a second wait must hang.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), event.wait())
                .await
                .is_err()
        );
    }
}
