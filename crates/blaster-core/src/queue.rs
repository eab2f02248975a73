//! Mailbox between the producers of flywheel intents and the flywheel task.
//!
//! Pending intents live in a single bitmask. Posting the same intent twice
//! before the consumer drains is indistinguishable from posting it once, so
//! the queue can never overflow.

use std::sync::{Mutex, PoisonError};

use tokio::{sync::Notify, time::Instant};

use crate::{FlywheelIntent, IntentSet};

#[derive(Debug, Default)]
pub struct FlywheelEventQueue {
    pending: Mutex<IntentSet>,
    notify: Notify,
}

impl FlywheelEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, intent: FlywheelIntent) {
        self.post_all(intent.into());
    }

    /// Post several intents as one atomic batch.
    pub fn post_all(&self, intents: IntentSet) {
        if intents.is_empty() {
            return;
        }
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            *pending |= intents;
        }
        self.notify.notify_one();
    }

    /// Take everything pending, leaving the queue empty.
    pub fn try_drain(&self) -> IntentSet {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *pending)
    }

    /// Wait until something is pending or `timeout` has passed, then drain.
    ///
    /// Returns an empty set on timeout.
    pub async fn wait_and_drain(&self, timeout: std::time::Duration) -> IntentSet {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.try_drain();
            if !batch.is_empty() {
                return batch;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_drain();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn duplicate_posts_coalesce() {
        let q = FlywheelEventQueue::new();
        q.post(FlywheelIntent::Rev);
        q.post(FlywheelIntent::Rev);
        q.post_all(FlywheelIntent::PidTick | FlywheelIntent::Rev);
        assert_eq!(q.try_drain(), FlywheelIntent::Rev | FlywheelIntent::PidTick);
        assert!(q.try_drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_empty() {
        let q = FlywheelEventQueue::new();
        let start = Instant::now();
        let batch = q.wait_and_drain(Duration::from_millis(50)).await;
        assert!(batch.is_empty());
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_on_post_from_other_task() {
        let q = Arc::new(FlywheelEventQueue::new());
        let producer = {
            let q = q.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                q.post_all(FlywheelIntent::Spindown | FlywheelIntent::ClearRev);
            })
        };
        let batch = q.wait_and_drain(Duration::from_secs(1)).await;
        assert_eq!(batch, FlywheelIntent::Spindown | FlywheelIntent::ClearRev);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn post_before_wait_is_not_lost() {
        let q = FlywheelEventQueue::new();
        q.post(FlywheelIntent::PidTick);
        let batch = q.wait_and_drain(Duration::from_secs(1)).await;
        assert_eq!(batch, FlywheelIntent::PidTick);
    }
}
