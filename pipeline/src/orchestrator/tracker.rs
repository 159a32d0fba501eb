use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;

/// Tracks how many stage-executions are currently enqueued or in flight across all
/// three queues combined. A task that is forwarded to the next queue nets to zero: the
/// increment for the forward pairs with the decrement for the stage that just finished.
/// `wait_drained` resolves once the count returns to zero -- the producer-side join
/// the orchestrator uses instead of awaiting each worker individually mid-run.
#[derive(Default)]
pub struct WorkTracker {
    outstanding: AtomicI64,
    notify: Notify,
}

impl WorkTracker {
    pub fn enqueued(&self, n: i64) {
        if n == 0 {
            return;
        }
        self.outstanding.fetch_add(n, Ordering::SeqCst);
    }

    pub fn completed(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if previous <= 1 {
            self.notify.notify_waiters();
        }
    }

    pub async fn wait_drained(&self) {
        loop {
            if self.outstanding.load(Ordering::SeqCst) <= 0 {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_drained_resolves_once_all_completions_land() {
        let tracker = Arc::new(WorkTracker::default());
        tracker.enqueued(3);

        let background = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    tracker.completed();
                }
            })
        };

        tracker.wait_drained().await;
        background.await.expect("background task completes");
    }
}
