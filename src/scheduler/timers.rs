//! Pending one-shot timers, at most one per job identifier.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// In-memory map from job identifier to its armed timer task.
///
/// Owns the spawned handles: replacing or cancelling a timer aborts the
/// old task. Bounded by the chunk size of the look-ahead loader.
#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TimerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm a timer under `identifier`, aborting any previous one.
    ///
    /// The spawn closure runs while the map lock is held: a zero-delay
    /// task blocks on [`TimerSet::take`] until its own handle has been
    /// inserted, so it can never race its own registration.
    pub(crate) async fn arm(&self, identifier: String, spawn: impl FnOnce() -> JoinHandle<()>) {
        let mut timers = self.timers.lock().await;
        if let Some(old) = timers.remove(&identifier) {
            old.abort();
        }
        timers.insert(identifier, spawn());
    }

    /// Remove an entry without aborting it. Used by a firing timer task
    /// to drop its own handle before running the job.
    pub(crate) async fn take(&self, identifier: &str) -> Option<JoinHandle<()>> {
        self.timers.lock().await.remove(identifier)
    }

    /// Abort and remove the timer for `identifier`. Returns whether one
    /// was pending.
    pub(crate) async fn cancel(&self, identifier: &str) -> bool {
        match self.timers.lock().await.remove(identifier) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort and remove every pending timer.
    pub(crate) async fn clear(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.timers.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, identifier: &str) -> bool {
        self.timers.lock().await.contains_key(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> JoinHandle<()> {
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
    }

    #[tokio::test]
    async fn arm_replaces_existing_timer() {
        let timers = TimerSet::new();
        timers.arm("job".into(), sleeper).await;
        timers.arm("job".into(), sleeper).await;
        assert_eq!(timers.len().await, 1);
    }

    #[tokio::test]
    async fn cancel_reports_whether_a_timer_was_pending() {
        let timers = TimerSet::new();
        timers.arm("job".into(), sleeper).await;
        assert!(timers.cancel("job").await);
        assert!(!timers.cancel("job").await);
        assert!(!timers.contains("job").await);
    }

    #[tokio::test]
    async fn clear_empties_the_set() {
        let timers = TimerSet::new();
        timers.arm("a".into(), sleeper).await;
        timers.arm("b".into(), sleeper).await;
        timers.clear().await;
        assert_eq!(timers.len().await, 0);
    }

    #[tokio::test]
    async fn take_does_not_abort() {
        let timers = TimerSet::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        timers
            .arm("job".into(), move || {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let _ = tx.send(());
                })
            })
            .await;

        let handle = timers.take("job").await.expect("timer should be pending");
        rx.await.expect("taken task should still run to completion");
        let _ = handle.await;
    }
}
