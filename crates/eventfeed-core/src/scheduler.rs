//! Delayed task submission.
//!
//! Debounce, batch stagger, the scroll-restore ceiling and observer re-binds
//! all go through a [`Scheduler`] so their timing policy can be driven by a
//! [`ManualScheduler`] in tests instead of real timers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

pub type Task = BoxFuture<'static, ()>;

pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed
    fn submit(&self, delay: Duration, task: Task);
}

/// Spawns each task on the tokio runtime after sleeping for its delay
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn submit(&self, delay: Duration, task: Task) {
        tokio::spawn(async move {
            if delay.is_zero() {
                // let other ready work run first, the closest thing to an idle callback
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
    }
}

struct Pending {
    due: Duration,
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    pending: Vec<Pending>,
}

/// Deterministic scheduler with a virtual clock.
///
/// Tasks only run inside [`ManualScheduler::advance`], in due-time order
/// (submission order for ties). Tasks submitted while advancing run in the
/// same call if they fall due before the target time.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Due times of queued tasks relative to the virtual clock origin, in run order
    pub fn pending_due_times(&self) -> Vec<Duration> {
        let state = self.state.lock();
        let mut due: Vec<_> = state.pending.iter().map(|p| (p.due, p.seq)).collect();
        due.sort();
        due.into_iter().map(|(d, _)| d).collect()
    }

    /// Move the clock forward by `by`, running every task that falls due
    pub async fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;

        while let Some(pending) = self.pop_due(target) {
            pending.task.await;
        }

        self.state.lock().now = target;
    }

    /// Run everything currently due without moving the clock
    pub async fn run_due(&self) {
        self.advance(Duration::ZERO).await;
    }

    fn pop_due(&self, target: Duration) -> Option<Pending> {
        let mut state = self.state.lock();
        let index = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= target)
            .min_by_key(|(_, p)| (p.due, p.seq))
            .map(|(i, _)| i)?;
        let pending = state.pending.swap_remove(index);
        if pending.due > state.now {
            state.now = pending.due;
        }
        Some(pending)
    }
}

impl Scheduler for ManualScheduler {
    fn submit(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.now + delay;
        state.pending.push(Pending { due, seq, task });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_task = log.clone();
        let make = move |label: &'static str| {
            let log = log_for_task.clone();
            async move { log.lock().push(label) }.boxed()
        };
        (log, make)
    }

    #[tokio::test]
    async fn test_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        scheduler.submit(Duration::from_millis(300), task("late"));
        scheduler.submit(Duration::from_millis(100), task("early"));
        scheduler.submit(Duration::from_millis(100), task("early-second"));

        scheduler.advance(Duration::from_millis(150)).await;
        assert_eq!(*log.lock(), vec!["early", "early-second"]);
        assert_eq!(scheduler.pending_count(), 1);

        scheduler.advance(Duration::from_millis(150)).await;
        assert_eq!(*log.lock(), vec!["early", "early-second", "late"]);
        assert_eq!(scheduler.now(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_nested_submission_runs_when_due() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();
        let inner = scheduler.clone();
        let follow_up = task("follow-up");

        scheduler.submit(
            Duration::from_millis(10),
            async move {
                inner.submit(Duration::from_millis(10), follow_up);
            }
            .boxed(),
        );

        scheduler.advance(Duration::from_millis(15)).await;
        assert!(log.lock().is_empty());
        assert_eq!(scheduler.pending_due_times(), vec![Duration::from_millis(20)]);

        scheduler.advance(Duration::from_millis(5)).await;
        assert_eq!(*log.lock(), vec!["follow-up"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_waits_for_delay() {
        let (log, task) = recorder();
        TokioScheduler.submit(Duration::from_secs(2), task("done"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(log.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*log.lock(), vec!["done"]);
    }
}
