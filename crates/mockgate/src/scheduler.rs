//! Bounded pool for deferred work: response delays, callback timeouts, and
//! retry backoff timers. Listener shutdown is sequenced after scheduler
//! shutdown, so nothing here may outlive the lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(thiserror::Error, Debug)]
#[error("scheduler is shut down")]
pub struct SchedulerStopped;

#[derive(Clone)]
pub struct Scheduler {
	inner: Arc<Inner>,
}

struct Inner {
	permits: Arc<Semaphore>,
	cancel: CancellationToken,
	tracker: TaskTracker,
}

impl Scheduler {
	pub fn new(workers: usize) -> Scheduler {
		Scheduler {
			inner: Arc::new(Inner {
				permits: Arc::new(Semaphore::new(workers.max(1))),
				cancel: CancellationToken::new(),
				tracker: TaskTracker::new(),
			}),
		}
	}

	/// Runs `task` after `delay`, once a worker slot frees up. Pending timers
	/// are dropped on shutdown; a task that already started observes the
	/// cancellation signal instead.
	pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<(), SchedulerStopped>
	where
		F: Future<Output = ()> + Send + 'static,
	{
		if self.inner.cancel.is_cancelled() {
			return Err(SchedulerStopped);
		}
		let inner = self.inner.clone();
		self.inner.tracker.spawn(async move {
			tokio::select! {
				_ = inner.cancel.cancelled() => return,
				_ = tokio::time::sleep(delay) => {}
			}
			let Ok(_permit) = inner.permits.clone().acquire_owned().await else {
				return;
			};
			tokio::select! {
				_ = inner.cancel.cancelled() => {}
				_ = task => {}
			}
		});
		Ok(())
	}

	/// Cancellable sleep for inline delays (respond-with-delay, backoff).
	/// Returns false if the scheduler shut down before the delay elapsed.
	pub async fn sleep(&self, delay: Duration) -> bool {
		tokio::select! {
			_ = self.inner.cancel.cancelled() => false,
			_ = tokio::time::sleep(delay) => true,
		}
	}

	pub fn is_shutdown(&self) -> bool {
		self.inner.cancel.is_cancelled()
	}

	/// Cancels pending timers, refuses new work, and waits for running tasks
	/// to finish observing the cancellation.
	pub async fn shutdown(&self) {
		self.inner.cancel.cancel();
		self.inner.tracker.close();
		self.inner.tracker.wait().await;
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn scheduled_task_runs_after_delay() {
		let scheduler = Scheduler::new(2);
		let ran = Arc::new(AtomicUsize::new(0));
		let r = ran.clone();
		scheduler
			.schedule(Duration::from_millis(10), async move {
				r.fetch_add(1, Ordering::SeqCst);
			})
			.unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(ran.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn shutdown_cancels_pending_timers() {
		let scheduler = Scheduler::new(2);
		let ran = Arc::new(AtomicUsize::new(0));
		let r = ran.clone();
		scheduler
			.schedule(Duration::from_secs(60), async move {
				r.fetch_add(1, Ordering::SeqCst);
			})
			.unwrap();
		scheduler.shutdown().await;
		assert_eq!(ran.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn refuses_work_after_shutdown() {
		let scheduler = Scheduler::new(2);
		scheduler.shutdown().await;
		assert!(scheduler.schedule(Duration::ZERO, async {}).is_err());
		assert!(!scheduler.sleep(Duration::from_secs(60)).await);
	}
}
