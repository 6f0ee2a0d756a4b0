pub use internal::{DrainMode, ReleaseShutdown, Signal as DrainTrigger, Watch as DrainWatcher};

/// Constructs a new pair for draining.
/// * DrainTrigger starts a draining sequence and waits for it to complete.
/// * DrainWatcher is held by anything that wants to participate in draining.
///   It can be cloned; a drain does not complete until all outstanding
///   DrainWatchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	internal::channel()
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (drained_tx, drained_rx) = mpsc::channel(1);
		(
			Signal {
				drained_rx,
				signal_tx,
			},
			Watch {
				drained_tx,
				signal_rx,
			},
		)
	}

	enum Never {}

	#[derive(Debug, Clone, Copy, PartialEq)]
	pub enum DrainMode {
		Immediate,
		Graceful,
	}

	/// Sends a drain command to all watchers.
	pub struct Signal {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<Option<DrainMode>>,
	}

	/// Watches for a drain command.
	///
	/// All clones must be dropped for `Signal::start_drain_and_wait` to
	/// complete.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	#[must_use = "ReleaseShutdown should be dropped explicitly to release the drain"]
	#[derive(Clone)]
	#[allow(dead_code)]
	pub struct ReleaseShutdown(mpsc::Sender<Never>, DrainMode);

	impl ReleaseShutdown {
		pub fn mode(&self) -> DrainMode {
			self.1
		}
	}

	impl Signal {
		/// Signals all watchers to begin draining and waits for every handle
		/// to be dropped.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));
			match self.drained_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}
	}

	impl Watch {
		/// Returns a `ReleaseShutdown` handle once a drain is signaled. The
		/// handle must be dropped when the shutdown action completes to
		/// unblock the trigger.
		pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
			let mode = self
				.signal_rx
				.wait_for(Option::is_some)
				.await
				.map(|mode| mode.expect("already asserted it is_some"))
				// Trigger dropped entirely; treat as no graceful drain required.
				.unwrap_or(DrainMode::Immediate);
			ReleaseShutdown(self.drained_tx, mode)
		}
	}

	impl std::fmt::Debug for Signal {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Signal").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for Watch {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Watch").finish_non_exhaustive()
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use crate::drain;
	use crate::drain::DrainMode::Graceful;

	#[tokio::test]
	async fn drain_waits_for_all_watchers() {
		let (trigger, watcher) = drain::new();
		let done = Arc::new(AtomicUsize::new(0));
		let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);

		for _ in 0..3 {
			let mut release_rx = release_tx.subscribe();
			let done = done.clone();
			let watcher = watcher.clone();
			tokio::spawn(async move {
				let shutdown = watcher.wait_for_drain().await;
				let _ = release_rx.recv().await;
				done.fetch_add(1, Ordering::SeqCst);
				drop(shutdown);
			});
		}
		drop(watcher);

		let wait = trigger.start_drain_and_wait(Graceful);
		tokio::pin!(wait);
		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {},
			_ = &mut wait => panic!("drain completed with watchers outstanding"),
		}
		let _ = release_tx.send(());
		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(500)) => panic!("timeout"),
			_ = &mut wait => {
				assert_eq!(done.load(Ordering::SeqCst), 3);
			}
		}
	}

	#[tokio::test]
	async fn dropped_trigger_reports_immediate() {
		let (trigger, watcher) = drain::new();
		drop(trigger);
		let shutdown = watcher.wait_for_drain().await;
		assert_eq!(shutdown.mode(), drain::DrainMode::Immediate);
	}
}
