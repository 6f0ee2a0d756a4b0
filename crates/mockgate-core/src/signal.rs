//! Stop requests. A server stops for one of three reasons: an OS signal, the
//! management stop endpoint, or a programmatic stop. The lifecycle task holds
//! the listener; every requester holds a cloned trigger.

use tokio::sync::mpsc;
use tracing::info;

/// Why the server is stopping. Carried to the lifecycle for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	/// SIGINT or SIGTERM (Ctrl+C elsewhere).
	Interrupted,
	/// The management API or an embedding application asked for it.
	Requested,
}

pub fn stop_channel() -> (StopTrigger, StopListener) {
	let (tx, rx) = mpsc::channel(1);
	(StopTrigger { tx }, StopListener { rx })
}

#[derive(Clone, Debug)]
pub struct StopTrigger {
	tx: mpsc::Sender<StopReason>,
}

impl StopTrigger {
	/// Requests a stop. A no-op once the lifecycle has already begun
	/// stopping, which makes stop idempotent for every caller.
	pub async fn stop_now(&self) {
		let _ = self.tx.send(StopReason::Requested).await;
	}
}

pub struct StopListener {
	rx: mpsc::Receiver<StopReason>,
}

impl StopListener {
	/// Resolves when a stop is requested or the process is interrupted, with
	/// the reason.
	pub async fn wait(mut self) -> StopReason {
		tokio::select! {
			_ = interrupted() => StopReason::Interrupted,
			reason = self.rx.recv() => reason.unwrap_or(StopReason::Requested),
		}
	}
}

#[cfg(unix)]
async fn interrupted() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
	let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
	tokio::select! {
		_ = sigint.recv() => info!("received SIGINT, stopping"),
		_ = sigterm.recv() => info!("received SIGTERM, stopping"),
	}
}

#[cfg(not(unix))]
async fn interrupted() {
	let _ = tokio::signal::ctrl_c().await;
	info!("received Ctrl+C, stopping");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn trigger_resolves_the_listener_with_the_reason() {
		let (trigger, listener) = stop_channel();
		tokio::spawn(async move { trigger.stop_now().await });
		assert_eq!(listener.wait().await, StopReason::Requested);
	}

	#[tokio::test]
	async fn dropped_triggers_do_not_hang_the_listener() {
		let (trigger, listener) = stop_channel();
		let second = trigger.clone();
		drop(trigger);
		tokio::spawn(async move { second.stop_now().await });
		assert_eq!(listener.wait().await, StopReason::Requested);
	}
}
