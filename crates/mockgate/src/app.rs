//! Lifecycle orchestration: start, runtime binds, staged shutdown.
//!
//! Shutdown ordering: broadcast STOP (callback channels close), shut the
//! scheduler down, then drain workers and acceptors under a hard deadline.
//! Ports are released before `stop` returns.

use mockgate_core::prelude::*;
use mockgate_core::{drain, signal};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::callback::CallbackRegistry;
use crate::callback::local::LocalCallbacks;
use crate::client::Upstream;
use crate::journal::Journal;
use crate::scheduler::Scheduler;
use crate::store::ExpectationStore;
use crate::{BindRequest, Config, EventBus, MockClient, PortSet, ServerEvent, ServerInputs, listener};

/// Lifecycle states. `is_running` is true only in `Running`, so a partially
/// shut down server never reports as running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	New,
	Running,
	Stopping,
	Stopped,
}

pub struct MockServer {
	inputs: Arc<ServerInputs>,
	state: watch::Receiver<State>,
}

impl std::fmt::Debug for MockServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MockServer")
			.field("state", &*self.state.borrow())
			.finish()
	}
}

impl MockServer {
	/// Binds the configured ports and starts serving. Returns once every
	/// listener is accepting.
	pub async fn start(cfg: Arc<Config>) -> anyhow::Result<MockServer> {
		Self::start_with(cfg, LocalCallbacks::new()).await
	}

	/// As `start`, with a pre-populated local callback registry.
	pub async fn start_with(
		cfg: Arc<Config>,
		local_callbacks: LocalCallbacks,
	) -> anyhow::Result<MockServer> {
		let (drain_tx, drain_rx) = drain::new();
		let (stop_tx, stop_rx) = signal::stop_channel();
		let scheduler = Scheduler::new(cfg.worker_threads);
		let upstream = Upstream::new(
			cfg.socket_connection_timeout,
			cfg.retry.clone(),
			scheduler.clone(),
		);
		let (bind_tx, bind_rx) = mpsc::channel(8);
		let inputs = Arc::new(ServerInputs {
			store: ExpectationStore::new(cfg.max_expectations),
			journal: Journal::new(cfg.max_log_entries),
			callbacks: CallbackRegistry::new(cfg.max_websocket_queue, cfg.callback_response_timeout),
			local_callbacks,
			scheduler: scheduler.clone(),
			upstream,
			ports: PortSet::default(),
			events: EventBus::new(),
			stop: stop_tx,
			binds: bind_tx,
			cfg: cfg.clone(),
		});

		let listeners = listener::bind_ports(cfg.listen_ip, &cfg.ports).await?;
		for l in &listeners {
			inputs.ports.add(l.local_addr().context("local address must be ready")?.port());
		}
		for l in listeners {
			listener::spawn_listener(inputs.clone(), drain_rx.clone(), l);
		}
		info!(ports = ?inputs.ports.all(), "mock server started");
		inputs.events.publish(ServerEvent::Started);

		let (state_tx, state_rx) = watch::channel(State::Running);
		tokio::spawn(run_lifecycle(
			inputs.clone(),
			stop_rx,
			drain_tx,
			drain_rx,
			bind_rx,
			state_tx,
		));

		Ok(MockServer {
			inputs,
			state: state_rx,
		})
	}

	pub fn local_ports(&self) -> Vec<u16> {
		self.inputs.ports.all()
	}

	/// The first bound port, or `None` when nothing is bound.
	pub fn local_port(&self) -> Option<u16> {
		self.inputs.ports.first()
	}

	pub fn state(&self) -> State {
		*self.state.borrow()
	}

	pub fn is_running(&self) -> bool {
		self.state() == State::Running
	}

	/// Clears expectations, the journal, and callback registrations. Ports
	/// stay bound.
	pub fn reset(&self) {
		self.inputs.reset();
	}

	pub fn local_callbacks(&self) -> &LocalCallbacks {
		&self.inputs.local_callbacks
	}

	pub fn inputs(&self) -> &Arc<ServerInputs> {
		&self.inputs
	}

	/// A management-API client bound to this server.
	pub fn client(&self) -> anyhow::Result<MockClient> {
		let port = self
			.local_port()
			.context("server has no bound ports")?;
		Ok(MockClient::new(self.inputs.cfg.listen_ip, port))
	}

	/// Triggers shutdown and waits for it to complete. Idempotent; all bound
	/// ports are released before this returns.
	pub async fn stop(&self) {
		self.inputs.stop.stop_now().await;
		let mut state = self.state.clone();
		while *state.borrow() != State::Stopped {
			if state.changed().await.is_err() {
				return;
			}
		}
	}

	/// Blocks until something (signal, `/stop`, [`MockServer::stop`]) shuts
	/// the server down.
	pub async fn wait_termination(&self) {
		let mut state = self.state.clone();
		while *state.borrow() != State::Stopped {
			if state.changed().await.is_err() {
				return;
			}
		}
	}
}

async fn run_lifecycle(
	inputs: Arc<ServerInputs>,
	stop_rx: signal::StopListener,
	drain_tx: drain::DrainTrigger,
	drain_rx: drain::DrainWatcher,
	mut bind_rx: mpsc::Receiver<BindRequest>,
	state_tx: watch::Sender<State>,
) {
	let wait = stop_rx.wait();
	tokio::pin!(wait);
	let reason = loop {
		tokio::select! {
			reason = &mut wait => break Some(reason),
			req = bind_rx.recv() => {
				let Some(BindRequest { ports, reply }) = req else { break None };
				let result = bind_runtime(&inputs, &drain_rx, ports).await;
				let _ = reply.send(result);
			},
		}
	};

	let _ = state_tx.send(State::Stopping);
	info!(?reason, "shutdown started");
	// Refuse further runtime binds and release our own drain participation
	// before waiting on it.
	drop(bind_rx);
	drop(drain_rx);

	inputs.events.publish(ServerEvent::Stop);
	inputs.callbacks.close_all();
	inputs.scheduler.shutdown().await;

	let deadline = inputs.cfg.termination_deadline;
	if tokio::time::timeout(
		deadline,
		drain_tx.start_drain_and_wait(drain::DrainMode::Graceful),
	)
	.await
	.is_err()
	{
		warn!("drain deadline {deadline:?} expired with connections still open");
	}
	let _ = state_tx.send(State::Stopped);
	info!("shutdown complete");
}

async fn bind_runtime(
	inputs: &Arc<ServerInputs>,
	drain_rx: &drain::DrainWatcher,
	ports: Vec<u16>,
) -> Result<Vec<u16>, listener::PortBindError> {
	let listeners = listener::bind_ports(inputs.cfg.listen_ip, &ports).await?;
	let mut bound = Vec::with_capacity(listeners.len());
	for l in listeners {
		let port = l
			.local_addr()
			.map(|a| a.port())
			.map_err(|source| listener::PortBindError { port: 0, source })?;
		inputs.ports.add(port);
		bound.push(port);
		listener::spawn_listener(inputs.clone(), drain_rx.clone(), l);
	}
	info!(ports = ?bound, "bound additional ports");
	Ok(bound)
}
