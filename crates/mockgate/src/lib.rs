use mockgate_core::prelude::*;
use mockgate_core::signal;
use tokio::sync::{broadcast, mpsc, oneshot};

pub mod apiclient;
pub mod app;
pub mod callback;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod journal;
pub mod listener;
pub mod management;
pub mod matching;
pub mod scheduler;
pub mod serdes;
pub mod store;
pub mod types;

pub use apiclient::MockClient;
pub use app::{MockServer, State};
pub use config::Config;

/// Broadcast events observed by every component holding a subscription.
/// Instance-scoped; each server carries its own bus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerEvent {
	Started,
	Reset,
	Stop,
}

#[derive(Clone)]
pub struct EventBus {
	tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
	pub fn new() -> EventBus {
		let (tx, _) = broadcast::channel(16);
		EventBus { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
		self.tx.subscribe()
	}

	pub fn publish(&self, event: ServerEvent) {
		let _ = self.tx.send(event);
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

/// The set of ports currently serving traffic. Grows when `/bind` adds
/// listeners at runtime.
#[derive(Clone, Default)]
pub struct PortSet {
	inner: Arc<Mutex<Vec<u16>>>,
}

impl PortSet {
	pub fn all(&self) -> Vec<u16> {
		self.inner.lock().expect("mutex acquired").clone()
	}

	pub fn first(&self) -> Option<u16> {
		self.inner.lock().expect("mutex acquired").first().copied()
	}

	pub fn add(&self, port: u16) {
		let mut ports = self.inner.lock().expect("mutex acquired");
		if !ports.contains(&port) {
			ports.push(port);
		}
	}

	/// True when a forward target loops back into this server.
	pub fn is_self_target(&self, target: &types::ForwardTarget) -> bool {
		let local = match target.host.as_str() {
			"localhost" => true,
			host => host
				.parse::<IpAddr>()
				.is_ok_and(|ip| ip.is_loopback() || ip.is_unspecified()),
		};
		local
			&& self
				.inner
				.lock()
				.expect("mutex acquired")
				.contains(&target.port)
	}
}

/// A runtime request to bind additional ports, served by the lifecycle task.
pub(crate) struct BindRequest {
	pub ports: Vec<u16>,
	pub reply: oneshot::Sender<Result<Vec<u16>, listener::PortBindError>>,
}

/// Shared handles every request touches.
pub struct ServerInputs {
	pub cfg: Arc<Config>,
	pub store: store::ExpectationStore,
	pub journal: journal::Journal,
	pub callbacks: callback::CallbackRegistry,
	pub local_callbacks: callback::local::LocalCallbacks,
	pub scheduler: scheduler::Scheduler,
	pub upstream: client::Upstream,
	pub ports: PortSet,
	pub events: EventBus,
	pub stop: signal::StopTrigger,
	pub(crate) binds: mpsc::Sender<BindRequest>,
}

impl ServerInputs {
	/// Clears the expectation store, the journal, and every callback
	/// registration. Ports stay bound. In-flight requests holding an old
	/// snapshot complete without touching post-reset state.
	pub fn reset(&self) {
		self.store.reset();
		self.journal.clear(None);
		self.callbacks.close_all();
		self.events.publish(ServerEvent::Reset);
		info!("server state reset");
	}

	/// Binds additional ports on the running server, returning the resulting
	/// bound set.
	pub async fn bind_additional(&self, ports: Vec<u16>) -> anyhow::Result<Vec<u16>> {
		let (reply, result) = oneshot::channel();
		self
			.binds
			.send(BindRequest { ports, reply })
			.await
			.map_err(|_| anyhow::anyhow!("server is shutting down"))?;
		result
			.await
			.map_err(|_| anyhow::anyhow!("server is shutting down"))?
			.map_err(Into::into)
	}
}
