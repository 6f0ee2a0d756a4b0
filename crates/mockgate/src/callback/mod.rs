//! Persistent bidirectional callback channels.
//!
//! Remote callback clients hold a WebSocket open against the callback path;
//! the dispatcher ships matched requests over the channel tagged with a
//! correlation id and waits on a one-shot sink for the client's reply.

mod channel;
pub mod local;

use std::collections::HashMap;

pub use channel::{handle_upgrade, is_websocket_upgrade};
use mockgate_core::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::types::{RequestFingerprint, ResponseDefinition};

/// Reserved path remote callback clients upgrade on.
pub const CALLBACK_PATH: &str = "/_mockserver_callback_websocket";
/// Carried on the 101 response so the client learns its registration id.
pub const CLIENT_REGISTRATION_ID_HEADER: &str = "x-client-registration-id";

/// Server-to-client frames. Text frames, UTF-8 JSON.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	Request {
		correlation_id: Strng,
		request: RequestFingerprint,
	},
	ForwardRequest {
		correlation_id: Strng,
		request: RequestFingerprint,
	},
}

impl ServerFrame {
	pub fn correlation_id(&self) -> &Strng {
		match self {
			ServerFrame::Request { correlation_id, .. } => correlation_id,
			ServerFrame::ForwardRequest { correlation_id, .. } => correlation_id,
		}
	}
}

/// Client-to-server frames.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	Response {
		correlation_id: Strng,
		payload: ResponseDefinition,
	},
	ForwardRequest {
		correlation_id: Strng,
		payload: RequestFingerprint,
	},
	Error {
		correlation_id: Strng,
		#[serde(default)]
		payload: Option<String>,
	},
}

/// What the client answered with.
#[derive(Debug)]
pub enum ClientReply {
	Response(ResponseDefinition),
	ForwardRequest(RequestFingerprint),
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum CallbackFailure {
	#[error("callback client {0} is not registered or its send queue is full")]
	Unavailable(Strng),
	#[error("callback response timed out")]
	Timeout,
	#[error("callback channel closed while a request was pending")]
	ChannelClosed,
	#[error("callback client reported an error: {0}")]
	ClientError(String),
}

pub type CallbackResult = Result<ClientReply, CallbackFailure>;

pub enum CallbackKind {
	Response,
	Forward,
}

pub(crate) enum Outgoing {
	Frame(ServerFrame),
	Close,
}

/// One live registration: the channel's bounded send queue plus the pending
/// correlation map.
pub struct ChannelHandle {
	pub client_id: Strng,
	pub created_at: Instant,
	tx: mpsc::Sender<Outgoing>,
	pending: Mutex<HashMap<Strng, oneshot::Sender<CallbackResult>>>,
}

impl ChannelHandle {
	fn complete(&self, correlation_id: &str, result: CallbackResult) {
		let sink = self
			.pending
			.lock()
			.expect("mutex acquired")
			.remove(correlation_id);
		match sink {
			Some(sink) => {
				let _ = sink.send(result);
			},
			None => debug!(correlation_id, "no pending sink for callback reply"),
		}
	}

	fn fail_all(&self, failure: CallbackFailure) {
		let pending: Vec<_> = {
			let mut map = self.pending.lock().expect("mutex acquired");
			map.drain().collect()
		};
		for (_, sink) in pending {
			let _ = sink.send(Err(failure.clone()));
		}
	}
}

#[derive(Clone)]
pub struct CallbackRegistry {
	inner: Arc<RegistryInner>,
}

struct RegistryInner {
	channels: Mutex<HashMap<Strng, Arc<ChannelHandle>>>,
	queue_capacity: usize,
	response_timeout: Duration,
}

impl CallbackRegistry {
	pub fn new(queue_capacity: usize, response_timeout: Duration) -> CallbackRegistry {
		CallbackRegistry {
			inner: Arc::new(RegistryInner {
				channels: Mutex::new(HashMap::new()),
				queue_capacity,
				response_timeout,
			}),
		}
	}

	/// Creates a registration with a fresh client id. The returned receiver
	/// feeds the channel's write half.
	pub(crate) fn register(&self) -> (Arc<ChannelHandle>, mpsc::Receiver<Outgoing>) {
		let client_id: Strng = uuid::Uuid::new_v4().to_string().into();
		let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
		let handle = Arc::new(ChannelHandle {
			client_id: client_id.clone(),
			created_at: Instant::now(),
			tx,
			pending: Mutex::new(HashMap::new()),
		});
		self
			.inner
			.channels
			.lock()
			.expect("mutex acquired")
			.insert(client_id.clone(), handle.clone());
		debug!(client_id = client_id.as_str(), "callback channel registered");
		(handle, rx)
	}

	/// Tears down one registration; every pending sink observes the closure.
	pub(crate) fn deregister(&self, client_id: &Strng) {
		let handle = self
			.inner
			.channels
			.lock()
			.expect("mutex acquired")
			.remove(client_id);
		if let Some(handle) = handle {
			handle.fail_all(CallbackFailure::ChannelClosed);
			debug!(client_id = client_id.as_str(), "callback channel deregistered");
		}
	}

	/// Closes every channel; used on reset and stop broadcasts.
	pub fn close_all(&self) {
		let handles: Vec<_> = {
			let mut map = self.inner.channels.lock().expect("mutex acquired");
			map.drain().map(|(_, h)| h).collect()
		};
		for handle in handles {
			let _ = handle.tx.try_send(Outgoing::Close);
			handle.fail_all(CallbackFailure::ChannelClosed);
		}
	}

	pub fn len(&self) -> usize {
		self.inner.channels.lock().expect("mutex acquired").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Ships `request` to the client and waits for the correlated reply, up
	/// to the configured callback timeout. A missing registration or a full
	/// send queue both surface as unavailability.
	pub async fn dispatch(
		&self,
		client_id: &Strng,
		kind: CallbackKind,
		request: RequestFingerprint,
	) -> CallbackResult {
		let handle = {
			let map = self.inner.channels.lock().expect("mutex acquired");
			map.get(client_id).cloned()
		};
		let Some(handle) = handle else {
			return Err(CallbackFailure::Unavailable(client_id.clone()));
		};

		let correlation_id: Strng = uuid::Uuid::new_v4().to_string().into();
		let (sink, result) = oneshot::channel();
		handle
			.pending
			.lock()
			.expect("mutex acquired")
			.insert(correlation_id.clone(), sink);
		// The guard frees the sink on every exit from this function, including
		// cancellation when the action deadline drops this future mid-wait.
		let _guard = PendingGuard {
			handle: handle.clone(),
			correlation_id: correlation_id.clone(),
		};

		let frame = match kind {
			CallbackKind::Response => ServerFrame::Request {
				correlation_id: correlation_id.clone(),
				request,
			},
			CallbackKind::Forward => ServerFrame::ForwardRequest {
				correlation_id,
				request,
			},
		};
		if handle.tx.try_send(Outgoing::Frame(frame)).is_err() {
			warn!(client_id = client_id.as_str(), "callback send queue full or closed");
			return Err(CallbackFailure::Unavailable(client_id.clone()));
		}

		match tokio::time::timeout(self.inner.response_timeout, result).await {
			Ok(Ok(reply)) => reply,
			Ok(Err(_)) => Err(CallbackFailure::ChannelClosed),
			Err(_) => Err(CallbackFailure::Timeout),
		}
	}
}

/// Removes a pending sink when the dispatch future exits by any path: reply
/// delivered, timeout, unavailability, or cancellation. A reply that already
/// consumed the sink makes the removal a no-op.
struct PendingGuard {
	handle: Arc<ChannelHandle>,
	correlation_id: Strng,
}

impl Drop for PendingGuard {
	fn drop(&mut self) {
		if let Ok(mut pending) = self.handle.pending.lock() {
			pending.remove(self.correlation_id.as_str());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn missing_client_is_unavailable() {
		let registry = CallbackRegistry::new(4, Duration::from_secs(1));
		let res = registry
			.dispatch(&"nope".into(), CallbackKind::Response, Default::default())
			.await;
		assert!(matches!(res, Err(CallbackFailure::Unavailable(_))));
	}

	#[tokio::test]
	async fn reply_routes_to_the_pending_dispatch() {
		let registry = CallbackRegistry::new(4, Duration::from_secs(5));
		let (handle, mut rx) = registry.register();
		let id = handle.client_id.clone();
		let reg = registry.clone();
		let answer = tokio::spawn(async move {
			let Some(Outgoing::Frame(frame)) = rx.recv().await else {
				panic!("expected a frame")
			};
			let corr = frame.correlation_id().clone();
			let map = reg.inner.channels.lock().expect("mutex acquired");
			map[&id].complete(
				&corr,
				Ok(ClientReply::Response(ResponseDefinition {
					status: 201,
					..Default::default()
				})),
			);
		});
		let res = registry
			.dispatch(&handle.client_id, CallbackKind::Response, Default::default())
			.await;
		answer.await.unwrap();
		match res {
			Ok(ClientReply::Response(r)) => assert_eq!(r.status, 201),
			other => panic!("unexpected result: {other:?}"),
		}
	}

	#[tokio::test]
	async fn cancelled_dispatch_frees_its_sink() {
		let registry = CallbackRegistry::new(4, Duration::from_secs(30));
		let (handle, _rx) = registry.register();
		let client_id = handle.client_id.clone();
		// An action deadline cancels a dispatch by dropping its future; the
		// pending sink must not leak.
		let cancelled = tokio::time::timeout(
			Duration::from_millis(50),
			registry.dispatch(&client_id, CallbackKind::Response, Default::default()),
		)
		.await;
		assert!(cancelled.is_err());
		assert!(handle.pending.lock().expect("mutex acquired").is_empty());
	}

	#[tokio::test]
	async fn close_all_fails_pending_sinks() {
		let registry = CallbackRegistry::new(4, Duration::from_secs(30));
		let (handle, _rx) = registry.register();
		let client_id = handle.client_id.clone();
		let reg = registry.clone();
		let dispatch =
			tokio::spawn(async move { reg.dispatch(&client_id, CallbackKind::Response, Default::default()).await });
		tokio::time::sleep(Duration::from_millis(50)).await;
		registry.close_all();
		let res = dispatch.await.unwrap();
		assert!(matches!(res, Err(CallbackFailure::ChannelClosed)));
		assert!(registry.is_empty());
	}
}
