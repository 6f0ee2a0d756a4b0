//! Port binding, the per-connection HTTP pipeline, and request
//! classification.
//!
//! Per connection: bytes -> HTTP/1.1 codec -> classifier. Management paths go
//! to the management dispatcher, a WebSocket handshake on the callback path
//! upgrades into a callback channel, everything else is mock dispatch.
//! HTTP/1.1 keeps responses in request order on a connection.

use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use mockgate_core::drain::DrainWatcher;
use mockgate_core::prelude::*;
use tokio::net::{TcpListener, TcpStream};
use futures_util::StreamExt;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{debug, info, warn};

use crate::dispatch::MockError;
use crate::{ServerInputs, callback, dispatch, http, management};

#[derive(thiserror::Error, Debug)]
#[error("failed to bind port {port}: {source}")]
pub struct PortBindError {
	pub port: u16,
	#[source]
	pub source: std::io::Error,
}

/// Binds the requested ports in order. Port 0 asks the OS for an ephemeral
/// port; the actually bound port is reported by the returned listener.
pub async fn bind_ports(ip: IpAddr, requested: &[u16]) -> Result<Vec<TcpListener>, PortBindError> {
	let mut bound = Vec::with_capacity(requested.len());
	for &port in requested {
		let listener = TcpListener::bind(SocketAddr::new(ip, port))
			.await
			.map_err(|source| PortBindError { port, source })?;
		bound.push(listener);
	}
	Ok(bound)
}

fn http1_server() -> http1::Builder {
	let mut b = http1::Builder::new();
	b.timer(TokioTimer::new());
	b
}

/// Runs the accept loop for one bound port. The loop stops accepting the
/// moment a drain starts; open connections finish under their own drain
/// watchers. Dropping the listener releases the port.
pub(crate) fn spawn_listener(inputs: Arc<ServerInputs>, drain: DrainWatcher, listener: TcpListener) {
	let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
	tokio::spawn(async move {
		info!(port, "listener established");
		let stream = TcpListenerStream::new(listener);
		let mut stream = stream.take_until(Box::pin(drain.clone().wait_for_drain()));
		while let Some(Ok(socket)) = stream.next().await {
			let _ = socket.set_nodelay(true);
			let inputs = inputs.clone();
			let drain = drain.clone();
			tokio::spawn(serve_connection(inputs, drain, socket));
		}
		info!(port, "listener drained");
	});
}

async fn serve_connection(inputs: Arc<ServerInputs>, drain: DrainWatcher, socket: TcpStream) {
	let peer = socket.peer_addr().ok();
	debug!(?peer, "connection started");
	let service = hyper::service::service_fn(move |req| {
		let inputs = inputs.clone();
		async move { route(inputs, req).await }
	});
	let conn = http1_server()
		.serve_connection(TokioIo::new(socket), service)
		.with_upgrades();
	tokio::pin!(conn);
	tokio::select! {
		res = conn.as_mut() => {
			if let Err(e) = res {
				// Error actions abort connections on purpose; keep that quiet.
				debug!(?peer, err = %e, "connection closed");
			}
		},
		shutdown = drain.wait_for_drain() => {
			conn.as_mut().graceful_shutdown();
			let _ = conn.as_mut().await;
			drop(shutdown);
		},
	}
	debug!(?peer, "connection completed");
}

/// First match wins: management paths, then the callback upgrade, then mock
/// dispatch. A WebSocket handshake anywhere but the callback path is not
/// supported.
async fn route(
	inputs: Arc<ServerInputs>,
	req: hyper::Request<hyper::body::Incoming>,
) -> Result<http::Response, MockError> {
	let req = req.map(http::Body::new);
	let path = req.uri().path();
	if management::is_management_path(path) {
		return Ok(management::handle(&inputs, req).await);
	}
	if callback::is_websocket_upgrade(&req) {
		if path == callback::CALLBACK_PATH {
			return Ok(callback::handle_upgrade(&inputs.callbacks, req));
		}
		warn!(path, "websocket handshake on an unsupported path");
		return Ok(http::plaintext_response(
			http::StatusCode::NOT_IMPLEMENTED,
			format!("websocket upgrades are only supported on {}", callback::CALLBACK_PATH),
		));
	}
	dispatch::handle_mock(&inputs, req).await
}
