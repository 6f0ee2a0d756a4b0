//! WebSocket half of the callback channel: the V13 handshake on the callback
//! path and the per-connection read/write loop.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use mockgate_core::prelude::*;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, warn};

use super::{CallbackRegistry, ChannelHandle, ClientFrame, ClientReply, CallbackFailure, Outgoing};
use crate::http;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// True when the request carries a WebSocket V13 handshake.
pub fn is_websocket_upgrade(req: &http::Request) -> bool {
	let headers = req.headers();
	headers
		.get(http::header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
		&& headers.contains_key(http::header::SEC_WEBSOCKET_KEY)
}

fn accept_key(sec_key: &str) -> String {
	let mut sha = Sha1::new();
	sha.update(sec_key.as_bytes());
	sha.update(WEBSOCKET_GUID.as_bytes());
	STANDARD.encode(sha.finalize())
}

/// Performs the handshake, registers the channel, and spawns its IO loop.
/// The 101 response carries the assigned registration id.
pub fn handle_upgrade(registry: &CallbackRegistry, mut req: http::Request) -> http::Response {
	let Some(sec_key) = req
		.headers()
		.get(http::header::SEC_WEBSOCKET_KEY)
		.and_then(|v| v.to_str().ok())
		.map(str::to_owned)
	else {
		return http::plaintext_response(
			http::StatusCode::BAD_REQUEST,
			"missing Sec-WebSocket-Key".to_string(),
		);
	};
	if req.extensions().get::<OnUpgrade>().is_none() {
		return http::plaintext_response(
			http::StatusCode::BAD_REQUEST,
			"connection is not upgradeable".to_string(),
		);
	}

	let (handle, rx) = registry.register();
	let client_id = handle.client_id.clone();
	let registration_id = client_id.clone();
	let on_upgrade = hyper::upgrade::on(&mut req);
	let registry = registry.clone();
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
				run_channel(&registry, handle, rx, ws).await;
			},
			Err(e) => {
				warn!(client_id = client_id.as_str(), err = %e, "callback upgrade failed");
				registry.deregister(&client_id);
			},
		}
	});

	::http::Response::builder()
		.status(http::StatusCode::SWITCHING_PROTOCOLS)
		.header(http::header::UPGRADE, "websocket")
		.header(http::header::CONNECTION, "Upgrade")
		.header(http::header::SEC_WEBSOCKET_ACCEPT, accept_key(&sec_key))
		.header(super::CLIENT_REGISTRATION_ID_HEADER, registration_id.as_str())
		.body(http::Body::empty())
		.expect("builder with known status code should not fail")
}

/// Pumps frames until either side closes. Incoming text frames resolve
/// pending correlations; Pings are answered by the protocol layer; a Close
/// frame or transport error tears the registration down.
async fn run_channel<S>(
	registry: &CallbackRegistry,
	handle: Arc<ChannelHandle>,
	mut rx: mpsc::Receiver<Outgoing>,
	mut ws: WebSocketStream<S>,
) where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let client_id = handle.client_id.clone();
	debug!(client_id = client_id.as_str(), "callback channel open");
	loop {
		tokio::select! {
			outgoing = rx.recv() => {
				match outgoing {
					Some(Outgoing::Frame(frame)) => {
						let text = match serde_json::to_string(&frame) {
							Ok(t) => t,
							Err(e) => {
								warn!(client_id = client_id.as_str(), err = %e, "failed to encode callback frame");
								handle.complete(frame.correlation_id(), Err(CallbackFailure::ChannelClosed));
								continue;
							},
						};
						if ws.send(Message::Text(text.into())).await.is_err() {
							break;
						}
					},
					Some(Outgoing::Close) => {
						let _ = ws.send(Message::Close(None)).await;
						break;
					},
					// Registry dropped the sender; shut down.
					None => break,
				}
			},
			incoming = ws.next() => {
				match incoming {
					Some(Ok(Message::Text(text))) => handle_client_frame(&handle, text.as_str()),
					// tungstenite answers Pings during read; nothing to do.
					Some(Ok(Message::Ping(_) | Message::Pong(_))) => {},
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => debug!(client_id = client_id.as_str(), "ignoring non-text frame"),
					Some(Err(e)) => {
						debug!(client_id = client_id.as_str(), err = %e, "callback channel error");
						break;
					},
				}
			},
		}
	}
	registry.deregister(&client_id);
	debug!(client_id = client_id.as_str(), "callback channel closed");
}

fn handle_client_frame(handle: &ChannelHandle, text: &str) {
	let frame: ClientFrame = match serde_json::from_str(text) {
		Ok(f) => f,
		Err(e) => {
			warn!(err = %e, "discarding malformed callback frame");
			return;
		},
	};
	match frame {
		ClientFrame::Response {
			correlation_id,
			payload,
		} => handle.complete(&correlation_id, Ok(ClientReply::Response(payload))),
		ClientFrame::ForwardRequest {
			correlation_id,
			payload,
		} => handle.complete(&correlation_id, Ok(ClientReply::ForwardRequest(payload))),
		ClientFrame::Error {
			correlation_id,
			payload,
		} => handle.complete(
			&correlation_id,
			Err(CallbackFailure::ClientError(
				payload.unwrap_or_else(|| "unspecified".to_string()),
			)),
		),
	}
}
