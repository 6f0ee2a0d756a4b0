use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mockgate::types::ExpectationDefinition;
use mockgate::{Config, MockClient, MockServer};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn test_config() -> Config {
	let mut cfg = Config::default();
	cfg.listen_ip = LOCALHOST;
	cfg.ports = vec![0];
	cfg.callback_response_timeout = Duration::from_secs(2);
	cfg.termination_deadline = Duration::from_secs(5);
	cfg
}

pub async fn start_server() -> (MockServer, MockClient, u16) {
	mockgate_core::telemetry::testing::setup_test_logging();
	let server = MockServer::start(Arc::new(test_config()))
		.await
		.expect("server starts");
	let port = server.local_port().expect("bound port");
	let client = server.client().expect("client");
	(server, client, port)
}

pub fn expectation(v: serde_json::Value) -> ExpectationDefinition {
	serde_json::from_value(v).expect("valid expectation")
}

pub fn url(port: u16, path: &str) -> String {
	format!("http://127.0.0.1:{port}{path}")
}

/// Opens a callback channel and spawns a client that answers every incoming
/// `request` frame with the given response payload. Returns the assigned
/// client id.
pub async fn open_answering_channel(port: u16, payload: serde_json::Value) -> String {
	open_channel(port, move |_| payload.clone()).await
}

/// As above, but the client derives each payload from the request it was
/// asked about, so a response body proves which exchange it was meant for.
pub async fn open_echoing_channel(port: u16) -> String {
	open_channel(port, |frame| {
		let path = frame["request"]["path"].as_str().unwrap_or_default();
		serde_json::json!({ "status": 200, "body": { "text": format!("echo {path}") } })
	})
	.await
}

async fn open_channel<F>(port: u16, respond: F) -> String
where
	F: Fn(&serde_json::Value) -> serde_json::Value + Send + 'static,
{
	let request = format!("ws://127.0.0.1:{port}/_mockserver_callback_websocket")
		.into_client_request()
		.expect("valid ws request");
	let (mut stream, response) = tokio_tungstenite::connect_async(request)
		.await
		.expect("ws handshake");
	let client_id = response
		.headers()
		.get("x-client-registration-id")
		.expect("registration id header")
		.to_str()
		.expect("utf8 header")
		.to_string();
	tokio::spawn(async move {
		while let Some(Ok(msg)) = stream.next().await {
			if let Message::Text(text) = msg {
				let frame: serde_json::Value = serde_json::from_str(text.as_str()).expect("json frame");
				let reply = serde_json::json!({
					"type": "response",
					"correlation_id": frame["correlation_id"],
					"payload": respond(&frame),
				});
				if stream.send(Message::Text(reply.to_string().into())).await.is_err() {
					break;
				}
			}
		}
	});
	client_id
}
