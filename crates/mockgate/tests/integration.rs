use std::sync::Arc;
use std::time::{Duration, Instant};

use mockgate::MockServer;
use mockgate::journal::RetrieveType;
use mockgate::types::{RecordedBody, ResponseDefinition, VerifyTimes};
use serde_json::json;
use wiremock::{Mock, MockServer as UpstreamServer, ResponseTemplate};

mod common;
use common::*;

#[tokio::test]
async fn literal_respond_and_verify() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[expectation(json!({
			"request": { "method": { "exact": "GET" }, "path": "/hello" },
			"respond": { "status": 200, "body": { "text": "hi" } },
		}))])
		.await
		.unwrap();

	let resp = reqwest::get(url(port, "/hello")).await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "hi");

	client
		.verify(
			&serde_json::from_value(json!({"path": "/hello"})).unwrap(),
			VerifyTimes::exactly(1),
		)
		.await
		.unwrap();
	server.stop().await;
}

#[tokio::test]
async fn bounded_uses_retire_the_expectation() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[expectation(json!({
			"request": { "path": "/hello" },
			"respond": { "status": 200, "body": { "text": "hi" } },
			"times": { "limited": 1 },
		}))])
		.await
		.unwrap();

	assert_eq!(reqwest::get(url(port, "/hello")).await.unwrap().status(), 200);
	assert_eq!(reqwest::get(url(port, "/hello")).await.unwrap().status(), 404);

	let log = client.retrieve(RetrieveType::RequestResponses, None).await.unwrap();
	assert_eq!(log.as_array().unwrap().len(), 2);
	server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bounded_uses_hold_under_concurrency() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[expectation(json!({
			"request": { "path": "/once" },
			"respond": { "status": 200 },
			"times": { "limited": 1 },
		}))])
		.await
		.unwrap();

	let http = reqwest::Client::new();
	let results = futures_util::future::join_all((0..8).map(|_| {
		let http = http.clone();
		let url = url(port, "/once");
		async move { http.get(url).send().await.unwrap().status().as_u16() }
	}))
	.await;
	let ok = results.iter().filter(|s| **s == 200).count();
	let misses = results.iter().filter(|s| **s == 404).count();
	assert_eq!(ok, 1, "exactly one request wins the bounded use");
	assert_eq!(misses, 7);
	server.stop().await;
}

#[tokio::test]
async fn forward_records_the_upstream_pair() {
	let (server, client, port) = start_server().await;
	let upstream = UpstreamServer::start().await;
	Mock::given(wiremock::matchers::method("GET"))
		.and(wiremock::matchers::path("/u"))
		.respond_with(ResponseTemplate::new(200).set_body_string("U"))
		.mount(&upstream)
		.await;

	client
		.expect(&[expectation(json!({
			"request": { "path": "/u" },
			"forward": { "host": "127.0.0.1", "port": upstream.address().port() },
		}))])
		.await
		.unwrap();

	let resp = reqwest::get(url(port, "/u")).await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "U");

	let log = client.retrieve(RetrieveType::RequestResponses, None).await.unwrap();
	let entries = log.as_array().unwrap();
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0]["forwardedResponse"]["status"], 200);
	server.stop().await;
}

#[tokio::test]
async fn override_forward_overlays_the_request() {
	let (server, client, port) = start_server().await;
	let upstream = UpstreamServer::start().await;
	Mock::given(wiremock::matchers::path("/rewritten"))
		.and(wiremock::matchers::header("x-extra", "yes"))
		.respond_with(ResponseTemplate::new(201))
		.mount(&upstream)
		.await;

	client
		.expect(&[expectation(json!({
			"request": { "path": "/o" },
			"overrideForward": {
				"target": { "host": "127.0.0.1", "port": upstream.address().port() },
				"overrides": {
					"path": "/rewritten",
					"headers": [{ "name": "x-extra", "values": ["yes"] }],
				},
			},
		}))])
		.await
		.unwrap();

	assert_eq!(reqwest::get(url(port, "/o")).await.unwrap().status(), 201);
	server.stop().await;
}

#[tokio::test]
async fn object_callback_round_trip() {
	let (server, client, port) = start_server().await;
	let client_id =
		open_answering_channel(port, json!({ "status": 201, "body": { "text": "ok" } })).await;

	client
		.expect(&[expectation(json!({
			"request": { "path": "/cb" },
			"remoteCallback": { "clientId": client_id },
		}))])
		.await
		.unwrap();

	let start = Instant::now();
	let resp = reqwest::get(url(port, "/cb")).await.unwrap();
	assert_eq!(resp.status(), 201);
	assert_eq!(resp.text().await.unwrap(), "ok");
	assert!(start.elapsed() < Duration::from_secs(2));
	server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callbacks_correlate_to_their_requests() {
	let (server, client, port) = start_server().await;
	let client_id = open_echoing_channel(port).await;
	client
		.expect(&[expectation(json!({
			"request": { "path": "/cb/{n}" },
			"remoteCallback": { "clientId": client_id },
		}))])
		.await
		.unwrap();

	let http = reqwest::Client::new();
	let bodies = futures_util::future::join_all((0..6).map(|i| {
		let http = http.clone();
		let url = url(port, &format!("/cb/{i}"));
		async move {
			let resp = http.get(url).send().await.unwrap();
			assert_eq!(resp.status(), 200);
			resp.text().await.unwrap()
		}
	}))
	.await;
	for (i, body) in bodies.iter().enumerate() {
		assert_eq!(
			body,
			&format!("echo /cb/{i}"),
			"reply was routed to the wrong exchange",
		);
	}
	server.stop().await;
}

#[tokio::test]
async fn missing_callback_client_is_404() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[expectation(json!({
			"request": { "path": "/cb" },
			"remoteCallback": { "clientId": "never-registered" },
		}))])
		.await
		.unwrap();
	assert_eq!(reqwest::get(url(port, "/cb")).await.unwrap().status(), 404);
	server.stop().await;
}

#[tokio::test]
async fn no_match_is_recorded_with_null_expectation() {
	let (server, client, port) = start_server().await;
	assert_eq!(reqwest::get(url(port, "/anything")).await.unwrap().status(), 404);

	let log = client.retrieve(RetrieveType::RequestResponses, None).await.unwrap();
	let entries = log.as_array().unwrap();
	assert_eq!(entries.len(), 1);
	assert!(entries[0].get("expectationId").is_none());

	client
		.verify(
			&serde_json::from_value(json!({"path": "/anything"})).unwrap(),
			VerifyTimes::exactly(1),
		)
		.await
		.unwrap();
	server.stop().await;
}

#[tokio::test]
async fn stopped_client_reports_the_exact_error() {
	let (server, client, _port) = start_server().await;
	client.stop().await.unwrap();
	server.stop().await;

	let err = client.reset().await.unwrap_err();
	assert_eq!(err.to_string(), "Request sent after client has been stopped");
}

#[tokio::test]
async fn reset_clears_everything_and_is_idempotent() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[expectation(json!({
			"request": { "path": "/r" },
			"respond": { "status": 200 },
		}))])
		.await
		.unwrap();
	reqwest::get(url(port, "/r")).await.unwrap();

	client.reset().await.unwrap();
	let log = client.retrieve(RetrieveType::Requests, None).await.unwrap();
	assert_eq!(log.as_array().unwrap().len(), 0);
	assert_eq!(reqwest::get(url(port, "/r")).await.unwrap().status(), 404);

	// Second reset is a no-op.
	client.reset().await.unwrap();
	server.stop().await;
}

#[tokio::test]
async fn stop_releases_the_port() {
	let (server, _client, port) = start_server().await;
	server.stop().await;
	assert!(!server.is_running());
	// The port must be immediately bindable again.
	let rebound = std::net::TcpListener::bind(("127.0.0.1", port));
	assert!(rebound.is_ok(), "port {port} still held after stop");
}

#[tokio::test]
async fn runtime_bind_adds_a_serving_port() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[expectation(json!({
			"request": { "path": "/everywhere" },
			"respond": { "status": 200 },
		}))])
		.await
		.unwrap();

	let ports = client.bind(&[0]).await.unwrap();
	assert_eq!(ports.len(), 2);
	let new_port = *ports.iter().find(|p| **p != port).unwrap();
	assert_eq!(
		reqwest::get(url(new_port, "/everywhere")).await.unwrap().status(),
		200,
	);
	assert_eq!(client.status().await.unwrap().len(), 2);
	server.stop().await;
}

#[tokio::test]
async fn error_action_drops_the_connection() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[expectation(json!({
			"request": { "path": "/dead" },
			"error": { "dropConnection": true },
		}))])
		.await
		.unwrap();
	let result = reqwest::get(url(port, "/dead")).await;
	assert!(result.is_err(), "connection should close without a response");
	server.stop().await;
}

#[tokio::test]
async fn local_callback_answers_in_process() {
	let (server, client, port) = start_server().await;
	server.local_callbacks().register_response("precanned", || {
		let callback: Box<dyn mockgate::callback::local::ResponseCallback> =
			Box::new(|req: &mockgate::types::RequestFingerprint| ResponseDefinition {
				status: 207,
				body: Some(RecordedBody::Text(format!("saw {}", req.path))),
				..Default::default()
			});
		Ok(callback)
	});

	client
		.expect(&[expectation(json!({
			"request": { "path": "/local" },
			"localCallback": { "name": "precanned" },
		}))])
		.await
		.unwrap();
	let resp = reqwest::get(url(port, "/local")).await.unwrap();
	assert_eq!(resp.status(), 207);
	assert_eq!(resp.text().await.unwrap(), "saw /local");

	// Unregistered names load-fail into a 404.
	client
		.expect(&[expectation(json!({
			"request": { "path": "/ghost" },
			"localCallback": { "name": "ghost" },
		}))])
		.await
		.unwrap();
	assert_eq!(reqwest::get(url(port, "/ghost")).await.unwrap().status(), 404);
	server.stop().await;
}

#[tokio::test]
async fn verify_sequence_respects_order() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[expectation(json!({
			"request": {},
			"respond": { "status": 200 },
		}))])
		.await
		.unwrap();
	reqwest::get(url(port, "/first")).await.unwrap();
	reqwest::get(url(port, "/noise")).await.unwrap();
	reqwest::get(url(port, "/second")).await.unwrap();

	let first: mockgate::types::RequestMatcher =
		serde_json::from_value(json!({"path": "/first"})).unwrap();
	let second: mockgate::types::RequestMatcher =
		serde_json::from_value(json!({"path": "/second"})).unwrap();
	client.verify_sequence(&[first, second]).await.unwrap();

	let backwards: [mockgate::types::RequestMatcher; 2] = [
		serde_json::from_value(json!({"path": "/second"})).unwrap(),
		serde_json::from_value(json!({"path": "/first"})).unwrap(),
	];
	assert!(client.verify_sequence(&backwards).await.is_err());
	server.stop().await;
}

#[tokio::test]
async fn response_delay_is_applied() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[expectation(json!({
			"request": { "path": "/slow" },
			"respond": { "status": 200, "delay": { "duration": "200ms" } },
		}))])
		.await
		.unwrap();
	let start = Instant::now();
	assert_eq!(reqwest::get(url(port, "/slow")).await.unwrap().status(), 200);
	assert!(start.elapsed() >= Duration::from_millis(200));
	server.stop().await;
}

#[tokio::test]
async fn websocket_upgrade_off_the_callback_path_is_501() {
	use tokio_tungstenite::tungstenite::client::IntoClientRequest;
	let (server, _client, port) = start_server().await;
	let request = format!("ws://127.0.0.1:{port}/not-the-callback-path")
		.into_client_request()
		.unwrap();
	let result = tokio_tungstenite::connect_async(request).await;
	assert!(result.is_err(), "handshake must be refused");
	server.stop().await;
}

#[tokio::test]
async fn matching_repeats_deterministically() {
	let (server, client, port) = start_server().await;
	client
		.expect(&[
			expectation(json!({
				"request": { "path": "/d/{rest}" },
				"respond": { "status": 200, "body": { "text": "first" } },
			})),
			expectation(json!({
				"request": { "path": "/d/.*" },
				"respond": { "status": 200, "body": { "text": "second" } },
			})),
		])
		.await
		.unwrap();
	for _ in 0..5 {
		let resp = reqwest::get(url(port, "/d/x")).await.unwrap();
		assert_eq!(resp.text().await.unwrap(), "first", "insertion order wins, every time");
	}
	server.stop().await;
}

#[tokio::test]
async fn starting_on_a_taken_port_names_the_port() {
	mockgate_core::telemetry::testing::setup_test_logging();
	let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let taken = holder.local_addr().unwrap().port();
	let mut cfg = test_config();
	cfg.ports = vec![taken];
	let err = MockServer::start(Arc::new(cfg)).await.unwrap_err();
	assert!(err.to_string().contains(&taken.to_string()));
}
