//! Management API: expectation registration, retrieval, verification, and
//! lifecycle controls. Served on the same ports as mock traffic; the
//! classifier routes reserved paths here.

use mockgate_core::prelude::*;
use mockgate_core::telemetry;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::journal::{RetrieveType, Retrieved};
use crate::store::StoreError;
use crate::types::{ExpectationDefinition, RequestMatcher, VerifyTimes};
use crate::{ServerInputs, http};

const MANAGEMENT_PREFIX: &str = "/mockserver";
const MAX_MANAGEMENT_BODY: usize = 4_194_304;

/// Operations reachable over the management API. Paths are accepted with the
/// `/mockserver` prefix (preferred) or bare for backward compatibility.
const OPERATIONS: &[&str] = &[
	"/expectation",
	"/clear",
	"/reset",
	"/retrieve",
	"/verify",
	"/verifySequence",
	"/status",
	"/bind",
	"/stop",
	"/logging",
];

/// True when the classifier should hand this path to the management
/// dispatcher.
pub fn is_management_path(path: &str) -> bool {
	normalized(path).is_some()
}

fn normalized(path: &str) -> Option<&str> {
	let bare = path.strip_prefix(MANAGEMENT_PREFIX).unwrap_or(path);
	OPERATIONS.contains(&bare).then_some(bare)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearBody {
	#[serde(default)]
	request: Option<RequestMatcher>,
	#[serde(default, rename = "type")]
	scope: ClearScope,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ClearScope {
	#[default]
	All,
	Log,
	Expectations,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody {
	request: RequestMatcher,
	#[serde(default)]
	times: VerifyTimes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifySequenceBody {
	requests: Vec<RequestMatcher>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindBody {
	ports: Vec<u16>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
	ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoggingBody {
	level: String,
}

pub async fn handle(inputs: &Arc<ServerInputs>, req: http::Request) -> http::Response {
	let Some(op) = normalized(req.uri().path()) else {
		return http::empty_response(http::StatusCode::NOT_FOUND);
	};
	// /logging supports GET for reading the current level; everything else is
	// a PUT (POST tolerated for older clients).
	let method = req.method();
	let method_ok = if method == http::Method::PUT || method == http::Method::POST {
		true
	} else if method == http::Method::GET {
		op == "/logging" || op == "/status"
	} else {
		false
	};
	if !method_ok {
		return http::empty_response(http::StatusCode::METHOD_NOT_ALLOWED);
	}

	match op {
		"/expectation" => handle_expectation(inputs, req).await,
		"/clear" => handle_clear(inputs, req).await,
		"/reset" => handle_reset(inputs),
		"/retrieve" => handle_retrieve(inputs, req).await,
		"/verify" => handle_verify(inputs, req).await,
		"/verifySequence" => handle_verify_sequence(inputs, req).await,
		"/status" => http::json_response(
			http::StatusCode::OK,
			&StatusBody {
				ports: inputs.ports.all(),
			},
		),
		"/bind" => handle_bind(inputs, req).await,
		"/stop" => handle_stop(inputs),
		"/logging" => handle_logging(req).await,
		_ => http::empty_response(http::StatusCode::NOT_FOUND),
	}
}

fn bad_request(msg: impl Into<String>) -> http::Response {
	http::plaintext_response(http::StatusCode::BAD_REQUEST, msg.into())
}

async fn body_json<T: serde::de::DeserializeOwned>(req: http::Request) -> Result<Option<T>, String> {
	let bytes = http::read_body(req.into_body(), MAX_MANAGEMENT_BODY)
		.await
		.map_err(|e| e.to_string())?;
	if bytes.is_empty() {
		return Ok(None);
	}
	serde_json::from_slice(&bytes).map(Some).map_err(|e| e.to_string())
}

async fn handle_expectation(inputs: &Arc<ServerInputs>, req: http::Request) -> http::Response {
	let bytes = match http::read_body(req.into_body(), MAX_MANAGEMENT_BODY).await {
		Ok(b) => b,
		Err(e) => return bad_request(e.to_string()),
	};
	// A single expectation or an array of them.
	let defs: Vec<ExpectationDefinition> = match serde_json::from_slice::<serde_json::Value>(&bytes) {
		Ok(serde_json::Value::Array(_)) => match serde_json::from_slice(&bytes) {
			Ok(defs) => defs,
			Err(e) => return bad_request(format!("invalid expectations: {e}")),
		},
		Ok(_) => match serde_json::from_slice::<ExpectationDefinition>(&bytes) {
			Ok(def) => vec![def],
			Err(e) => return bad_request(format!("invalid expectation: {e}")),
		},
		Err(e) => return bad_request(format!("invalid expectation body: {e}")),
	};
	match inputs.store.add_all(defs) {
		Ok(ids) => {
			for id in &ids {
				inputs.journal.message(format!("expectation {id} registered"));
			}
			http::json_response(http::StatusCode::CREATED, &serde_json::json!({ "ids": ids }))
		},
		Err(e @ StoreError::CapacityExceeded(_)) => bad_request(e.to_string()),
		Err(e) => bad_request(e.to_string()),
	}
}

async fn handle_clear(inputs: &Arc<ServerInputs>, req: http::Request) -> http::Response {
	let body: ClearBody = match body_json(req).await {
		Ok(b) => b.unwrap_or_default(),
		Err(e) => return bad_request(format!("invalid clear body: {e}")),
	};
	if matches!(body.scope, ClearScope::All | ClearScope::Log) {
		inputs.journal.clear(body.request.as_ref());
	}
	if matches!(body.scope, ClearScope::All | ClearScope::Expectations) {
		match &body.request {
			Some(matcher) => inputs.store.remove(matcher),
			None => inputs.store.reset(),
		}
	}
	inputs.journal.message("state cleared".to_string());
	http::empty_response(http::StatusCode::OK)
}

fn handle_reset(inputs: &Arc<ServerInputs>) -> http::Response {
	inputs.reset();
	http::empty_response(http::StatusCode::OK)
}

async fn handle_retrieve(inputs: &Arc<ServerInputs>, req: http::Request) -> http::Response {
	let mut retrieve_type = RetrieveType::Requests;
	let mut format = RetrieveFormat::Json;
	if let Some(query) = req.uri().query() {
		let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
		for (name, value) in pairs {
			match name.as_str() {
				"type" => match value.parse() {
					Ok(t) => retrieve_type = t,
					Err(e) => return bad_request(e),
				},
				"format" => match value.as_str() {
					"JSON" => format = RetrieveFormat::Json,
					"LOG_ENTRIES" => format = RetrieveFormat::LogEntries,
					other => {
						// The JAVA rendering has no counterpart here.
						return bad_request(format!("unsupported format {other:?}"));
					},
				},
				_ => {},
			}
		}
	}
	let matcher: Option<RequestMatcher> = match body_json(req).await {
		Ok(m) => m,
		Err(e) => return bad_request(format!("invalid retrieve matcher: {e}")),
	};
	let retrieved = match retrieve_type {
		RetrieveType::ActiveExpectations => {
			Retrieved::Expectations(inputs.store.active_definitions())
		},
		other => inputs.journal.retrieve(matcher.as_ref(), other),
	};
	match format {
		RetrieveFormat::Json => http::json_response(http::StatusCode::OK, &retrieved),
		RetrieveFormat::LogEntries => {
			let rendered = match serde_json::to_value(&retrieved) {
				Ok(serde_json::Value::Array(items)) => items
					.into_iter()
					.map(|i| serde_json::to_string(&i).unwrap_or_default())
					.collect::<Vec<_>>()
					.join("\n"),
				Ok(v) => v.to_string(),
				Err(e) => return bad_request(e.to_string()),
			};
			http::plaintext_response(http::StatusCode::OK, rendered)
		},
	}
}

enum RetrieveFormat {
	Json,
	LogEntries,
}

async fn handle_verify(inputs: &Arc<ServerInputs>, req: http::Request) -> http::Response {
	let body: VerifyBody = match body_json(req).await {
		Ok(Some(b)) => b,
		Ok(None) => return bad_request("verify requires a request matcher"),
		Err(e) => return bad_request(format!("invalid verify body: {e}")),
	};
	match inputs.journal.verify(&body.request, body.times) {
		Ok(()) => http::empty_response(http::StatusCode::ACCEPTED),
		Err(mismatch) => http::plaintext_response(http::StatusCode::NOT_ACCEPTABLE, mismatch.report),
	}
}

async fn handle_verify_sequence(inputs: &Arc<ServerInputs>, req: http::Request) -> http::Response {
	let body: VerifySequenceBody = match body_json(req).await {
		Ok(Some(b)) => b,
		Ok(None) => return bad_request("verifySequence requires request matchers"),
		Err(e) => return bad_request(format!("invalid verifySequence body: {e}")),
	};
	match inputs.journal.verify_sequence(&body.requests) {
		Ok(()) => http::empty_response(http::StatusCode::ACCEPTED),
		Err(mismatch) => http::plaintext_response(http::StatusCode::NOT_ACCEPTABLE, mismatch.report),
	}
}

async fn handle_bind(inputs: &Arc<ServerInputs>, req: http::Request) -> http::Response {
	let body: BindBody = match body_json(req).await {
		Ok(Some(b)) => b,
		Ok(None) => return bad_request("bind requires a port list"),
		Err(e) => return bad_request(format!("invalid bind body: {e}")),
	};
	match inputs.bind_additional(body.ports).await {
		Ok(_) => http::json_response(
			http::StatusCode::OK,
			&StatusBody {
				ports: inputs.ports.all(),
			},
		),
		Err(e) => {
			warn!(err = %e, "runtime bind failed");
			bad_request(e.to_string())
		},
	}
}

fn handle_stop(inputs: &Arc<ServerInputs>) -> http::Response {
	info!("stop requested over the management API");
	let response = http::json_response(
		http::StatusCode::OK,
		&StatusBody {
			ports: inputs.ports.all(),
		},
	);
	// Respond before the shutdown completes.
	let trigger = inputs.stop.clone();
	tokio::spawn(async move { trigger.stop_now().await });
	response
}

async fn handle_logging(req: http::Request) -> http::Response {
	if req.method() == http::Method::GET {
		return match telemetry::get_current_loglevel() {
			Ok(level) => http::plaintext_response(http::StatusCode::OK, level),
			Err(e) => bad_request(e.to_string()),
		};
	}
	let body: LoggingBody = match body_json(req).await {
		Ok(Some(b)) => b,
		Ok(None) => return bad_request("logging requires a level"),
		Err(e) => return bad_request(format!("invalid logging body: {e}")),
	};
	match telemetry::set_level(true, &body.level) {
		Ok(()) => http::empty_response(http::StatusCode::OK),
		Err(e) => bad_request(e.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn management_paths_are_recognized_with_and_without_prefix() {
		assert!(is_management_path("/mockserver/expectation"));
		assert!(is_management_path("/expectation"));
		assert!(is_management_path("/mockserver/verifySequence"));
		assert!(!is_management_path("/anything"));
		assert!(!is_management_path("/mockserver/unknown"));
	}
}
