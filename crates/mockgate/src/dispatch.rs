//! Mock-path request handling: capture, match, execute the action, journal
//! the exchange.

use std::collections::HashMap;

use chrono::Utc;
use mockgate_core::prelude::*;
use tracing::{debug, warn};

use crate::callback::local::LocalHandler;
use crate::callback::{CallbackFailure, CallbackKind, ClientReply};
use crate::client::UpstreamError;
use crate::types::{
	Action, Delay, ErrorAction, ForwardScheme, ForwardTarget, Interaction, RecordedBody,
	RecordedResponse, RequestFingerprint, RequestOverride, ResponseDefinition,
};
use crate::{ServerInputs, http};

/// Bodies are buffered for matching, journaling, and forward replay.
const MAX_BUFFERED_BODY: usize = 2_097_152;

/// Marks the re-entrant leg of a forward that targets this same server.
const REENTRY_HEADER: &str = "x-mockgate-reentry";

#[derive(thiserror::Error, Debug)]
pub enum MockError {
	#[error("no expectation matched")]
	NoMatch,
	#[error("upstream failure: {0}")]
	Upstream(#[from] UpstreamError),
	#[error("{failure}")]
	Callback {
		failure: CallbackFailure,
		forward: bool,
	},
	#[error("{0}")]
	CallbackLoad(#[from] crate::callback::local::CallbackLoadFailure),
	#[error("template evaluation failed: {0}")]
	Template(String),
	#[error("action exceeded the response deadline")]
	Deadline,
	/// Error actions close the connection without an HTTP response. The
	/// listener maps this into a connection-level failure.
	#[error("connection aborted by error action")]
	Aborted,
}

impl MockError {
	pub fn status(&self) -> http::StatusCode {
		match self {
			MockError::NoMatch => http::StatusCode::NOT_FOUND,
			MockError::Upstream(_) => http::StatusCode::BAD_GATEWAY,
			MockError::Callback { forward: false, .. } => http::StatusCode::NOT_FOUND,
			MockError::Callback { forward: true, .. } => http::StatusCode::BAD_GATEWAY,
			MockError::CallbackLoad(_) => http::StatusCode::NOT_FOUND,
			MockError::Template(_) => http::StatusCode::NOT_FOUND,
			MockError::Deadline => http::StatusCode::GATEWAY_TIMEOUT,
			MockError::Aborted => http::StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

/// A request at rest: the matcher-facing fingerprint plus everything needed
/// to replay it upstream.
pub struct CapturedRequest {
	pub fingerprint: RequestFingerprint,
	pub method: http::Method,
	pub path_and_query: String,
	pub headers: http::HeaderMap,
	pub body: Bytes,
	pub via_proxy: bool,
}

pub async fn capture(req: http::Request) -> anyhow::Result<CapturedRequest> {
	let (parts, body) = req.into_parts();
	let body = http::read_body(body, MAX_BUFFERED_BODY).await?;

	let mut headers_map: HashMap<String, Vec<String>> = HashMap::new();
	let mut via_proxy = false;
	let mut headers = parts.headers.clone();
	if headers.remove(REENTRY_HEADER).is_some() {
		via_proxy = true;
	}
	for (name, value) in headers.iter() {
		if let Ok(v) = value.to_str() {
			headers_map
				.entry(name.as_str().to_ascii_lowercase())
				.or_default()
				.push(v.to_string());
		}
	}

	let mut cookies = HashMap::new();
	for value in headers.get_all(http::header::COOKIE) {
		if let Ok(raw) = value.to_str() {
			for pair in raw.split(';') {
				if let Some((name, v)) = pair.trim().split_once('=') {
					cookies.insert(name.to_string(), v.to_string());
				}
			}
		}
	}

	let query: HashMap<String, Vec<String>> = match parts.uri.query() {
		None => HashMap::new(),
		Some(q) => {
			let pairs: Vec<(String, String)> = serde_urlencoded::from_str(q).unwrap_or_default();
			let mut map: HashMap<String, Vec<String>> = HashMap::new();
			for (k, v) in pairs {
				map.entry(k).or_default().push(v);
			}
			map
		},
	};

	let content_type = headers
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok());
	let fingerprint = RequestFingerprint {
		method: parts.method.to_string(),
		path: parts.uri.path().to_string(),
		query,
		headers: headers_map,
		cookies,
		body: RecordedBody::capture(content_type, &body),
		path_parameters: HashMap::new(),
	};
	let path_and_query = parts
		.uri
		.path_and_query()
		.map(|pq| pq.to_string())
		.unwrap_or_else(|| parts.uri.path().to_string());
	Ok(CapturedRequest {
		fingerprint,
		method: parts.method,
		path_and_query,
		headers,
		body,
		via_proxy,
	})
}

/// Serves one mock-path request end to end. Exactly one interaction is
/// journaled per call, whatever the outcome.
pub async fn handle_mock(inputs: &Arc<ServerInputs>, req: http::Request) -> Result<http::Response, MockError> {
	let mut captured = match capture(req).await {
		Ok(c) => c,
		Err(e) => {
			warn!(err = %e, "failed to read request");
			return Ok(http::plaintext_response(http::StatusCode::BAD_REQUEST, e.to_string()));
		},
	};

	let snapshot = inputs.store.snapshot();
	let selected = snapshot.select(&captured.fingerprint);
	let Some((expectation, params)) = selected else {
		let response = http::empty_response(http::StatusCode::NOT_FOUND);
		journal(inputs, &captured, None, Some(record_response(&response, None)), None, None);
		return Ok(response);
	};
	captured.fingerprint.path_parameters = params;
	if expectation.exhausted() {
		inputs.store.retire(&expectation.id, snapshot.generation);
	}
	debug!(
		expectation = expectation.id.as_str(),
		path = %captured.fingerprint.path,
		"expectation matched",
	);

	let deadline = inputs.cfg.max_response_time;
	let action = expectation.action.clone();
	let outcome = tokio::time::timeout(deadline, execute(inputs, &captured, action)).await;
	let outcome = match outcome {
		Ok(o) => o,
		Err(_) => Err(MockError::Deadline),
	};
	match outcome {
		Ok(Outcome {
			response,
			recorded,
			forwarded_request,
			forwarded_response,
		}) => {
			journal(
				inputs,
				&captured,
				Some(&expectation.id),
				Some(recorded),
				forwarded_request,
				forwarded_response,
			);
			Ok(response)
		},
		Err(MockError::Aborted) => {
			journal(inputs, &captured, Some(&expectation.id), None, None, None);
			Err(MockError::Aborted)
		},
		Err(e) => {
			inputs.journal.message(format!(
				"expectation {} failed on {} {}: {}",
				expectation.id, captured.fingerprint.method, captured.fingerprint.path, e
			));
			let response = http::plaintext_response(e.status(), e.to_string());
			journal(
				inputs,
				&captured,
				Some(&expectation.id),
				Some(record_response(&response, None)),
				None,
				None,
			);
			Ok(response)
		},
	}
}

struct Outcome {
	response: http::Response,
	recorded: RecordedResponse,
	forwarded_request: Option<RequestFingerprint>,
	forwarded_response: Option<RecordedResponse>,
}

async fn execute(
	inputs: &Arc<ServerInputs>,
	captured: &CapturedRequest,
	action: Action,
) -> Result<Outcome, MockError> {
	match action {
		Action::Respond(def) => {
			apply_delay(inputs, def.delay.as_ref()).await?;
			let (response, recorded) = realize(&def)?;
			Ok(Outcome {
				response,
				recorded,
				forwarded_request: None,
				forwarded_response: None,
			})
		},
		Action::RespondTemplate { engine, template } => {
			let evaluator = inputs.local_callbacks.template_engine(&engine)?;
			let fingerprint = captured.fingerprint.clone();
			let def = tokio::task::spawn_blocking(move || evaluator.render(&template, &fingerprint))
				.await
				.map_err(|e| MockError::Template(e.to_string()))?
				.map_err(|e| MockError::Template(e.to_string()))?;
			apply_delay(inputs, def.delay.as_ref()).await?;
			let (response, recorded) = realize(&def)?;
			Ok(Outcome {
				response,
				recorded,
				forwarded_request: None,
				forwarded_response: None,
			})
		},
		Action::Forward(target) => forward(inputs, captured, &target, None).await,
		Action::OverrideForward { target, overrides } => {
			forward(inputs, captured, &target, Some(&overrides)).await
		},
		Action::LocalCallback { name } => {
			match inputs.local_callbacks.resolve(&name)? {
				LocalHandler::Response(callback) => {
					let fingerprint = captured.fingerprint.clone();
					let def = tokio::task::spawn_blocking(move || callback.handle(&fingerprint))
						.await
						.map_err(|e| MockError::CallbackLoad(crate::callback::local::CallbackLoadFailure(name.clone(), e.to_string())))?
						.map_err(|e| MockError::CallbackLoad(crate::callback::local::CallbackLoadFailure(name.clone(), e.to_string())))?;
					apply_delay(inputs, def.delay.as_ref()).await?;
					let (response, recorded) = realize(&def)?;
					Ok(Outcome {
						response,
						recorded,
						forwarded_request: None,
						forwarded_response: None,
					})
				},
				LocalHandler::Forward(callback) => {
					let fingerprint = captured.fingerprint.clone();
					let rewritten = tokio::task::spawn_blocking(move || callback.rewrite(fingerprint))
						.await
						.map_err(|e| MockError::CallbackLoad(crate::callback::local::CallbackLoadFailure(name.clone(), e.to_string())))?
						.map_err(|e| MockError::CallbackLoad(crate::callback::local::CallbackLoadFailure(name.clone(), e.to_string())))?;
					forward_fingerprint(inputs, rewritten, true).await
				},
			}
		},
		Action::RemoteCallback { client_id } => {
			let reply = inputs
				.callbacks
				.dispatch(&client_id, CallbackKind::Response, captured.fingerprint.clone())
				.await;
			match reply {
				Ok(ClientReply::Response(def)) => {
					apply_delay(inputs, def.delay.as_ref()).await?;
					let (response, recorded) = realize(&def)?;
					Ok(Outcome {
						response,
						recorded,
						forwarded_request: None,
						forwarded_response: None,
					})
				},
				Ok(ClientReply::ForwardRequest(rewritten)) => {
					forward_fingerprint(inputs, rewritten, false).await
				},
				Err(failure) => Err(MockError::Callback {
					failure,
					forward: false,
				}),
			}
		},
		Action::RemoteForwardCallback { client_id } => {
			let reply = inputs
				.callbacks
				.dispatch(&client_id, CallbackKind::Forward, captured.fingerprint.clone())
				.await;
			match reply {
				Ok(ClientReply::ForwardRequest(rewritten)) => {
					forward_fingerprint(inputs, rewritten, true).await
				},
				Ok(ClientReply::Response(_)) => Err(MockError::Callback {
					failure: CallbackFailure::ClientError("expected a forward_request reply".to_string()),
					forward: true,
				}),
				Err(failure) => Err(MockError::Callback {
					failure,
					forward: true,
				}),
			}
		},
		Action::Error(err) => execute_error(inputs, &err).await,
	}
}

async fn apply_delay(inputs: &Arc<ServerInputs>, delay: Option<&Delay>) -> Result<(), MockError> {
	if let Some(delay) = delay
		&& !inputs.scheduler.sleep(delay.effective()).await
	{
		return Err(MockError::Deadline);
	}
	Ok(())
}

/// Materializes a response definition into the wire response and its journal
/// record.
fn realize(def: &ResponseDefinition) -> Result<(http::Response, RecordedResponse), MockError> {
	let status =
		http::StatusCode::from_u16(def.status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
	let mut builder = ::http::Response::builder().status(status);
	let mut recorded_headers: HashMap<String, Vec<String>> = HashMap::new();
	for header in &def.headers {
		for value in &header.values {
			builder = builder.header(header.name.as_str(), value.as_str());
			recorded_headers
				.entry(header.name.to_ascii_lowercase())
				.or_default()
				.push(value.clone());
		}
	}
	if let Some(body) = &def.body
		&& !def.headers.iter().any(|h| h.name.eq_ignore_ascii_case("content-type"))
		&& let Some(ct) = body.content_type()
	{
		builder = builder.header(http::header::CONTENT_TYPE, ct);
		recorded_headers.insert("content-type".to_string(), vec![ct.to_string()]);
	}
	let bytes = def.body.as_ref().map(|b| b.to_bytes()).unwrap_or_default();
	let response = builder
		.body(http::Body::from(bytes))
		.map_err(|e| MockError::Template(e.to_string()))?;
	let recorded = RecordedResponse {
		status: def.status,
		reason: def.reason.clone(),
		headers: recorded_headers,
		body: def.body.clone(),
	};
	Ok((response, recorded))
}

async fn forward(
	inputs: &Arc<ServerInputs>,
	captured: &CapturedRequest,
	target: &ForwardTarget,
	overrides: Option<&RequestOverride>,
) -> Result<Outcome, MockError> {
	let mut method = captured.method.clone();
	let mut path_and_query = captured.path_and_query.clone();
	let mut headers = captured.headers.clone();
	let mut body = captured.body.clone();
	let mut fingerprint = captured.fingerprint.clone();

	if let Some(o) = overrides {
		if let Some(m) = &o.method
			&& let Ok(m) = m.as_str().parse::<http::Method>()
		{
			fingerprint.method = m.to_string();
			method = m;
		}
		if let Some(p) = &o.path {
			path_and_query = p.to_string();
			fingerprint.path = p.to_string();
		}
		for header in &o.headers {
			if let (Ok(name), Some(first)) = (
				header.name.as_str().parse::<http::HeaderName>(),
				header.values.first(),
			) {
				if let Ok(value) = http::HeaderValue::try_from(first.as_str()) {
					headers.insert(name.clone(), value);
				}
				for extra in header.values.iter().skip(1) {
					if let Ok(value) = http::HeaderValue::try_from(extra.as_str()) {
						headers.append(name.clone(), value);
					}
				}
				fingerprint
					.headers
					.insert(header.name.to_ascii_lowercase(), header.values.clone());
			}
		}
		if let Some(b) = &o.body {
			body = b.to_bytes();
			fingerprint.body = Some(b.clone());
		}
	}

	// A forward that targets this same server re-enters the mock path; tag it
	// so the inner interaction is journaled but excluded from verifications.
	if inputs.ports.is_self_target(target) {
		headers.insert(
			http::HeaderName::from_static(REENTRY_HEADER),
			http::HeaderValue::from_static("1"),
		);
	}

	let upstream_response = inputs
		.upstream
		.forward(target, method, &path_and_query, headers, body)
		.await?;
	let (response, forwarded_response) = record_upstream(upstream_response).await;
	Ok(Outcome {
		recorded: forwarded_response.clone(),
		response,
		forwarded_request: Some(fingerprint),
		forwarded_response: Some(forwarded_response),
	})
}

/// Forwards a callback-rewritten request to the authority in its `host`
/// header.
async fn forward_fingerprint(
	inputs: &Arc<ServerInputs>,
	rewritten: RequestFingerprint,
	from_forward_callback: bool,
) -> Result<Outcome, MockError> {
	let failure = |msg: &str| MockError::Callback {
		failure: CallbackFailure::ClientError(msg.to_string()),
		forward: from_forward_callback,
	};
	let host = rewritten.header("host").ok_or_else(|| failure("rewritten request has no host header"))?;
	let (host, port) = match host.rsplit_once(':') {
		Some((h, p)) => (
			h.to_string(),
			p.parse::<u16>().map_err(|_| failure("invalid port in host header"))?,
		),
		None => (host.to_string(), 80),
	};
	let target = ForwardTarget {
		host: host.into(),
		port,
		scheme: ForwardScheme::Http,
	};
	let method = rewritten
		.method
		.parse::<http::Method>()
		.map_err(|_| failure("invalid method in rewritten request"))?;
	let mut headers = http::HeaderMap::new();
	for (name, values) in &rewritten.headers {
		for value in values {
			if let (Ok(n), Ok(v)) = (
				name.parse::<http::HeaderName>(),
				http::HeaderValue::try_from(value.as_str()),
			) {
				headers.append(n, v);
			}
		}
	}
	let body = rewritten.body.as_ref().map(|b| b.to_bytes()).unwrap_or_default();
	let mut path_and_query = rewritten.path.clone();
	if !rewritten.query.is_empty() {
		let pairs: Vec<(String, String)> = rewritten
			.query
			.iter()
			.flat_map(|(k, vs)| vs.iter().map(move |v| (k.clone(), v.clone())))
			.collect();
		if let Ok(qs) = serde_urlencoded::to_string(&pairs) {
			path_and_query = format!("{path_and_query}?{qs}");
		}
	}
	let upstream_response = inputs
		.upstream
		.forward(&target, method, &path_and_query, headers, body)
		.await?;
	let (response, forwarded_response) = record_upstream(upstream_response).await;
	Ok(Outcome {
		recorded: forwarded_response.clone(),
		response,
		forwarded_request: Some(rewritten),
		forwarded_response: Some(forwarded_response),
	})
}

/// Buffers the upstream response so the journal sees it, then rebuilds the
/// client-facing response from the buffered copy.
async fn record_upstream(response: http::Response) -> (http::Response, RecordedResponse) {
	let (parts, body) = response.into_parts();
	let bytes = http::read_body(body, MAX_BUFFERED_BODY)
		.await
		.unwrap_or_default();
	let mut headers: HashMap<String, Vec<String>> = HashMap::new();
	for (name, value) in parts.headers.iter() {
		if let Ok(v) = value.to_str() {
			headers
				.entry(name.as_str().to_ascii_lowercase())
				.or_default()
				.push(v.to_string());
		}
	}
	let content_type = headers.get("content-type").and_then(|v| v.first()).cloned();
	let recorded = RecordedResponse {
		status: parts.status.as_u16(),
		reason: parts.status.canonical_reason().map(str::to_string),
		headers,
		body: RecordedBody::capture(content_type.as_deref(), &bytes),
	};
	let mut rebuilt = ::http::Response::new(http::Body::from(bytes));
	*rebuilt.status_mut() = parts.status;
	*rebuilt.headers_mut() = parts.headers;
	(rebuilt, recorded)
}

async fn execute_error(inputs: &Arc<ServerInputs>, err: &ErrorAction) -> Result<Outcome, MockError> {
	if let Some(delay) = err.delay
		&& !inputs.scheduler.sleep(delay).await
	{
		return Err(MockError::Deadline);
	}
	if let Some(bytes) = &err.response_bytes {
		// Write the configured prefix, then fail the stream so the connection
		// tears down mid-response.
		let prefix = Bytes::from(bytes.clone());
		let stream = futures_util::stream::iter(vec![
			Ok::<_, std::io::Error>(http_body::Frame::data(prefix)),
			Err(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "injected error")),
		]);
		let response = ::http::Response::builder()
			.status(http::StatusCode::OK)
			.body(http::Body::new(http_body_util::StreamBody::new(stream)))
			.expect("builder with known status code should not fail");
		let recorded = RecordedResponse {
			status: 200,
			reason: None,
			headers: HashMap::new(),
			body: Some(RecordedBody::Binary(bytes.clone())),
		};
		return Ok(Outcome {
			response,
			recorded,
			forwarded_request: None,
			forwarded_response: None,
		});
	}
	// With neither bytes nor an explicit drop there is still nothing valid to
	// write back; the connection closes either way.
	Err(MockError::Aborted)
}

fn record_response(response: &http::Response, body: Option<RecordedBody>) -> RecordedResponse {
	let mut headers: HashMap<String, Vec<String>> = HashMap::new();
	for (name, value) in response.headers().iter() {
		if let Ok(v) = value.to_str() {
			headers
				.entry(name.as_str().to_ascii_lowercase())
				.or_default()
				.push(v.to_string());
		}
	}
	RecordedResponse {
		status: response.status().as_u16(),
		reason: response.status().canonical_reason().map(str::to_string),
		headers,
		body,
	}
}

fn journal(
	inputs: &Arc<ServerInputs>,
	captured: &CapturedRequest,
	expectation_id: Option<&Strng>,
	response: Option<RecordedResponse>,
	forwarded_request: Option<RequestFingerprint>,
	forwarded_response: Option<RecordedResponse>,
) {
	inputs.journal.append(Interaction {
		sequence: 0,
		received_at: Utc::now(),
		expectation_id: expectation_id.cloned(),
		request: captured.fingerprint.clone(),
		response,
		forwarded_request,
		forwarded_response,
		via_proxy: captured.via_proxy,
	});
}
