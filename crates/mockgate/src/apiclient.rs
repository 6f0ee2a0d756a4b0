//! Programmatic client for the management API. The integration tests and
//! embedding applications drive a running server through this.

use std::sync::atomic::{AtomicBool, Ordering};

use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use mockgate_core::prelude::*;
use serde::Deserialize;

use crate::types::{ExpectationDefinition, RequestMatcher, VerifyTimes};
use crate::{http, journal::RetrieveType};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
	/// Exact message contract: anything sent after `stop` fails with this.
	#[error("Request sent after client has been stopped")]
	Stopped,
	#[error("request failed: {0}")]
	Transport(#[from] hyper_util::client::legacy::Error),
	#[error("server answered {0}: {1}")]
	Status(http::StatusCode, String),
	#[error("verification failed:\n{0}")]
	VerificationFailed(String),
	#[error("malformed server response: {0}")]
	Malformed(String),
}

pub struct MockClient {
	base: String,
	http: HyperClient<HttpConnector, http::Body>,
	stopped: AtomicBool,
}

#[derive(Deserialize)]
struct IdsBody {
	ids: Vec<Strng>,
}

#[derive(Deserialize)]
struct PortsBody {
	ports: Vec<u16>,
}

impl MockClient {
	pub fn new(host: IpAddr, port: u16) -> MockClient {
		let base = match host {
			IpAddr::V6(v6) => format!("http://[{v6}]:{port}"),
			IpAddr::V4(v4) => format!("http://{v4}:{port}"),
		};
		MockClient {
			base,
			http: HyperClient::builder(TokioExecutor::new())
				.timer(TokioTimer::new())
				.build_http(),
			stopped: AtomicBool::new(false),
		}
	}

	/// Registers expectations, returning their assigned ids.
	pub async fn expect(&self, defs: &[ExpectationDefinition]) -> Result<Vec<Strng>, ClientError> {
		let body = serde_json::to_vec(defs).map_err(|e| ClientError::Malformed(e.to_string()))?;
		let bytes = self.call("/mockserver/expectation", body).await?;
		let parsed: IdsBody =
			serde_json::from_slice(&bytes).map_err(|e| ClientError::Malformed(e.to_string()))?;
		Ok(parsed.ids)
	}

	pub async fn verify(
		&self,
		matcher: &RequestMatcher,
		times: VerifyTimes,
	) -> Result<(), ClientError> {
		let body = serde_json::json!({ "request": matcher, "times": times });
		match self.call("/mockserver/verify", serde_json::to_vec(&body).expect("serializable")).await {
			Ok(_) => Ok(()),
			Err(ClientError::Status(http::StatusCode::NOT_ACCEPTABLE, report)) => {
				Err(ClientError::VerificationFailed(report))
			},
			Err(e) => Err(e),
		}
	}

	pub async fn verify_sequence(&self, matchers: &[RequestMatcher]) -> Result<(), ClientError> {
		let body = serde_json::json!({ "requests": matchers });
		match self
			.call("/mockserver/verifySequence", serde_json::to_vec(&body).expect("serializable"))
			.await
		{
			Ok(_) => Ok(()),
			Err(ClientError::Status(http::StatusCode::NOT_ACCEPTABLE, report)) => {
				Err(ClientError::VerificationFailed(report))
			},
			Err(e) => Err(e),
		}
	}

	pub async fn reset(&self) -> Result<(), ClientError> {
		self.call("/mockserver/reset", Vec::new()).await.map(drop)
	}

	pub async fn clear(&self, matcher: Option<&RequestMatcher>) -> Result<(), ClientError> {
		let body = match matcher {
			Some(m) => serde_json::to_vec(&serde_json::json!({ "request": m })).expect("serializable"),
			None => Vec::new(),
		};
		self.call("/mockserver/clear", body).await.map(drop)
	}

	pub async fn retrieve(
		&self,
		what: RetrieveType,
		matcher: Option<&RequestMatcher>,
	) -> Result<serde_json::Value, ClientError> {
		let type_name = match what {
			RetrieveType::Requests => "REQUESTS",
			RetrieveType::Responses => "RESPONSES",
			RetrieveType::RequestResponses => "REQUEST_RESPONSES",
			RetrieveType::RecordedExpectations => "RECORDED_EXPECTATIONS",
			RetrieveType::ActiveExpectations => "ACTIVE_EXPECTATIONS",
			RetrieveType::LogMessages => "LOG_MESSAGES",
		};
		let body = match matcher {
			Some(m) => serde_json::to_vec(m).expect("serializable"),
			None => Vec::new(),
		};
		let bytes = self
			.call(&format!("/mockserver/retrieve?type={type_name}&format=JSON"), body)
			.await?;
		serde_json::from_slice(&bytes).map_err(|e| ClientError::Malformed(e.to_string()))
	}

	pub async fn status(&self) -> Result<Vec<u16>, ClientError> {
		let bytes = self.call("/mockserver/status", Vec::new()).await?;
		let parsed: PortsBody =
			serde_json::from_slice(&bytes).map_err(|e| ClientError::Malformed(e.to_string()))?;
		Ok(parsed.ports)
	}

	pub async fn bind(&self, ports: &[u16]) -> Result<Vec<u16>, ClientError> {
		let body = serde_json::json!({ "ports": ports });
		let bytes = self
			.call("/mockserver/bind", serde_json::to_vec(&body).expect("serializable"))
			.await?;
		let parsed: PortsBody =
			serde_json::from_slice(&bytes).map_err(|e| ClientError::Malformed(e.to_string()))?;
		Ok(parsed.ports)
	}

	/// Asks the server to stop. The server responds before shutdown
	/// completes. Every call on this client afterwards fails with
	/// [`ClientError::Stopped`].
	pub async fn stop(&self) -> Result<(), ClientError> {
		let result = self.call("/mockserver/stop", Vec::new()).await.map(drop);
		self.stopped.store(true, Ordering::Release);
		result
	}

	async fn call(&self, path_and_query: &str, body: Vec<u8>) -> Result<Bytes, ClientError> {
		if self.stopped.load(Ordering::Acquire) {
			return Err(ClientError::Stopped);
		}
		let req = ::http::Request::builder()
			.method(http::Method::PUT)
			.uri(format!("{}{}", self.base, path_and_query))
			.header(http::header::CONTENT_TYPE, "application/json")
			.body(http::Body::from(body))
			.map_err(|e| ClientError::Malformed(e.to_string()))?;
		let response = self.http.request(req).await?;
		let status = response.status();
		let bytes = http::read_body(http::Body::new(response.into_body()), 4_194_304)
			.await
			.map_err(|e| ClientError::Malformed(e.to_string()))?;
		if status.is_success() {
			Ok(bytes)
		} else {
			Err(ClientError::Status(
				status,
				String::from_utf8_lossy(&bytes).into_owned(),
			))
		}
	}
}
