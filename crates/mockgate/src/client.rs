use std::num::NonZeroU8;

use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use mockgate_core::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::scheduler::Scheduler;
use crate::serdes::serde_dur_option;
use crate::types::{ForwardScheme, ForwardTarget};
use crate::{http, serdes};

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
	#[error("upstream call failed: {0}")]
	CallFailed(hyper_util::client::legacy::Error),
	#[error("https forwards require a TLS transport, which is not configured")]
	TlsUnavailable,
	#[error("upstream call aborted by shutdown")]
	Cancelled,
	#[error("invalid forward target: {0}")]
	InvalidTarget(anyhow::Error),
}

/// Retry budget for transient forward failures. One attempt means no retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicy {
	#[serde(default = "default_attempts")]
	pub attempts: NonZeroU8,
	#[serde(default, with = "serde_dur_option", skip_serializing_if = "Option::is_none")]
	pub backoff: Option<Duration>,
}

fn default_attempts() -> NonZeroU8 {
	NonZeroU8::new(1).expect("static nonzero")
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy {
			attempts: default_attempts(),
			backoff: None,
		}
	}
}

/// Outbound HTTP client used for forward actions and the management API
/// client. Connections are pooled per authority.
#[derive(Clone)]
pub struct Upstream {
	client: HyperClient<HttpConnector, http::Body>,
	retry: RetryPolicy,
	scheduler: Scheduler,
}

impl Debug for Upstream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Upstream").finish()
	}
}

impl Upstream {
	pub fn new(connect_timeout: Duration, retry: RetryPolicy, scheduler: Scheduler) -> Upstream {
		let mut connector = HttpConnector::new();
		connector.set_connect_timeout(Some(connect_timeout));
		connector.set_nodelay(true);
		let client = HyperClient::builder(TokioExecutor::new())
			.timer(TokioTimer::new())
			.build(connector);
		Upstream {
			client,
			retry,
			scheduler,
		}
	}

	/// Sends a request carrying an absolute URI. No retries; used by the
	/// programmatic client where failures surface directly.
	pub async fn simple_call(&self, req: http::Request) -> Result<http::Response, UpstreamError> {
		trace!(uri = %req.uri(), "sending request");
		self
			.client
			.request(req)
			.await
			.map(|r| r.map(http::Body::new))
			.map_err(UpstreamError::CallFailed)
	}

	/// Forwards a buffered request to `target`, rewriting the authority and
	/// `Host` header. Transient failures retry per policy with backoff; the
	/// buffered body makes each attempt replayable.
	pub async fn forward(
		&self,
		target: &ForwardTarget,
		method: http::Method,
		path_and_query: &str,
		headers: http::HeaderMap,
		body: Bytes,
	) -> Result<http::Response, UpstreamError> {
		if target.scheme == ForwardScheme::Https {
			return Err(UpstreamError::TlsUnavailable);
		}
		let uri: http::Uri = format!("http://{}{}", target.authority(), path_and_query)
			.parse()
			.map_err(|e: ::http::uri::InvalidUri| UpstreamError::InvalidTarget(e.into()))?;
		let host = http::HeaderValue::try_from(target.authority())
			.map_err(|e| UpstreamError::InvalidTarget(e.into()))?;

		let start = Instant::now();
		let mut attempt = 0u8;
		loop {
			attempt += 1;
			let mut req = ::http::Request::builder()
				.method(method.clone())
				.uri(uri.clone())
				.body(http::Body::from(body.clone()))
				.map_err(|e| UpstreamError::InvalidTarget(e.into()))?;
			*req.headers_mut() = headers.clone();
			req.headers_mut().insert(http::header::HOST, host.clone());

			match self.client.request(req).await {
				Ok(resp) => {
					debug!(
						target = %target,
						status = resp.status().as_u16(),
						attempt,
						duration = ?start.elapsed(),
						"forward complete",
					);
					return Ok(resp.map(http::Body::new));
				},
				Err(e) if attempt < self.retry.attempts.get() => {
					debug!(target = %target, attempt, err = %e, "forward attempt failed, retrying");
					if let Some(backoff) = self.retry.backoff
						&& !self.scheduler.sleep(backoff).await
					{
						return Err(UpstreamError::Cancelled);
					}
				},
				Err(e) => return Err(UpstreamError::CallFailed(e)),
			}
		}
	}
}

/// Upstream configuration block, kept alongside the rest of the server
/// config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamConfig {
	#[serde(default = "default_connect_timeout", with = "serdes::serde_dur")]
	pub connect_timeout: Duration,
	#[serde(default)]
	pub retry: RetryPolicy,
}

fn default_connect_timeout() -> Duration {
	Duration::from_secs(10)
}

impl Default for UpstreamConfig {
	fn default() -> Self {
		UpstreamConfig {
			connect_timeout: default_connect_timeout(),
			retry: RetryPolicy::default(),
		}
	}
}
