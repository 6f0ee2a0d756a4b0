use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use mockgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::client::{RetryPolicy, UpstreamConfig};
use crate::serdes;
use crate::serdes::serde_dur;

/// Resolved server configuration. Every knob has a default; environment
/// variables override the config file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	#[serde(serialize_with = "serdes::ser_display")]
	pub listen_ip: IpAddr,
	/// Ports bound at startup. Port 0 picks an ephemeral port.
	pub ports: Vec<u16>,
	/// Size of the deferred-work pool (delays, callback timeouts, retries).
	pub worker_threads: usize,
	pub max_log_entries: usize,
	pub max_expectations: usize,
	/// Bound on each callback channel's send queue; a full queue makes the
	/// callback unavailable rather than blocking the dispatcher.
	pub max_websocket_queue: usize,
	#[serde(with = "serde_dur")]
	pub callback_response_timeout: Duration,
	#[serde(with = "serde_dur")]
	pub socket_connection_timeout: Duration,
	/// Deadline for a single dispatched action, end to end.
	#[serde(with = "serde_dur")]
	pub max_response_time: Duration,
	/// Hard upper bound on graceful shutdown.
	#[serde(with = "serde_dur")]
	pub termination_deadline: Duration,
	pub retry: RetryPolicy,
	/// TLS termination is handled by an external collaborator; the paths are
	/// carried for it.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tls_cert_path: Option<PathBuf>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tls_key_path: Option<PathBuf>,
}

impl Config {
	pub fn upstream(&self) -> UpstreamConfig {
		UpstreamConfig {
			connect_timeout: self.socket_connection_timeout,
			retry: self.retry.clone(),
		}
	}
}

impl Default for Config {
	fn default() -> Self {
		parse_config(String::new()).expect("default configuration is valid")
	}
}

/// File-level configuration. All fields optional; unset fields fall back to
/// env vars, then defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
	listen_ip: Option<String>,
	ports: Option<Vec<u16>>,
	worker_threads: Option<usize>,
	max_log_entries: Option<usize>,
	max_expectations: Option<usize>,
	max_websocket_queue: Option<usize>,
	#[serde(default, with = "serdes::serde_dur_option")]
	callback_response_timeout: Option<Duration>,
	#[serde(default, with = "serdes::serde_dur_option")]
	socket_connection_timeout: Option<Duration>,
	#[serde(default, with = "serdes::serde_dur_option")]
	max_response_time: Option<Duration>,
	#[serde(default, with = "serdes::serde_dur_option")]
	termination_deadline: Option<Duration>,
	retry: Option<RetryPolicy>,
	tls_cert_path: Option<PathBuf>,
	tls_key_path: Option<PathBuf>,
}

pub fn parse_config(contents: String) -> anyhow::Result<Config> {
	let raw: RawConfig = if contents.trim().is_empty() {
		RawConfig::default()
	} else {
		serdes::yamlviajson::from_str(&contents)?
	};

	let listen_ip = parse::<IpAddr>("LISTEN_IP")?
		.or(
			raw
				.listen_ip
				.as_deref()
				.map(|s| s.parse::<IpAddr>())
				.transpose()
				.context("invalid listenIp")?,
		)
		.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
	let ports = parse_ports("PORTS")?.or(raw.ports).unwrap_or_else(|| vec![1080]);
	if ports.is_empty() {
		anyhow::bail!("at least one port is required");
	}
	let worker_threads = parse::<usize>("WORKER_THREADS")?
		.or(raw.worker_threads)
		.unwrap_or(8)
		.max(1);
	let max_log_entries = parse::<usize>("MAX_LOG_ENTRIES")?
		.or(raw.max_log_entries)
		.unwrap_or(1000)
		.max(1);
	let max_expectations = parse::<usize>("MAX_EXPECTATIONS")?
		.or(raw.max_expectations)
		.unwrap_or(1000)
		.max(1);
	let max_websocket_queue = parse::<usize>("MAX_WEBSOCKET_QUEUE")?
		.or(raw.max_websocket_queue)
		.unwrap_or(128)
		.max(1);
	let callback_response_timeout = parse_duration("CALLBACK_RESPONSE_TIMEOUT")?
		.or(raw.callback_response_timeout)
		.unwrap_or(Duration::from_secs(120));
	let socket_connection_timeout = parse_duration("SOCKET_CONNECTION_TIMEOUT")?
		.or(raw.socket_connection_timeout)
		.unwrap_or(Duration::from_secs(10));
	let max_response_time = parse_duration("MAX_SOCKET_TIMEOUT")?
		.or(raw.max_response_time)
		.unwrap_or(Duration::from_secs(120));
	let termination_deadline = parse_duration("TERMINATION_DEADLINE")?
		.or(raw.termination_deadline)
		.unwrap_or(Duration::from_secs(15));
	let tls_cert_path = parse::<PathBuf>("TLS_CERT_PATH")?.or(raw.tls_cert_path);
	let tls_key_path = parse::<PathBuf>("TLS_KEY_PATH")?.or(raw.tls_key_path);
	if tls_cert_path.is_some() != tls_key_path.is_some() {
		anyhow::bail!("TLS requires both a certificate and a key path");
	}

	Ok(Config {
		listen_ip,
		ports,
		worker_threads,
		max_log_entries,
		max_expectations,
		max_websocket_queue,
		callback_response_timeout,
		socket_connection_timeout,
		max_response_time,
		termination_deadline,
		retry: raw.retry.unwrap_or_default(),
		tls_cert_path,
		tls_key_path,
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
	match env::var(env) {
		Ok(val) if !val.is_empty() => val
			.parse::<T>()
			.map(Some)
			.with_context(|| format!("invalid value for {env}: {val:?}")),
		_ => Ok(None),
	}
}

fn parse_duration(env: &str) -> anyhow::Result<Option<Duration>> {
	match env::var(env) {
		Ok(val) if !val.is_empty() => duration_str::parse(&val)
			.map(Some)
			.map_err(|e| anyhow::anyhow!("invalid duration for {env}: {e}")),
		_ => Ok(None),
	}
}

fn parse_ports(env: &str) -> anyhow::Result<Option<Vec<u16>>> {
	match env::var(env) {
		Ok(val) if !val.is_empty() => val
			.split(',')
			.map(|p| {
				p.trim()
					.parse::<u16>()
					.with_context(|| format!("invalid port in {env}: {p:?}"))
			})
			.collect::<anyhow::Result<Vec<u16>>>()
			.map(Some),
		_ => Ok(None),
	}
}
