use std::env;
use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry, filter, fmt, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

/// Initializes the global subscriber. The returned handle is kept by the
/// lifecycle; log levels can later be changed through [`set_level`] (wired to
/// the management `/logging` endpoint).
pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	tracing_subscriber::registry().with(fmt_layer()).init();
}

fn default_filter() -> filter::Targets {
	let var = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
	filter::Targets::from_str(&var).expect("static filter should build")
}

fn fmt_layer() -> BoxLayer {
	let format: BoxLayer = fmt::layer().with_target(false).boxed();
	let (layer, reload) = reload::Layer::new(format.with_filter(default_filter()));
	LOG_HANDLE
		.set(reload)
		.map_or_else(|_| warn!("setup log handler failed"), |_| {});
	Box::new(layer)
}

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, filter::Targets, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// Dynamically updates the logging level to *include* `level`. If `reset` is
/// true the configuration is rebuilt from the default first.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		warn!("failed to get log handle");
		return Err(Error::Uninitialized);
	};
	let new_directive = if let Ok(current) = handle.with_current(|f| f.filter().to_string()) {
		if reset {
			if level.is_empty() {
				default_filter().to_string()
			} else {
				format!("{},{}", default_filter(), level)
			}
		} else {
			format!("{current},{level}")
		}
	} else {
		level.to_string()
	};
	let new_filter = filter::Targets::from_str(&new_directive)?;
	info!("new log filter is {new_filter}");
	Ok(handle.modify(|layer| {
		*layer.filter_mut() = new_filter;
	})?)
}

pub fn get_current_loglevel() -> Result<String, Error> {
	if let Some(handle) = LOG_HANDLE.get() {
		Ok(handle.with_current(|f| f.filter().to_string())?)
	} else {
		Err(Error::Uninitialized)
	}
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}

pub mod testing {
	use once_cell::sync::Lazy;

	static TRACING: Lazy<()> = Lazy::new(|| {
		Lazy::force(&super::APPLICATION_START_TIME);
		let _ = tracing_subscriber::fmt()
			.with_env_filter(
				tracing_subscriber::EnvFilter::try_from_default_env()
					.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
			)
			.with_test_writer()
			.try_init();
	});

	/// Idempotent logging setup for tests.
	pub fn setup_test_logging() {
		Lazy::force(&TRACING);
	}
}
