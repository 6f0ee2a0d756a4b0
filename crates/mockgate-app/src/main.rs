use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mockgate::{Config, MockServer};
use mockgate_core::telemetry;
use tracing::{error, info};

const EXIT_BIND_FAILURE: u8 = 1;
const EXIT_BAD_CONFIG: u8 = 2;

#[derive(Parser, Debug)]
#[command(about = "programmable HTTP mock server", long_about = None)]
struct Args {
	/// Use config from bytes (YAML or JSON)
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse and validate the configuration, then exit
	#[arg(long)]
	validate_only: bool,

	/// Override the ports to bind, comma separated
	#[arg(short, long, value_name = "ports")]
	ports: Option<String>,
}

fn main() -> ExitCode {
	telemetry::setup_logging();
	let args = Args::parse();

	let contents = match (&args.config, &args.file) {
		(Some(_), Some(_)) => {
			error!("only one of --config or --file may be given");
			return ExitCode::from(EXIT_BAD_CONFIG);
		},
		(Some(config), None) => config.clone(),
		(None, Some(file)) => match std::fs::read_to_string(file) {
			Ok(contents) => contents,
			Err(e) => {
				error!("failed to read {}: {e}", file.display());
				return ExitCode::from(EXIT_BAD_CONFIG);
			},
		},
		(None, None) => String::new(),
	};

	let mut config = match mockgate::config::parse_config(contents) {
		Ok(c) => c,
		Err(e) => {
			error!("invalid configuration: {e:#}");
			return ExitCode::from(EXIT_BAD_CONFIG);
		},
	};
	if let Some(ports) = &args.ports {
		match ports
			.split(',')
			.map(|p| p.trim().parse::<u16>())
			.collect::<Result<Vec<u16>, _>>()
		{
			Ok(ports) => config.ports = ports,
			Err(e) => {
				error!("invalid --ports: {e}");
				return ExitCode::from(EXIT_BAD_CONFIG);
			},
		}
	}
	if args.validate_only {
		println!("configuration is valid");
		return ExitCode::SUCCESS;
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("tokio runtime builds")
		.block_on(async move {
			info!("starting with config:\n{}", mockgate::serdes::yamlviajson::to_string(&config).unwrap_or_default());
			let server = match MockServer::start(Arc::new(config)).await {
				Ok(server) => server,
				Err(e) => {
					error!("startup failed: {e:#}");
					return ExitCode::from(EXIT_BIND_FAILURE);
				},
			};
			server.wait_termination().await;
			ExitCode::SUCCESS
		})
}
