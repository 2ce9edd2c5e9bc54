use std::sync::Arc;

use clap::Parser;
use trap_core::telemetry;
use trapgate::Config;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Multi-protocol authentication honeypot")]
struct Args {
	/// Parse configuration from the environment, print it, and exit.
	#[arg(long)]
	validate: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let cfg = Config::from_env()?;

	if args.validate {
		println!("{cfg:#?}");
		println!("Configuration is valid!");
		return Ok(());
	}

	let _log_guards = telemetry::setup_logging(&cfg.log_level, Some(cfg.log_file.clone()))?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("build tokio runtime")
		.block_on(async move {
			info!(host = %cfg.host, "starting trapgate");
			trapgate::app::run(Arc::new(cfg)).await?.wait_termination().await
		})
}
