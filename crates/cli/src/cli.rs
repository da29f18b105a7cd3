use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tabops")]
#[command(about = "Browser-tab session admission and scheduling server")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Run the WebSocket server
	Serve(ServeArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
	/// Interface to bind
	#[arg(long, env = "TABOPS_HOST", default_value = "127.0.0.1")]
	pub host: String,

	/// Port to bind
	#[arg(long, env = "TABOPS_PORT", default_value_t = 9301)]
	pub port: u16,

	/// TOML config file (default: $XDG_CONFIG_HOME/tabops/config.toml)
	#[arg(long, env = "TABOPS_CONFIG")]
	pub config: Option<PathBuf>,

	/// Override the largest single wire message, in bytes
	#[arg(long)]
	pub max_payload_bytes: Option<usize>,

	/// Override the assembled snapshot size cap, in bytes
	#[arg(long)]
	pub max_snapshot_bytes: Option<usize>,

	/// Override how long a session stays reclaimable after its owner
	/// disconnects, in milliseconds
	#[arg(long)]
	pub closing_grace_ms: Option<u64>,

	/// Override how long a request may wait for a slot before it is
	/// rejected, in milliseconds
	#[arg(long)]
	pub backpressure_timeout_ms: Option<u64>,

	/// Override the governor's sampling window, in milliseconds
	#[arg(long)]
	pub sample_interval_ms: Option<u64>,
}
