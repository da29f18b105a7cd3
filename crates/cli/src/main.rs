use clap::Parser;

use tabops_cli::cli::{Cli, Command};
use tabops_cli::{config, logging, server};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let result = match cli.command {
		Command::Serve(args) => {
			let engine_config = match config::load(&args) {
				Ok(engine_config) => engine_config,
				Err(err) => {
					eprintln!("error: {err:#}");
					std::process::exit(2);
				}
			};
			server::run(&args.host, args.port, engine_config).await
		}
	};

	if let Err(err) = result {
		eprintln!("error: {err:#}");
		std::process::exit(1);
	}
}
