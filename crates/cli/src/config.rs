//! Engine configuration: defaults, then the TOML file, then flags.
//!
//! The file deserializes straight into [`EngineConfig`], so its keys are
//! the wire-facing camelCase names:
//!
//! ```toml
//! [limits]
//! maxPayloadBytes = 262144
//! closingGraceMs = 60000
//!
//! [governor]
//! backpressureTimeoutMs = 10000
//! headlessManagedCap = 8
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use tabops_core::EngineConfig;

use crate::cli::ServeArgs;

pub fn load(args: &ServeArgs) -> Result<EngineConfig> {
	let mut config = match config_path(args) {
		Some(path) if path.exists() => {
			let text = std::fs::read_to_string(&path)
				.with_context(|| format!("reading config file: {}", path.display()))?;
			let parsed: EngineConfig = toml::from_str(&text)
				.with_context(|| format!("parsing config file: {}", path.display()))?;
			debug!(target = "tabops", config = %path.display(), "loaded config file");
			parsed
		}
		Some(path) if args.config.is_some() => {
			anyhow::bail!("config file not found: {}", path.display());
		}
		_ => EngineConfig::default(),
	};

	// Flags beat the file.
	if let Some(bytes) = args.max_payload_bytes {
		config.limits.max_payload_bytes = bytes;
	}
	if let Some(bytes) = args.max_snapshot_bytes {
		config.limits.max_snapshot_bytes = bytes;
	}
	if let Some(ms) = args.closing_grace_ms {
		config.limits.closing_grace_ms = ms;
	}
	if let Some(ms) = args.backpressure_timeout_ms {
		config.governor.backpressure_timeout_ms = ms;
	}
	if let Some(ms) = args.sample_interval_ms {
		config.governor.sample_interval_ms = ms;
	}
	Ok(config)
}

fn config_path(args: &ServeArgs) -> Option<PathBuf> {
	if let Some(path) = &args.config {
		return Some(path.clone());
	}
	dirs::config_dir().map(|dir| dir.join("tabops").join("config.toml"))
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn args_with_config(path: PathBuf) -> ServeArgs {
		ServeArgs {
			config: Some(path),
			..ServeArgs::default()
		}
	}

	#[test]
	fn missing_explicit_file_is_an_error() {
		let args = args_with_config(PathBuf::from("/nonexistent/tabops.toml"));
		assert!(load(&args).is_err());
	}

	#[test]
	fn file_values_override_defaults() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(
			file,
			"[limits]\nmaxPayloadBytes = 65536\n\n[governor]\nheadlessManagedCap = 3\n"
		)
		.unwrap();

		let config = load(&args_with_config(file.path().to_path_buf())).unwrap();
		assert_eq!(config.limits.max_payload_bytes, 65536);
		assert_eq!(config.governor.headless_managed_cap, 3);
		// Untouched keys keep their defaults.
		assert_eq!(config.limits.closing_grace_ms, 60_000);
	}

	#[test]
	fn flags_beat_the_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "[limits]\nmaxPayloadBytes = 65536\n").unwrap();

		let args = ServeArgs {
			max_payload_bytes: Some(131_072),
			backpressure_timeout_ms: Some(2_500),
			..args_with_config(file.path().to_path_buf())
		};
		let config = load(&args).unwrap();
		assert_eq!(config.limits.max_payload_bytes, 131_072);
		assert_eq!(config.governor.backpressure_timeout_ms, 2_500);
	}

	#[test]
	fn malformed_file_reports_parse_error() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "[limits\nmaxPayloadBytes = oops").unwrap();
		let err = load(&args_with_config(file.path().to_path_buf())).unwrap_err();
		assert!(format!("{err:#}").contains("parsing config file"));
	}
}
