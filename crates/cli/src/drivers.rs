//! Default collaborator set for a standalone server.
//!
//! Tab and DOM machinery is supplied by an embedder (an extension host or
//! CDP bridge wired in at build time). Without one, every attach path
//! reports `ops_unavailable` so clients see a retryable "no tab host"
//! error instead of a hang. The sanitizer is real and always active.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tabops_core::drivers::{
	DomAccessor, DomDriver, DriverError, DriverResult, Drivers, ElementState, SnapshotBuilder,
	SnapshotMode, SnapshotOutput, TabDriver, TabInfo,
};
use tabops_core::{DebugRouter, Sanitizer};

const NO_HOST: &str = "no tab host attached to this server";

fn no_host<T>() -> DriverResult<T> {
	Err(DriverError::unavailable(NO_HOST))
}

pub struct UnattachedTabDriver;

#[async_trait]
impl TabDriver for UnattachedTabDriver {
	async fn create_tab(&self, _url: Option<&str>) -> DriverResult<TabInfo> {
		no_host()
	}

	async fn activate_tab(&self, _tab_id: &str) -> DriverResult<()> {
		no_host()
	}

	async fn close_tab(&self, _tab_id: &str) -> DriverResult<()> {
		no_host()
	}

	async fn wait_for_settle(&self, _tab_id: &str, _timeout_ms: u64) -> DriverResult<bool> {
		no_host()
	}
}

pub struct UnattachedDebugRouter;

#[async_trait]
impl DebugRouter for UnattachedDebugRouter {
	async fn attach(&self, _tab_id: &str) -> DriverResult<String> {
		no_host()
	}

	async fn detach(&self, _tab_id: &str) -> DriverResult<()> {
		no_host()
	}

	async fn send(&self, _target_id: &str, _method: &str, _params: Value) -> DriverResult<Value> {
		no_host()
	}
}

pub struct UnattachedDomDriver;

#[async_trait]
impl DomDriver for UnattachedDomDriver {
	async fn click(&self, _target_id: &str, _selector: &str) -> DriverResult<()> {
		no_host()
	}

	async fn hover(&self, _target_id: &str, _selector: &str) -> DriverResult<()> {
		no_host()
	}

	async fn press(&self, _target_id: &str, _selector: &str, _key: &str) -> DriverResult<()> {
		no_host()
	}

	async fn set_checked(
		&self,
		_target_id: &str,
		_selector: &str,
		_checked: bool,
	) -> DriverResult<()> {
		no_host()
	}

	async fn type_text(&self, _target_id: &str, _selector: &str, _text: &str) -> DriverResult<()> {
		no_host()
	}

	async fn select_option(
		&self,
		_target_id: &str,
		_selector: &str,
		_value: &str,
	) -> DriverResult<()> {
		no_host()
	}

	async fn scroll(&self, _target_id: &str, _dx: f64, _dy: f64) -> DriverResult<()> {
		no_host()
	}

	async fn scroll_into_view(&self, _target_id: &str, _selector: &str) -> DriverResult<()> {
		no_host()
	}

	async fn read(
		&self,
		_target_id: &str,
		_selector: &str,
		_accessor: DomAccessor,
		_attr_name: Option<&str>,
	) -> DriverResult<Value> {
		no_host()
	}

	async fn element_state(&self, _target_id: &str, _selector: &str) -> DriverResult<ElementState> {
		no_host()
	}
}

pub struct UnattachedSnapshotBuilder;

#[async_trait]
impl SnapshotBuilder for UnattachedSnapshotBuilder {
	async fn build(&self, _target_id: &str, _mode: SnapshotMode) -> DriverResult<SnapshotOutput> {
		no_host()
	}
}

/// Masks the value following well-known credential keys in forwarded
/// console/network text. Key matching is case-insensitive; the value runs
/// to the next whitespace, `;`, or `,`.
pub struct RedactingSanitizer {
	keys: Vec<&'static str>,
}

impl Default for RedactingSanitizer {
	fn default() -> Self {
		Self {
			keys: vec!["authorization", "cookie", "set-cookie", "token", "secret", "password"],
		}
	}
}

/// Byte-wise ASCII-case-insensitive search. The needle is ASCII, so a hit
/// covers only ASCII bytes and both ends land on char boundaries even when
/// the surrounding text is multibyte.
fn find_key(text: &str, key: &str, from: usize) -> Option<usize> {
	text.as_bytes()[from..]
		.windows(key.len())
		.position(|window| window.eq_ignore_ascii_case(key.as_bytes()))
		.map(|pos| from + pos)
}

impl RedactingSanitizer {
	fn redact(&self, text: &str) -> String {
		let mut masked: Vec<(usize, usize)> = Vec::new();
		for key in &self.keys {
			let mut from = 0;
			while let Some(pos) = find_key(text, key, from) {
				let key_end = pos + key.len();
				// Only `key:` / `key=` shapes carry a value worth masking.
				let Some(sep) = text[key_end..].chars().next() else {
					break;
				};
				if sep == ':' || sep == '=' {
					let mut value_start = key_end + 1;
					while text[value_start..].starts_with(' ') {
						value_start += 1;
					}
					let value_len = text[value_start..]
						.find(|c: char| c.is_whitespace() || c == ';' || c == ',')
						.unwrap_or(text.len() - value_start);
					if value_len > 0 {
						masked.push((value_start, value_start + value_len));
					}
				}
				from = key_end;
			}
		}
		if masked.is_empty() {
			return text.to_string();
		}
		masked.sort_unstable();
		let mut out = String::with_capacity(text.len());
		let mut cursor = 0;
		for (start, end) in masked {
			if start < cursor {
				continue;
			}
			out.push_str(&text[cursor..start]);
			out.push_str("[redacted]");
			cursor = end;
		}
		out.push_str(&text[cursor..]);
		out
	}
}

impl Sanitizer for RedactingSanitizer {
	fn sanitize_console(&self, text: &str) -> String {
		self.redact(text)
	}

	fn sanitize_network(&self, text: &str) -> String {
		self.redact(text)
	}
}

/// The driver bundle `tabops serve` starts with.
pub fn unattached_drivers() -> Drivers {
	Drivers {
		tabs: Arc::new(UnattachedTabDriver),
		debug: Arc::new(UnattachedDebugRouter),
		dom: Arc::new(UnattachedDomDriver),
		snapshots: Arc::new(UnattachedSnapshotBuilder),
		sanitizer: Arc::new(RedactingSanitizer::default()),
	}
}
