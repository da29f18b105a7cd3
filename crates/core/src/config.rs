use serde::{Deserialize, Serialize};

/// Process-wide limits negotiated or enforced by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
	/// Largest single wire message; responses above this are chunked.
	pub max_payload_bytes: usize,
	/// Largest assembled snapshot text; larger snapshots are rejected
	/// outright rather than truncated below a usable threshold.
	pub max_snapshot_bytes: usize,
	/// Grace period a session stays `closing` after owner disconnect before
	/// forced teardown.
	pub closing_grace_ms: u64,
}

impl Default for Limits {
	fn default() -> Self {
		Self {
			max_payload_bytes: 256 * 1024,
			max_snapshot_bytes: 1024 * 1024,
			closing_grace_ms: 60_000,
		}
	}
}

/// How the browser behind a session is run and attached.
///
/// Each mode carries its own concurrency ceiling in
/// [`GovernorPolicy::mode_cap`](crate::governor::GovernorPolicy::mode_cap):
/// extension transports tolerate far less parallel tab work than a managed
/// headless browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
	HeadedManaged,
	HeadlessManaged,
	CdpConnectHeaded,
	CdpConnectHeadless,
	ExtensionHeaded,
	LegacyExtensionHeaded,
}

impl Default for OperatingMode {
	fn default() -> Self {
		OperatingMode::HeadlessManaged
	}
}

/// Navigation policy: scheme allowlist plus blocked substring patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UrlPolicy {
	pub allowed_schemes: Vec<String>,
	pub blocked_patterns: Vec<String>,
}

impl Default for UrlPolicy {
	fn default() -> Self {
		Self {
			allowed_schemes: vec!["http".into(), "https".into(), "about".into()],
			blocked_patterns: Vec::new(),
		}
	}
}

impl UrlPolicy {
	pub fn check(&self, url: &str) -> Result<(), crate::error::OpsError> {
		let scheme = url.split(':').next().unwrap_or("").to_ascii_lowercase();
		let allowed = self.allowed_schemes.iter().any(|s| *s == scheme);
		let blocked = self.blocked_patterns.iter().any(|p| url.contains(p.as_str()));
		if !allowed || blocked {
			return Err(crate::error::OpsError::RestrictedUrl(url.to_string()));
		}
		Ok(())
	}
}

/// Full engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
	pub limits: Limits,
	pub governor: crate::governor::GovernorPolicy,
	pub url_policy: UrlPolicy,
	pub default_mode: OperatingMode,
}
