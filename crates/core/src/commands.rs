//! Command names, scopes, and typed request payloads.
//!
//! Payloads are validated exactly once, at the dispatch boundary, before a
//! handler ever sees them. Unknown commands and malformed payloads fail
//! `invalid_request`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::OperatingMode;
use crate::drivers::SnapshotMode;
use crate::error::OpsError;

/// Whether a command runs on the session control lane or goes through
/// two-gate target admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
	Session,
	Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
	BrowserLaunch,
	BrowserConnect,
	BrowserDisconnect,
	SessionStatus,
	TargetsList,
	TargetActivate,
	PageOpen,
	PageList,
	PageClose,
	PageNavigate,
	PageWaitFor,
	PageSnapshot,
	PageScreenshot,
	PageMetrics,
	CookiesGet,
	CookiesSet,
	DomClick,
	DomHover,
	DomPress,
	DomCheck,
	DomUncheck,
	DomType,
	DomSelect,
	DomScroll,
	DomScrollIntoView,
	DomHtml,
	DomText,
	DomAttr,
	DomValue,
	DomVisible,
	DomEnabled,
	DomChecked,
}

impl CommandName {
	pub fn parse(name: &str) -> Option<Self> {
		Some(match name {
			"browser.launch" => Self::BrowserLaunch,
			"browser.connect" => Self::BrowserConnect,
			"browser.disconnect" => Self::BrowserDisconnect,
			"session.status" => Self::SessionStatus,
			"targets.list" => Self::TargetsList,
			"target.activate" => Self::TargetActivate,
			"page.open" => Self::PageOpen,
			"page.list" => Self::PageList,
			"page.close" => Self::PageClose,
			"page.navigate" => Self::PageNavigate,
			"page.waitFor" => Self::PageWaitFor,
			"page.snapshot" => Self::PageSnapshot,
			"page.screenshot" => Self::PageScreenshot,
			"page.metrics" => Self::PageMetrics,
			"cookies.get" => Self::CookiesGet,
			"cookies.set" => Self::CookiesSet,
			"dom.click" => Self::DomClick,
			"dom.hover" => Self::DomHover,
			"dom.press" => Self::DomPress,
			"dom.check" => Self::DomCheck,
			"dom.uncheck" => Self::DomUncheck,
			"dom.type" => Self::DomType,
			"dom.select" => Self::DomSelect,
			"dom.scroll" => Self::DomScroll,
			"dom.scrollIntoView" => Self::DomScrollIntoView,
			"dom.html" => Self::DomHtml,
			"dom.text" => Self::DomText,
			"dom.attr" => Self::DomAttr,
			"dom.value" => Self::DomValue,
			"dom.visible" => Self::DomVisible,
			"dom.enabled" => Self::DomEnabled,
			"dom.checked" => Self::DomChecked,
			_ => return None,
		})
	}

	/// Control-plane calls are cheap bookkeeping: they bypass the governor
	/// and never consume concurrency budget.
	pub fn scope(self) -> Scope {
		match self {
			Self::BrowserLaunch
			| Self::BrowserConnect
			| Self::BrowserDisconnect
			| Self::SessionStatus
			| Self::TargetsList
			| Self::TargetActivate
			| Self::PageOpen
			| Self::PageList
			| Self::PageClose => Scope::Session,
			_ => Scope::Target,
		}
	}

	/// Commands that create a session instead of addressing one.
	pub fn is_bootstrap(self) -> bool {
		matches!(self, Self::BrowserLaunch | Self::BrowserConnect)
	}
}

/// Parses a typed payload, mapping serde failures to `invalid_request`.
pub fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, OpsError> {
	serde_json::from_value(payload.clone())
		.map_err(|err| OpsError::InvalidRequest(format!("invalid payload: {err}")))
}

/// Pulls the optional explicit `targetId` off a raw target-scoped payload.
pub fn explicit_target_id(payload: &Value) -> Option<String> {
	payload
		.get("targetId")
		.and_then(Value::as_str)
		.map(str::to_string)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchPayload {
	pub mode: Option<OperatingMode>,
	pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigatePayload {
	pub url: String,
	#[serde(default = "default_navigate_timeout")]
	pub timeout_ms: u64,
}

fn default_navigate_timeout() -> u64 {
	30_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
	Attached,
	Visible,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForPayload {
	pub selector: String,
	#[serde(default = "default_wait_state")]
	pub state: WaitState,
	#[serde(default = "default_wait_timeout")]
	pub timeout_ms: u64,
}

fn default_wait_state() -> WaitState {
	WaitState::Visible
}

fn default_wait_timeout() -> u64 {
	10_000
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotPayload {
	pub mode: SnapshotMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotPayload {
	#[serde(default = "default_screenshot_format")]
	pub format: String,
	#[serde(default)]
	pub full_page: bool,
	#[serde(default = "default_screenshot_timeout")]
	pub timeout_ms: u64,
}

fn default_screenshot_format() -> String {
	"png".to_string()
}

fn default_screenshot_timeout() -> u64 {
	15_000
}

/// Shared shape for the single-selector interactions and reads.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorPayload {
	pub selector: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressPayload {
	pub selector: String,
	pub key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypePayload {
	pub selector: String,
	pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectPayload {
	pub selector: String,
	pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPayload {
	#[serde(default)]
	pub dx: f64,
	#[serde(default)]
	pub dy: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttrPayload {
	pub selector: String,
	pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
	pub name: String,
	pub value: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub domain: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(default)]
	pub secure: bool,
	#[serde(default)]
	pub http_only: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CookiesGetPayload {
	pub urls: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookiesSetPayload {
	pub cookies: Vec<Cookie>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageOpenPayload {
	pub name: String,
	#[serde(default)]
	pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageClosePayload {
	pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetActivatePayload {
	pub target_id: String,
}
