//! Collaborator contracts consumed by the engine.
//!
//! The tab/DOM machinery lives elsewhere (an extension host, a CDP bridge);
//! the engine only calls through these seams. Failures cross the boundary
//! as plain strings and are normalized to `execution_failed` at dispatch
//! unless a handler maps them to something more specific.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tabops_protocol::Envelope;

/// Collaborator failure: message plus an optional hint that the tab is gone.
#[derive(Debug)]
pub struct DriverError {
	pub message: String,
	/// True when the failure means there is no attachable tab at all.
	pub unavailable: bool,
}

impl DriverError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			unavailable: false,
		}
	}

	pub fn unavailable(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			unavailable: true,
		}
	}
}

impl std::fmt::Display for DriverError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.message)
	}
}

impl std::error::Error for DriverError {}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Tab handle returned by [`TabDriver::create_tab`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
	pub tab_id: String,
	pub url: Option<String>,
	pub title: Option<String>,
}

/// Tab lifecycle primitives.
#[async_trait]
pub trait TabDriver: Send + Sync {
	async fn create_tab(&self, url: Option<&str>) -> DriverResult<TabInfo>;
	async fn activate_tab(&self, tab_id: &str) -> DriverResult<()>;
	async fn close_tab(&self, tab_id: &str) -> DriverResult<()>;
	/// Waits for the tab's in-flight navigation to settle. Returns `false`
	/// when the deadline elapsed first; the handler decides what a miss
	/// means.
	async fn wait_for_settle(&self, tab_id: &str, timeout_ms: u64) -> DriverResult<bool>;
}

/// Remote-debugging session router: attach/detach plus raw named commands.
#[async_trait]
pub trait DebugRouter: Send + Sync {
	/// Attaches the tab, returning the debug target id.
	async fn attach(&self, tab_id: &str) -> DriverResult<String>;
	async fn detach(&self, tab_id: &str) -> DriverResult<()>;
	async fn send(&self, target_id: &str, method: &str, params: Value) -> DriverResult<Value>;
}

/// DOM read accessor selector for [`DomDriver::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomAccessor {
	Html,
	Text,
	Attr,
	Value,
	Visible,
	Enabled,
	Checked,
}

/// Element attachment/visibility, reported for wait-polling.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementState {
	pub attached: bool,
	pub visible: bool,
}

/// Target-scoped interaction and read primitives against resolved selectors.
#[async_trait]
pub trait DomDriver: Send + Sync {
	async fn click(&self, target_id: &str, selector: &str) -> DriverResult<()>;
	async fn hover(&self, target_id: &str, selector: &str) -> DriverResult<()>;
	async fn press(&self, target_id: &str, selector: &str, key: &str) -> DriverResult<()>;
	async fn set_checked(&self, target_id: &str, selector: &str, checked: bool) -> DriverResult<()>;
	async fn type_text(&self, target_id: &str, selector: &str, text: &str) -> DriverResult<()>;
	async fn select_option(&self, target_id: &str, selector: &str, value: &str) -> DriverResult<()>;
	async fn scroll(&self, target_id: &str, dx: f64, dy: f64) -> DriverResult<()>;
	async fn scroll_into_view(&self, target_id: &str, selector: &str) -> DriverResult<()>;
	/// One accessor covers the whole html/text/attr/value/visible/enabled/
	/// checked family; `attr_name` only applies to [`DomAccessor::Attr`].
	async fn read(
		&self,
		target_id: &str,
		selector: &str,
		accessor: DomAccessor,
		attr_name: Option<&str>,
	) -> DriverResult<Value>;
	async fn element_state(&self, target_id: &str, selector: &str) -> DriverResult<ElementState>;
}

/// Snapshot mode flag passed through to the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
	#[default]
	Interactive,
	Full,
}

/// Builder output: ordered lines plus a parallel ref-to-selector table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOutput {
	pub lines: Vec<String>,
	pub refs: HashMap<String, String>,
	pub warnings: Vec<String>,
}

#[async_trait]
pub trait SnapshotBuilder: Send + Sync {
	async fn build(&self, target_id: &str, mode: SnapshotMode) -> DriverResult<SnapshotOutput>;
}

/// Redacts raw console/network payload text before it is buffered or
/// forwarded to a client.
pub trait Sanitizer: Send + Sync {
	fn sanitize_console(&self, text: &str) -> String;
	fn sanitize_network(&self, text: &str) -> String;
}

/// Outbound delivery seam for server-originated envelopes (terminal events,
/// console/network forwards). The server registers one per connected client.
pub trait EventSink: Send + Sync {
	fn deliver(&self, envelope: Envelope);
}

/// Bundle of collaborator handles the engine is constructed with.
#[derive(Clone)]
pub struct Drivers {
	pub tabs: Arc<dyn TabDriver>,
	pub debug: Arc<dyn DebugRouter>,
	pub dom: Arc<dyn DomDriver>,
	pub snapshots: Arc<dyn SnapshotBuilder>,
	pub sanitizer: Arc<dyn Sanitizer>,
}
