//! Test doubles for the collaborator contracts.
//!
//! Lets engine behavior be exercised without a browser behind it: fake
//! drivers record call order and simulate latency through tokio's clock,
//! so admission tests run under `start_paused` and never sleep for real.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use tabops_protocol::Envelope;

use crate::drivers::{
	DebugRouter, DomAccessor, DomDriver, DriverError, DriverResult, Drivers, ElementState,
	EventSink, Sanitizer, SnapshotBuilder, SnapshotMode, SnapshotOutput, TabDriver, TabInfo,
};
use crate::governor::ResourceSampler;

/// Sampler with settable readings.
#[derive(Default)]
pub struct StaticSampler {
	free_pct: Mutex<f64>,
	rss_mb: Mutex<f64>,
}

impl StaticSampler {
	pub fn healthy() -> Self {
		Self {
			free_pct: Mutex::new(90.0),
			rss_mb: Mutex::new(0.0),
		}
	}

	pub fn set_free_pct(&self, pct: f64) {
		*self.free_pct.lock() = pct;
	}

	pub fn set_rss_mb(&self, mb: f64) {
		*self.rss_mb.lock() = mb;
	}
}

impl ResourceSampler for StaticSampler {
	fn free_memory_pct(&self) -> f64 {
		*self.free_pct.lock()
	}

	fn rss_mb(&self) -> f64 {
		*self.rss_mb.lock()
	}
}

/// Tab driver handing out sequential tab ids.
#[derive(Default)]
pub struct FakeTabDriver {
	next_tab: AtomicUsize,
	pub closed: Mutex<Vec<String>>,
	pub activated: Mutex<Vec<String>>,
	/// When false, `wait_for_settle` reports a deadline miss.
	pub settles: Mutex<bool>,
}

impl FakeTabDriver {
	pub fn new() -> Self {
		Self {
			settles: Mutex::new(true),
			..Self::default()
		}
	}
}

#[async_trait]
impl TabDriver for FakeTabDriver {
	async fn create_tab(&self, url: Option<&str>) -> DriverResult<TabInfo> {
		let n = self.next_tab.fetch_add(1, Ordering::SeqCst) + 1;
		Ok(TabInfo {
			tab_id: format!("tab-{n}"),
			url: url.map(str::to_string),
			title: None,
		})
	}

	async fn activate_tab(&self, tab_id: &str) -> DriverResult<()> {
		self.activated.lock().push(tab_id.to_string());
		Ok(())
	}

	async fn close_tab(&self, tab_id: &str) -> DriverResult<()> {
		self.closed.lock().push(tab_id.to_string());
		Ok(())
	}

	async fn wait_for_settle(&self, _tab_id: &str, _timeout_ms: u64) -> DriverResult<bool> {
		Ok(*self.settles.lock())
	}
}

/// Debug router echoing structured results and recording every send.
#[derive(Default)]
pub struct FakeDebugRouter {
	next_target: AtomicUsize,
	pub sends: Mutex<Vec<(String, String, Value)>>,
	pub detached: Mutex<Vec<String>>,
	/// When set, `attach` fails with this message.
	pub attach_error: Mutex<Option<String>>,
	/// Canned result per method name; everything else echoes.
	pub responses: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl DebugRouter for FakeDebugRouter {
	async fn attach(&self, tab_id: &str) -> DriverResult<String> {
		if let Some(message) = self.attach_error.lock().clone() {
			return Err(DriverError::new(message));
		}
		let n = self.next_target.fetch_add(1, Ordering::SeqCst) + 1;
		Ok(format!("target-{n}-{tab_id}"))
	}

	async fn detach(&self, tab_id: &str) -> DriverResult<()> {
		self.detached.lock().push(tab_id.to_string());
		Ok(())
	}

	async fn send(&self, target_id: &str, method: &str, params: Value) -> DriverResult<Value> {
		self.sends
			.lock()
			.push((target_id.to_string(), method.to_string(), params));
		if let Some(canned) = self.responses.lock().get(method) {
			return Ok(canned.clone());
		}
		Ok(json!({ "method": method, "ok": true }))
	}
}

/// DOM driver that records call start order and simulates per-call latency
/// through the tokio clock, for admission-order assertions.
#[derive(Default)]
pub struct FakeDomDriver {
	/// Labels of interaction calls, pushed at call start.
	pub started: Mutex<Vec<String>>,
	pub delay: Mutex<Duration>,
	active: AtomicUsize,
	pub max_active: AtomicUsize,
	pub element: Mutex<ElementStateScript>,
}

/// Scripted element states for wait-polling: pops from the front, repeats
/// the last entry once exhausted.
pub struct ElementStateScript(Vec<ElementState>);

impl Default for ElementStateScript {
	fn default() -> Self {
		Self(vec![ElementState {
			attached: true,
			visible: true,
		}])
	}
}

impl FakeDomDriver {
	pub fn with_delay(delay: Duration) -> Self {
		Self {
			delay: Mutex::new(delay),
			..Self::default()
		}
	}

	pub fn script_element_states(&self, states: Vec<ElementState>) {
		*self.element.lock() = ElementStateScript(states);
	}

	async fn interact(&self, label: String) -> DriverResult<()> {
		self.started.lock().push(label);
		let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_active.fetch_max(active, Ordering::SeqCst);
		let delay = *self.delay.lock();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		self.active.fetch_sub(1, Ordering::SeqCst);
		Ok(())
	}
}

#[async_trait]
impl DomDriver for FakeDomDriver {
	async fn click(&self, _target_id: &str, selector: &str) -> DriverResult<()> {
		self.interact(format!("click:{selector}")).await
	}

	async fn hover(&self, _target_id: &str, selector: &str) -> DriverResult<()> {
		self.interact(format!("hover:{selector}")).await
	}

	async fn press(&self, _target_id: &str, selector: &str, key: &str) -> DriverResult<()> {
		self.interact(format!("press:{selector}:{key}")).await
	}

	async fn set_checked(
		&self,
		_target_id: &str,
		selector: &str,
		checked: bool,
	) -> DriverResult<()> {
		self.interact(format!("check:{selector}:{checked}")).await
	}

	async fn type_text(&self, _target_id: &str, selector: &str, text: &str) -> DriverResult<()> {
		self.interact(format!("type:{selector}:{text}")).await
	}

	async fn select_option(
		&self,
		_target_id: &str,
		selector: &str,
		value: &str,
	) -> DriverResult<()> {
		self.interact(format!("select:{selector}:{value}")).await
	}

	async fn scroll(&self, _target_id: &str, dx: f64, dy: f64) -> DriverResult<()> {
		self.interact(format!("scroll:{dx}:{dy}")).await
	}

	async fn scroll_into_view(&self, _target_id: &str, selector: &str) -> DriverResult<()> {
		self.interact(format!("scroll_into_view:{selector}")).await
	}

	async fn read(
		&self,
		_target_id: &str,
		selector: &str,
		accessor: DomAccessor,
		attr_name: Option<&str>,
	) -> DriverResult<Value> {
		self.interact(format!("read:{selector}:{accessor:?}")).await?;
		Ok(match accessor {
			DomAccessor::Visible | DomAccessor::Enabled | DomAccessor::Checked => json!(true),
			DomAccessor::Attr => json!(format!("attr:{}", attr_name.unwrap_or(""))),
			_ => json!(format!("{selector} content")),
		})
	}

	async fn element_state(&self, _target_id: &str, _selector: &str) -> DriverResult<ElementState> {
		let mut script = self.element.lock();
		if script.0.len() > 1 {
			Ok(script.0.remove(0))
		} else {
			Ok(script.0[0])
		}
	}
}

/// Snapshot builder with settable output.
pub struct FakeSnapshotBuilder {
	pub output: Mutex<SnapshotOutput>,
}

impl Default for FakeSnapshotBuilder {
	fn default() -> Self {
		Self {
			output: Mutex::new(SnapshotOutput {
				lines: vec!["- button \"Go\" [ref=e1]".to_string()],
				refs: HashMap::from([("e1".to_string(), "#go".to_string())]),
				warnings: Vec::new(),
			}),
		}
	}
}

impl FakeSnapshotBuilder {
	pub fn set_lines(&self, lines: Vec<String>) {
		self.output.lock().lines = lines;
	}
}

#[async_trait]
impl SnapshotBuilder for FakeSnapshotBuilder {
	async fn build(&self, _target_id: &str, _mode: SnapshotMode) -> DriverResult<SnapshotOutput> {
		let output = self.output.lock();
		Ok(SnapshotOutput {
			lines: output.lines.clone(),
			refs: output.refs.clone(),
			warnings: output.warnings.clone(),
		})
	}
}

/// Replaces the literal `secret` with a redaction marker.
pub struct MarkerSanitizer;

impl Sanitizer for MarkerSanitizer {
	fn sanitize_console(&self, text: &str) -> String {
		text.replace("secret", "[redacted]")
	}

	fn sanitize_network(&self, text: &str) -> String {
		text.replace("secret", "[redacted]")
	}
}

/// Sink that records every delivered envelope.
#[derive(Default)]
pub struct RecordingEventSink {
	pub delivered: Mutex<Vec<Envelope>>,
}

impl RecordingEventSink {
	pub fn take(&self) -> Vec<Envelope> {
		std::mem::take(&mut self.delivered.lock())
	}
}

impl EventSink for RecordingEventSink {
	fn deliver(&self, envelope: Envelope) {
		self.delivered.lock().push(envelope);
	}
}

/// Bundles fakes into a [`Drivers`] set, returning the handles tests poke.
pub struct FakeWorld {
	pub tabs: Arc<FakeTabDriver>,
	pub debug: Arc<FakeDebugRouter>,
	pub dom: Arc<FakeDomDriver>,
	pub snapshots: Arc<FakeSnapshotBuilder>,
	pub sink: Arc<RecordingEventSink>,
	pub sampler: Arc<StaticSampler>,
}

impl FakeWorld {
	pub fn new() -> Self {
		Self {
			tabs: Arc::new(FakeTabDriver::new()),
			debug: Arc::new(FakeDebugRouter::default()),
			dom: Arc::new(FakeDomDriver::default()),
			snapshots: Arc::new(FakeSnapshotBuilder::default()),
			sink: Arc::new(RecordingEventSink::default()),
			sampler: Arc::new(StaticSampler::healthy()),
		}
	}

	pub fn drivers(&self) -> Drivers {
		Drivers {
			tabs: self.tabs.clone(),
			debug: self.debug.clone(),
			dom: self.dom.clone(),
			snapshots: self.snapshots.clone(),
			sanitizer: Arc::new(MarkerSanitizer),
		}
	}
}

impl Default for FakeWorld {
	fn default() -> Self {
		Self::new()
	}
}
