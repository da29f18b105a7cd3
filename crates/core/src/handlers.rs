//! Command handlers. Each receives validated payloads and collaborator
//! handles for the duration of the call only; sessions are never held
//! across a handler's execution.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::debug;

use crate::commands::{
	AttrPayload, CommandName, Cookie, CookiesGetPayload, CookiesSetPayload, LaunchPayload,
	NavigatePayload, PageClosePayload, PageOpenPayload, PressPayload, ScreenshotPayload,
	ScrollPayload, SelectPayload, SelectorPayload, SnapshotPayload, TargetActivatePayload,
	TypePayload, WaitForPayload, WaitState, parse_payload,
};
use crate::config::OperatingMode;
use crate::drivers::{DomAccessor, DriverError};
use crate::engine::Engine;
use crate::error::OpsError;
use crate::registry::Target;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maps a collaborator failure to its wire code. Anything without a more
/// specific meaning becomes `execution_failed`.
fn map_driver(err: DriverError) -> OpsError {
	if err.unavailable {
		OpsError::OpsUnavailable(err.message)
	} else {
		OpsError::ExecutionFailed(err.message)
	}
}

/// `browser.launch` / `browser.connect`: creates a session around a fresh
/// root tab. Returns the new session id alongside the response payload.
pub(crate) async fn bootstrap(
	engine: &Engine,
	client_id: &str,
	command: CommandName,
	payload: &Value,
) -> Result<(String, Value), OpsError> {
	let request: LaunchPayload = parse_payload(payload)?;
	let mode = request.mode.unwrap_or(match command {
		CommandName::BrowserConnect => OperatingMode::CdpConnectHeadless,
		_ => engine.config().default_mode,
	});

	let tab = engine
		.drivers()
		.tabs
		.create_tab(request.url.as_deref())
		.await
		.map_err(map_driver)?;
	let target_id = engine
		.drivers()
		.debug
		.attach(&tab.tab_id)
		.await
		.map_err(|err| OpsError::CdpAttachFailed(err.message))?;

	let root = Target {
		target_id: target_id.clone(),
		tab_id: tab.tab_id.clone(),
		url: tab.url,
		title: tab.title,
	};
	let (session_id, lease_id) = {
		let mut registry = engine.registry().lock();
		let session = registry.create_session(
			client_id,
			mode,
			engine.config().governor.clone(),
			root,
		);
		(session.id.clone(), session.lease_id.clone())
	};
	debug!(target = "tabops.handlers", session = %session_id, ?mode, "session launched");

	let response = json!({
		"opsSessionId": session_id,
		"leaseId": lease_id,
		"targetId": target_id,
		"tabId": tab.tab_id,
		"mode": mode,
	});
	Ok((session_id, response))
}

pub(crate) async fn run_session_command(
	engine: &Engine,
	session_id: &str,
	command: CommandName,
	payload: &Value,
) -> Result<Value, OpsError> {
	match command {
		CommandName::SessionStatus => session_status(engine, session_id),
		CommandName::TargetsList => targets_list(engine, session_id),
		CommandName::TargetActivate => target_activate(engine, session_id, payload).await,
		CommandName::PageOpen => page_open(engine, session_id, payload).await,
		CommandName::PageList => page_list(engine, session_id),
		CommandName::PageClose => page_close(engine, session_id, payload).await,
		// Teardown is deferred past response delivery; see dispatch::run.
		CommandName::BrowserDisconnect => Ok(json!({ "ok": true })),
		other => Err(OpsError::InvalidRequest(format!(
			"{other:?} is not session-scoped"
		))),
	}
}

fn session_status(engine: &Engine, session_id: &str) -> Result<Value, OpsError> {
	let registry = engine.registry().lock();
	let session = registry
		.get(session_id)
		.ok_or_else(|| OpsError::SessionClosed(session_id.to_string()))?;
	Ok(json!({
		"opsSessionId": session.id,
		"mode": session.mode,
		"lifecycle": if session.is_closing() { "closing" } else { "active" },
		"activeTargetId": session.active_target_id,
		"targetCount": session.targets.len(),
		"inFlight": session.scheduler.in_flight,
		"pendingOps": session.scheduler.pending_ops(),
		"effectiveParallelCap": session.governor.effective_cap(),
		"pressure": session.governor.last_pressure(),
	}))
}

fn targets_list(engine: &Engine, session_id: &str) -> Result<Value, OpsError> {
	let registry = engine.registry().lock();
	let session = registry
		.get(session_id)
		.ok_or_else(|| OpsError::SessionClosed(session_id.to_string()))?;
	let targets: Vec<Value> = session
		.targets
		.values()
		.map(|t| {
			json!({
				"targetId": t.target_id,
				"tabId": t.tab_id,
				"url": t.url,
				"title": t.title,
				"isRoot": t.target_id == session.root_target_id,
				"isActive": t.target_id == session.active_target_id,
			})
		})
		.collect();
	Ok(json!({ "targets": targets }))
}

async fn target_activate(
	engine: &Engine,
	session_id: &str,
	payload: &Value,
) -> Result<Value, OpsError> {
	let request: TargetActivatePayload = parse_payload(payload)?;
	let tab_id = {
		let mut registry = engine.registry().lock();
		let session = registry
			.get_mut(session_id)
			.ok_or_else(|| OpsError::SessionClosed(session_id.to_string()))?;
		let target = session.resolve_target(Some(&request.target_id))?;
		let tab_id = target.tab_id.clone();
		session.active_target_id = request.target_id.clone();
		tab_id
	};
	engine
		.drivers()
		.tabs
		.activate_tab(&tab_id)
		.await
		.map_err(map_driver)?;
	Ok(json!({ "activeTargetId": request.target_id }))
}

async fn page_open(engine: &Engine, session_id: &str, payload: &Value) -> Result<Value, OpsError> {
	let request: PageOpenPayload = parse_payload(payload)?;
	{
		let registry = engine.registry().lock();
		let session = registry
			.get(session_id)
			.ok_or_else(|| OpsError::SessionClosed(session_id.to_string()))?;
		if session.named_targets.contains_key(&request.name) {
			return Err(OpsError::InvalidRequest(format!(
				"page name already in use: {}",
				request.name
			)));
		}
	}

	let tab = engine
		.drivers()
		.tabs
		.create_tab(request.url.as_deref())
		.await
		.map_err(map_driver)?;
	let target_id = engine
		.drivers()
		.debug
		.attach(&tab.tab_id)
		.await
		.map_err(|err| OpsError::CdpAttachFailed(err.message))?;

	let mut registry = engine.registry().lock();
	let session = registry
		.get_mut(session_id)
		.ok_or_else(|| OpsError::SessionClosed(session_id.to_string()))?;
	session.targets.insert(
		target_id.clone(),
		Target {
			target_id: target_id.clone(),
			tab_id: tab.tab_id.clone(),
			url: tab.url,
			title: tab.title,
		},
	);
	session
		.named_targets
		.insert(request.name.clone(), target_id.clone());
	Ok(json!({
		"name": request.name,
		"targetId": target_id,
		"tabId": tab.tab_id,
	}))
}

fn page_list(engine: &Engine, session_id: &str) -> Result<Value, OpsError> {
	let registry = engine.registry().lock();
	let session = registry
		.get(session_id)
		.ok_or_else(|| OpsError::SessionClosed(session_id.to_string()))?;
	let mut pages: Vec<Value> = session
		.named_targets
		.iter()
		.map(|(name, target_id)| {
			let target = session.targets.get(target_id);
			json!({
				"name": name,
				"targetId": target_id,
				"url": target.and_then(|t| t.url.clone()),
				"title": target.and_then(|t| t.title.clone()),
			})
		})
		.collect();
	pages.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
	Ok(json!({ "pages": pages }))
}

async fn page_close(engine: &Engine, session_id: &str, payload: &Value) -> Result<Value, OpsError> {
	let request: PageClosePayload = parse_payload(payload)?;
	let (target_id, tab_id) = {
		let registry = engine.registry().lock();
		let session = registry
			.get(session_id)
			.ok_or_else(|| OpsError::SessionClosed(session_id.to_string()))?;
		let target_id = session
			.named_targets
			.get(&request.name)
			.cloned()
			.ok_or_else(|| {
				OpsError::InvalidRequest(format!("no such page: {}", request.name))
			})?;
		let tab_id = session
			.targets
			.get(&target_id)
			.map(|t| t.tab_id.clone())
			.ok_or_else(|| OpsError::InvalidRequest(format!("no such page: {}", request.name)))?;
		(target_id, tab_id)
	};

	engine
		.drivers()
		.tabs
		.close_tab(&tab_id)
		.await
		.map_err(map_driver)?;
	// Same cascade rule as any other removal: closing the last alias-bound
	// target may tear the session down.
	engine.target_detached(session_id, &target_id).await;
	Ok(json!({ "closed": request.name }))
}

pub(crate) async fn run_target_command(
	engine: &Engine,
	session_id: &str,
	target_id: &str,
	tab_id: &str,
	command: CommandName,
	payload: &Value,
) -> Result<Value, OpsError> {
	let dom = &engine.drivers().dom;
	match command {
		CommandName::PageNavigate => {
			let request: NavigatePayload = parse_payload(payload)?;
			engine.config().url_policy.check(&request.url)?;
			engine
				.drivers()
				.debug
				.send(target_id, "Page.navigate", json!({ "url": request.url }))
				.await
				.map_err(map_driver)?;
			let settled = engine
				.drivers()
				.tabs
				.wait_for_settle(tab_id, request.timeout_ms)
				.await
				.map_err(map_driver)?;
			if !settled {
				return Err(OpsError::Timeout {
					ms: request.timeout_ms,
					condition: format!("navigation to {}", request.url),
				});
			}
			if let Some(session) = engine.registry().lock().get_mut(session_id) {
				if let Some(target) = session.targets.get_mut(target_id) {
					target.url = Some(request.url.clone());
				}
			}
			Ok(json!({ "url": request.url, "settled": true }))
		}
		CommandName::PageWaitFor => {
			let request: WaitForPayload = parse_payload(payload)?;
			let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
			loop {
				let state = dom
					.element_state(target_id, &request.selector)
					.await
					.map_err(map_driver)?;
				let satisfied = match request.state {
					WaitState::Attached => state.attached,
					WaitState::Visible => state.visible,
				};
				if satisfied {
					return Ok(json!({ "selector": request.selector, "satisfied": true }));
				}
				if Instant::now() + WAIT_POLL_INTERVAL > deadline {
					return Err(OpsError::Timeout {
						ms: request.timeout_ms,
						condition: format!("selector {} to become {:?}", request.selector, request.state),
					});
				}
				tokio::time::sleep(WAIT_POLL_INTERVAL).await;
			}
		}
		CommandName::PageSnapshot => {
			let request: SnapshotPayload = parse_payload(payload)?;
			let snapshot = engine
				.drivers()
				.snapshots
				.build(target_id, request.mode)
				.await
				.map_err(map_driver)?;
			let assembled = snapshot.lines.join("\n");
			let limit = engine.config().limits.max_snapshot_bytes;
			if assembled.len() > limit {
				return Err(OpsError::SnapshotTooLarge {
					size: assembled.len(),
					limit,
				});
			}
			Ok(json!({
				"lines": snapshot.lines,
				"refs": snapshot.refs,
				"warnings": snapshot.warnings,
			}))
		}
		CommandName::PageScreenshot => {
			let request: ScreenshotPayload = parse_payload(payload)?;
			let params = json!({
				"format": request.format,
				"captureBeyondViewport": request.full_page,
			});
			let capture = engine
				.drivers()
				.debug
				.send(target_id, "Page.captureScreenshot", params);
			match tokio::time::timeout(Duration::from_millis(request.timeout_ms), capture).await {
				Ok(result) => result.map_err(map_driver),
				Err(_) => Err(OpsError::Timeout {
					ms: request.timeout_ms,
					condition: "screenshot capture".to_string(),
				}),
			}
		}
		CommandName::PageMetrics => engine
			.drivers()
			.debug
			.send(target_id, "Performance.getMetrics", json!({}))
			.await
			.map_err(map_driver),
		CommandName::CookiesGet => {
			let request: CookiesGetPayload = parse_payload(payload)?;
			engine
				.drivers()
				.debug
				.send(target_id, "Network.getCookies", json!({ "urls": request.urls }))
				.await
				.map_err(map_driver)
		}
		CommandName::CookiesSet => {
			let request: CookiesSetPayload = parse_payload(payload)?;
			let cookies: Vec<Cookie> = request.cookies;
			let count = cookies.len();
			engine
				.drivers()
				.debug
				.send(target_id, "Network.setCookies", json!({ "cookies": cookies }))
				.await
				.map_err(map_driver)?;
			Ok(json!({ "set": count }))
		}
		CommandName::DomClick => {
			let request: SelectorPayload = parse_payload(payload)?;
			dom.click(target_id, &request.selector)
				.await
				.map_err(map_driver)?;
			Ok(json!({ "ok": true }))
		}
		CommandName::DomHover => {
			let request: SelectorPayload = parse_payload(payload)?;
			dom.hover(target_id, &request.selector)
				.await
				.map_err(map_driver)?;
			Ok(json!({ "ok": true }))
		}
		CommandName::DomPress => {
			let request: PressPayload = parse_payload(payload)?;
			dom.press(target_id, &request.selector, &request.key)
				.await
				.map_err(map_driver)?;
			Ok(json!({ "ok": true }))
		}
		CommandName::DomCheck | CommandName::DomUncheck => {
			let request: SelectorPayload = parse_payload(payload)?;
			let checked = command == CommandName::DomCheck;
			dom.set_checked(target_id, &request.selector, checked)
				.await
				.map_err(map_driver)?;
			Ok(json!({ "checked": checked }))
		}
		CommandName::DomType => {
			let request: TypePayload = parse_payload(payload)?;
			dom.type_text(target_id, &request.selector, &request.text)
				.await
				.map_err(map_driver)?;
			Ok(json!({ "ok": true }))
		}
		CommandName::DomSelect => {
			let request: SelectPayload = parse_payload(payload)?;
			dom.select_option(target_id, &request.selector, &request.value)
				.await
				.map_err(map_driver)?;
			Ok(json!({ "ok": true }))
		}
		CommandName::DomScroll => {
			let request: ScrollPayload = parse_payload(payload)?;
			dom.scroll(target_id, request.dx, request.dy)
				.await
				.map_err(map_driver)?;
			Ok(json!({ "ok": true }))
		}
		CommandName::DomScrollIntoView => {
			let request: SelectorPayload = parse_payload(payload)?;
			dom.scroll_into_view(target_id, &request.selector)
				.await
				.map_err(map_driver)?;
			Ok(json!({ "ok": true }))
		}
		CommandName::DomHtml
		| CommandName::DomText
		| CommandName::DomValue
		| CommandName::DomVisible
		| CommandName::DomEnabled
		| CommandName::DomChecked => {
			let request: SelectorPayload = parse_payload(payload)?;
			let accessor = match command {
				CommandName::DomHtml => DomAccessor::Html,
				CommandName::DomText => DomAccessor::Text,
				CommandName::DomValue => DomAccessor::Value,
				CommandName::DomVisible => DomAccessor::Visible,
				CommandName::DomEnabled => DomAccessor::Enabled,
				_ => DomAccessor::Checked,
			};
			let value = dom
				.read(target_id, &request.selector, accessor, None)
				.await
				.map_err(map_driver)?;
			Ok(json!({ "value": value }))
		}
		CommandName::DomAttr => {
			let request: AttrPayload = parse_payload(payload)?;
			let value = dom
				.read(target_id, &request.selector, DomAccessor::Attr, Some(&request.name))
				.await
				.map_err(map_driver)?;
			Ok(json!({ "value": value }))
		}
		other => Err(OpsError::InvalidRequest(format!(
			"{other:?} is not target-scoped"
		))),
	}
}
