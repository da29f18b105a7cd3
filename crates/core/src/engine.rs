//! Engine orchestration: request admission, slot lifecycle, session
//! lifecycle timers, and teardown.
//!
//! All scheduling state lives in the registry behind one lock; nothing
//! here awaits while holding it. Parked admissions are settled through
//! one-shot channels from the completion, timeout, and teardown paths.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use tabops_protocol::{Envelope, EventName};

use crate::config::EngineConfig;
use crate::dispatch;
use crate::drivers::{Drivers, EventSink};
use crate::error::OpsError;
use crate::framing::{frame_error, frame_response};
use crate::governor::ResourceSampler;
use crate::registry::{Cascade, Registry, Session};
use crate::scheduler::{BackpressureInfo, Waiter};

#[derive(Clone)]
pub struct Engine {
	inner: Arc<Inner>,
}

struct Inner {
	config: EngineConfig,
	registry: Mutex<Registry>,
	drivers: Drivers,
	sampler: Arc<dyn ResourceSampler>,
	events: Arc<dyn EventSink>,
}

/// A request past the synchronous admission phase. Its queue positions are
/// already claimed; dropping one without serving it would stall the queue.
pub struct AdmittedRequest {
	request_id: String,
	client_id: String,
	command: String,
	op: dispatch::Admitted,
}

/// One served request: the envelopes to write, plus any teardown that must
/// run only after they are handed to the client writer.
pub struct RequestOutput {
	pub envelopes: Vec<Envelope>,
	pub deferred: Option<Teardown>,
}

/// Session teardown deferred past response delivery.
pub struct Teardown {
	session_id: String,
}

impl Teardown {
	pub(crate) fn for_session(session_id: &str) -> Self {
		Self {
			session_id: session_id.to_string(),
		}
	}
}

impl Engine {
	pub fn new(
		config: EngineConfig,
		drivers: Drivers,
		sampler: Arc<dyn ResourceSampler>,
		events: Arc<dyn EventSink>,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				config,
				registry: Mutex::new(Registry::new()),
				drivers,
				sampler,
				events,
			}),
		}
	}

	pub fn config(&self) -> &EngineConfig {
		&self.inner.config
	}

	pub(crate) fn registry(&self) -> &Mutex<Registry> {
		&self.inner.registry
	}

	pub(crate) fn drivers(&self) -> &Drivers {
		&self.inner.drivers
	}

	/// Synchronous admission phase. Validates the request shape and, for
	/// scoped commands, claims the session or target queue position at
	/// arrival, so calling this in transport order fixes start order even
	/// when the async phases run on separate tasks.
	pub fn admit_request(
		&self,
		client_id: &str,
		request_id: &str,
		ops_session_id: Option<&str>,
		lease_id: Option<&str>,
		command: &str,
		payload: Value,
	) -> AdmittedRequest {
		AdmittedRequest {
			request_id: request_id.to_string(),
			client_id: client_id.to_string(),
			command: command.to_string(),
			op: dispatch::admit(self, client_id, ops_session_id, lease_id, command, payload),
		}
	}

	/// Async phase: runs an admitted request to completion and frames
	/// every envelope it produces. Always yields exactly one terminal
	/// response or error; any deferred teardown rides alongside so the
	/// caller can fire it after the envelopes reach the client writer.
	pub async fn serve_admitted(&self, admitted: AdmittedRequest) -> RequestOutput {
		let AdmittedRequest {
			request_id,
			client_id,
			command,
			op,
		} = admitted;
		let (session_id, outcome, deferred) = dispatch::run(self, &client_id, op).await;
		let envelopes = match outcome {
			Ok(value) => {
				let session_id = session_id.unwrap_or_default();
				frame_response(
					&request_id,
					&client_id,
					&session_id,
					value,
					self.inner.config.limits.max_payload_bytes,
				)
			}
			Err(err) => {
				debug!(
					target = "tabops.engine",
					request_id = %request_id,
					command = %command,
					code = %err.code(),
					"request failed"
				);
				vec![frame_error(&request_id, &client_id, session_id, &err)]
			}
		};
		RequestOutput { envelopes, deferred }
	}

	/// Admits and serves in one call. The caller still owns any deferred
	/// teardown; see [`Engine::run_deferred`].
	pub async fn handle_request(
		&self,
		client_id: &str,
		request_id: &str,
		ops_session_id: Option<&str>,
		lease_id: Option<&str>,
		command: &str,
		payload: Value,
	) -> RequestOutput {
		let admitted =
			self.admit_request(client_id, request_id, ops_session_id, lease_id, command, payload);
		self.serve_admitted(admitted).await
	}

	/// Completes teardown deferred by `browser.disconnect`. Must run only
	/// after the response envelopes are queued to the client writer, so
	/// the ok response always precedes the `ops_session_closed` event.
	pub async fn run_deferred(&self, deferred: Option<Teardown>) {
		let Some(Teardown { session_id }) = deferred else {
			return;
		};
		let session = self.inner.registry.lock().take_session(&session_id);
		if let Some(session) = session {
			self.teardown(session, EventName::OpsSessionClosed).await;
		}
	}

	/// Gate two: global slot acquisition against the governor's cap. Parks
	/// as a waiter when over cap; the waiter settles exactly once.
	pub(crate) async fn acquire_slot(
		&self,
		session_id: &str,
		target_id: &str,
	) -> Result<(), OpsError> {
		let rx = {
			let mut registry = self.inner.registry.lock();
			let session = registry
				.get_mut(session_id)
				.ok_or_else(|| OpsError::SessionClosed(session_id.to_string()))?;

			let now = Instant::now();
			let age = session.scheduler.wait_queue_age_ms(now);
			let depth = session.scheduler.wait_queue_depth();
			let snapshot = session
				.governor
				.sample(now, age, depth, self.inner.sampler.as_ref());
			if session.scheduler.try_acquire_slot(snapshot.effective_cap) {
				return Ok(());
			}

			let (tx, rx) = oneshot::channel();
			let waiter_id = session.scheduler.park_waiter(target_id, tx, now);
			let timeout_ms = session.governor.policy().backpressure_timeout_ms;
			let engine = self.clone();
			let sid = session_id.to_string();
			let timer = tokio::spawn(async move {
				tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
				engine.expire_waiter(&sid, waiter_id);
			});
			session
				.scheduler
				.arm_waiter_timer(waiter_id, timer.abort_handle());
			rx
		};

		match rx.await {
			Ok(settled) => settled,
			Err(_) => Err(OpsError::SessionClosed(session_id.to_string())),
		}
	}

	/// Completion path: releases the slot, advances the target FIFO, and
	/// grants freed slots to parked waiters in arrival order.
	pub(crate) fn finish_target_op(&self, session_id: &str, target_id: &str) {
		let granted = {
			let mut registry = self.inner.registry.lock();
			let Some(session) = registry.get_mut(session_id) else {
				return;
			};
			session.scheduler.release_slot();
			session.scheduler.finish_turn(target_id);
			let cap = session.governor.effective_cap();
			session.scheduler.take_grantable(cap)
		};
		settle_grants(granted);
	}

	/// Abandons a turn whose slot acquisition failed, so later requests on
	/// the target are not wedged behind it.
	pub(crate) fn abandon_target_turn(&self, session_id: &str, target_id: &str) {
		let mut registry = self.inner.registry.lock();
		if let Some(session) = registry.get_mut(session_id) {
			session.scheduler.finish_turn(target_id);
		}
	}

	fn expire_waiter(&self, session_id: &str, waiter_id: u64) {
		let settled = {
			let mut registry = self.inner.registry.lock();
			let Some(session) = registry.get_mut(session_id) else {
				return;
			};
			let Some(waiter) = session.scheduler.remove_waiter(waiter_id) else {
				// Already granted or force-rejected.
				return;
			};
			let now = Instant::now();
			let info = BackpressureInfo {
				effective_parallel_cap: session.governor.effective_cap(),
				in_flight: session.scheduler.in_flight,
				wait_queue_depth: session.scheduler.wait_queue_depth() + 1,
				wait_queue_age_ms: now.duration_since(waiter.enqueued_at).as_millis() as u64,
				pressure: session.governor.last_pressure(),
				timeout_ms: session.governor.policy().backpressure_timeout_ms,
			};
			(waiter, info)
		};
		let (waiter, info) = settled;
		debug!(
			target = "tabops.engine",
			session = session_id,
			target = %waiter.target_id,
			depth = info.wait_queue_depth,
			"waiter timed out under backpressure"
		);
		let _ = waiter.tx.send(Err(OpsError::ParallelismBackpressure(info)));
	}

	// --- governor sampling ------------------------------------------------

	/// Re-samples every session's governor and attempts waiter wake where
	/// the cap moved upward. Grants stay FIFO among still-parked waiters.
	pub fn resample_sessions(&self) {
		let granted = {
			let mut registry = self.inner.registry.lock();
			let mut granted = Vec::new();
			for session_id in registry.session_ids() {
				if let Some(session) = registry.get_mut(&session_id) {
					let now = Instant::now();
					let age = session.scheduler.wait_queue_age_ms(now);
					let depth = session.scheduler.wait_queue_depth();
					let snapshot =
						session
							.governor
							.sample(now, age, depth, self.inner.sampler.as_ref());
					granted.extend(session.scheduler.take_grantable(snapshot.effective_cap));
				}
			}
			granted
		};
		settle_grants(granted);
	}

	/// Spawns the periodic re-sample loop; the server owns the handle.
	pub fn spawn_sampler(&self) -> JoinHandle<()> {
		let engine = self.clone();
		let interval_ms = engine.inner.config.governor.sample_interval_ms.max(100);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				engine.resample_sessions();
			}
		})
	}

	/// Records a host memory-saver "tab discarded" signal for the session.
	pub fn note_tab_discarded(&self, session_id: &str) {
		if let Some(session) = self.inner.registry.lock().get_mut(session_id) {
			session.governor.note_discarded();
		}
	}

	pub fn note_tab_frozen(&self, session_id: &str) {
		if let Some(session) = self.inner.registry.lock().get_mut(session_id) {
			session.governor.note_frozen();
		}
	}

	// --- session lifecycle ------------------------------------------------

	/// Transport-level client disconnect: every session owned by the client
	/// enters `closing` with the configured grace TTL.
	pub fn client_disconnected(&self, client_id: &str) {
		let grace = Duration::from_millis(self.inner.config.limits.closing_grace_ms);
		let expires_at = Instant::now() + grace;
		let mut registry = self.inner.registry.lock();
		for session_id in registry.session_ids_owned_by(client_id) {
			if !registry.mark_closing(&session_id, "owner_disconnected", expires_at) {
				continue;
			}
			let engine = self.clone();
			let sid = session_id.clone();
			let timer = tokio::spawn(async move {
				tokio::time::sleep_until(expires_at).await;
				engine.expire_session(&sid).await;
			});
			if let Some(session) = registry.get_mut(&session_id) {
				session.expiry_timer = Some(timer.abort_handle());
			}
		}
	}

	async fn expire_session(&self, session_id: &str) {
		let session = {
			let mut registry = self.inner.registry.lock();
			let expired = registry
				.get(session_id)
				.is_some_and(|session| session.is_closing());
			if expired {
				registry.take_session(session_id)
			} else {
				None
			}
		};
		if let Some(session) = session {
			debug!(target = "tabops.engine", session = session_id, "closing TTL elapsed");
			self.teardown(session, EventName::OpsSessionExpired).await;
		}
	}

	/// Tab or debugger-driven target removal; applies the asymmetric
	/// cascade rule. Returns true when the target belonged to the session.
	pub async fn target_detached(&self, session_id: &str, target_id: &str) -> bool {
		let cascade = self.inner.registry.lock().remove_target(session_id, target_id);
		match cascade {
			None => false,
			Some(Cascade::TargetRemoved) => true,
			Some(Cascade::SessionRemoved(session)) => {
				self.teardown(*session, EventName::OpsTabClosed).await;
				true
			}
		}
	}

	/// Entry point for host notifications that only know the tab id.
	pub async fn tab_closed(&self, tab_id: &str) -> bool {
		let found = {
			let registry = self.inner.registry.lock();
			registry.find_target_by_tab(tab_id)
		};
		match found {
			Some((session_id, target_id)) => self.target_detached(&session_id, &target_id).await,
			None => false,
		}
	}

	/// Full cleanup of a session already detached from the registry:
	/// cancels timers, force-rejects parked waiters, detaches remaining
	/// targets, and emits exactly one terminal event to the owner.
	async fn teardown(&self, mut session: Session, event: EventName) {
		if let Some(timer) = session.expiry_timer.take() {
			timer.abort();
		}
		for waiter in session.scheduler.drain_waiters() {
			settle_grant(waiter, Err(OpsError::SessionClosed(session.id.clone())));
		}
		// Queued FIFO turns die with the session; their receivers observe
		// the dropped sender as session_closed.
		for target in session.targets.values() {
			if let Err(err) = self.inner.drivers.debug.detach(&target.tab_id).await {
				warn!(
					target = "tabops.engine",
					session = %session.id,
					tab = %target.tab_id,
					error = %err,
					"detach failed during teardown"
				);
			}
		}
		debug!(target = "tabops.engine", session = %session.id, event = ?event, "session torn down");
		self.inner.events.deliver(Envelope::Event {
			client_id: session.owner_client_id.clone(),
			ops_session_id: session.id.clone(),
			event,
			payload: None,
		});
	}

	// --- event forwarding -------------------------------------------------

	/// Forwards captured console text to the owner after redaction.
	pub fn forward_console(&self, session_id: &str, text: &str) {
		self.forward_sanitized(session_id, text, true);
	}

	pub fn forward_network(&self, session_id: &str, text: &str) {
		self.forward_sanitized(session_id, text, false);
	}

	fn forward_sanitized(&self, session_id: &str, text: &str, console: bool) {
		let owner = {
			let registry = self.inner.registry.lock();
			registry.get(session_id).map(|s| s.owner_client_id.clone())
		};
		let Some(owner) = owner else {
			return;
		};
		let sanitizer = &self.inner.drivers.sanitizer;
		let (event, clean) = if console {
			(EventName::OpsConsole, sanitizer.sanitize_console(text))
		} else {
			(EventName::OpsNetwork, sanitizer.sanitize_network(text))
		};
		self.inner.events.deliver(Envelope::Event {
			client_id: owner,
			ops_session_id: session_id.to_string(),
			event,
			payload: Some(serde_json::json!({ "text": clean })),
		});
	}
}

fn settle_grants(granted: Vec<Waiter>) {
	for waiter in granted {
		settle_grant(waiter, Ok(()));
	}
}

fn settle_grant(mut waiter: Waiter, result: Result<(), OpsError>) {
	if let Some(timer) = waiter.timer.take() {
		timer.abort();
	}
	let _ = waiter.tx.send(result);
}
