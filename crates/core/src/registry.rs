//! Session identity, lease ownership, and target membership.
//!
//! Lifecycle per session: `active --(owner disconnects)--> closing --(TTL
//! elapses)--> removed`, with `closing --(matching lease arrives)--> active`
//! as the reclaim edge. The registry owns every session exclusively;
//! handlers never hold one past their own execution.

use std::collections::HashMap;

use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::OperatingMode;
use crate::error::OpsError;
use crate::governor::{Governor, GovernorPolicy};
use crate::scheduler::SchedulerState;

/// One tab bound into a session.
#[derive(Debug, Clone)]
pub struct Target {
	pub target_id: String,
	pub tab_id: String,
	pub url: Option<String>,
	pub title: Option<String>,
}

#[derive(Debug)]
pub(crate) enum Lifecycle {
	Active,
	Closing {
		reason: String,
		expires_at: Instant,
	},
}

#[derive(Debug)]
pub(crate) struct Session {
	pub id: String,
	pub lease_id: String,
	pub owner_client_id: String,
	pub mode: OperatingMode,
	pub root_tab_id: String,
	pub root_target_id: String,
	pub active_target_id: String,
	pub targets: HashMap<String, Target>,
	/// `page.open` alias layer over the target map.
	pub named_targets: HashMap<String, String>,
	pub lifecycle: Lifecycle,
	/// Abortable TTL task while `closing`.
	pub expiry_timer: Option<AbortHandle>,
	pub scheduler: SchedulerState,
	pub governor: Governor,
}

impl Session {
	pub fn is_closing(&self) -> bool {
		matches!(self.lifecycle, Lifecycle::Closing { .. })
	}

	/// Resolves the addressed target: explicit id wins, else the session's
	/// active target.
	pub fn resolve_target(&self, explicit: Option<&str>) -> Result<&Target, OpsError> {
		let target_id = explicit.unwrap_or(&self.active_target_id);
		self.targets.get(target_id).ok_or_else(|| {
			OpsError::InvalidRequest(format!("no such target: {target_id}"))
		})
	}
}

/// Result of removing a target from a session.
pub(crate) enum Cascade {
	/// Non-root target removed while others remain; no event, no teardown.
	TargetRemoved,
	/// Root or last target removed; the whole session was detached from the
	/// registry and must be torn down by the caller.
	SessionRemoved(Box<Session>),
}

pub(crate) struct Registry {
	sessions: HashMap<String, Session>,
	next_seq: u64,
}

impl Registry {
	pub fn new() -> Self {
		Self {
			sessions: HashMap::new(),
			next_seq: 1,
		}
	}

	fn next_token(&mut self, prefix: &str) -> String {
		let seq = self.next_seq;
		self.next_seq += 1;
		format!("{prefix}-{seq}-{}", Uuid::new_v4().simple())
	}

	pub fn create_session(
		&mut self,
		client_id: &str,
		mode: OperatingMode,
		policy: GovernorPolicy,
		root: Target,
	) -> &Session {
		let id = self.next_token("ops");
		let lease_id = self.next_token("lease");
		let session = Session {
			id: id.clone(),
			lease_id,
			owner_client_id: client_id.to_string(),
			mode,
			root_tab_id: root.tab_id.clone(),
			root_target_id: root.target_id.clone(),
			active_target_id: root.target_id.clone(),
			targets: HashMap::from([(root.target_id.clone(), root)]),
			named_targets: HashMap::new(),
			lifecycle: Lifecycle::Active,
			expiry_timer: None,
			scheduler: SchedulerState::new(),
			governor: Governor::new(policy, mode),
		};
		debug!(target = "tabops.registry", session = %id, owner = client_id, "session created");
		self.sessions.entry(id).or_insert(session)
	}

	pub fn get(&self, session_id: &str) -> Option<&Session> {
		self.sessions.get(session_id)
	}

	pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Session> {
		self.sessions.get_mut(session_id)
	}

	pub fn session_ids(&self) -> Vec<String> {
		self.sessions.keys().cloned().collect()
	}

	/// Looks a tab up across all sessions; used by host-side close/detach
	/// notifications that only carry the tab id.
	pub fn find_target_by_tab(&self, tab_id: &str) -> Option<(String, String)> {
		for session in self.sessions.values() {
			for target in session.targets.values() {
				if target.tab_id == tab_id {
					return Some((session.id.clone(), target.target_id.clone()));
				}
			}
		}
		None
	}

	pub fn session_ids_owned_by(&self, client_id: &str) -> Vec<String> {
		self.sessions
			.values()
			.filter(|s| s.owner_client_id == client_id && !s.is_closing())
			.map(|s| s.id.clone())
			.collect()
	}

	/// Validates `opsSessionId` + lease + owner, reclaiming a `closing`
	/// session when the presented lease matches.
	///
	/// The lease alone is never sufficient on an `active` session: owner
	/// must agree too, so a stale lease replayed from a different client id
	/// cannot bypass the reclaim edge.
	pub fn resolve(
		&mut self,
		session_id: &str,
		lease_id: Option<&str>,
		client_id: &str,
	) -> Result<&mut Session, OpsError> {
		let session = self
			.sessions
			.get_mut(session_id)
			.ok_or_else(|| OpsError::InvalidSession(session_id.to_string()))?;

		let lease_matches = lease_id.is_some_and(|lease| lease == session.lease_id);
		if !lease_matches {
			return Err(OpsError::NotOwner(session_id.to_string()));
		}

		if session.is_closing() {
			// Reclaim: the matching lease re-binds ownership to the caller.
			session.owner_client_id = client_id.to_string();
			session.lifecycle = Lifecycle::Active;
			if let Some(timer) = session.expiry_timer.take() {
				timer.abort();
			}
			debug!(
				target = "tabops.registry",
				session = session_id,
				owner = client_id,
				"session reclaimed"
			);
		} else if session.owner_client_id != client_id {
			return Err(OpsError::NotOwner(session_id.to_string()));
		}

		Ok(session)
	}

	/// Marks a session `closing`; the caller arms the TTL timer and stores
	/// its handle. No-op if already closing.
	pub fn mark_closing(&mut self, session_id: &str, reason: &str, expires_at: Instant) -> bool {
		let Some(session) = self.sessions.get_mut(session_id) else {
			return false;
		};
		if session.is_closing() {
			return false;
		}
		session.lifecycle = Lifecycle::Closing {
			reason: reason.to_string(),
			expires_at,
		};
		debug!(target = "tabops.registry", session = session_id, reason, "session closing");
		true
	}

	/// Detaches a session from the registry for teardown.
	pub fn take_session(&mut self, session_id: &str) -> Option<Session> {
		self.sessions.remove(session_id)
	}

	/// Removes a target, applying the asymmetric cascade rule: removing a
	/// non-root target while at least one other remains only deletes the
	/// entry; removing the root target, or the last remaining one, detaches
	/// the whole session.
	pub fn remove_target(&mut self, session_id: &str, target_id: &str) -> Option<Cascade> {
		let session = self.sessions.get_mut(session_id)?;
		if !session.targets.contains_key(target_id) {
			return None;
		}

		let is_root = target_id == session.root_target_id;
		let is_last = session.targets.len() == 1;
		if is_root || is_last {
			let session = self.sessions.remove(session_id)?;
			return Some(Cascade::SessionRemoved(Box::new(session)));
		}

		session.targets.remove(target_id);
		session.named_targets.retain(|_, id| id != target_id);
		if session.active_target_id == target_id {
			session.active_target_id = session.root_target_id.clone();
		}
		debug!(target = "tabops.registry", session = session_id, target_id, "target removed");
		Some(Cascade::TargetRemoved)
	}
}
