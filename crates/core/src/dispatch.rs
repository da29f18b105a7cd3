//! Dispatch router: maps inbound requests to handlers and the admission
//! path their scope requires.
//!
//! Admission is split in two. [`admit`] runs synchronously at arrival and
//! claims queue positions under the registry lock, so per-target start
//! order follows transport order no matter how the async phases interleave.
//! [`run`] then awaits the claimed turn, takes a slot where the scope needs
//! one, and invokes the handler. Session-scoped commands run on the
//! session's control FIFO and never consume concurrency budget;
//! target-scoped commands pass two gates in order: the target's FIFO turn,
//! then a global slot under the governor's cap. Registry and scheduler
//! errors propagate untouched so the caller sees the precise code.

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::commands::{CommandName, Scope, explicit_target_id};
use crate::engine::{Engine, Teardown};
use crate::error::OpsError;
use crate::handlers;

/// A request with its queue positions claimed.
pub(crate) enum Admitted {
	Invalid {
		session_id: Option<String>,
		error: OpsError,
	},
	Bootstrap {
		name: CommandName,
		payload: Value,
	},
	Control {
		session_id: String,
		name: CommandName,
		payload: Value,
		turn: Option<oneshot::Receiver<()>>,
	},
	Target {
		session_id: String,
		target_id: String,
		tab_id: String,
		name: CommandName,
		payload: Value,
		turn: Option<oneshot::Receiver<()>>,
	},
}

/// Synchronous phase: validates shape, resolves session and target, and
/// claims the FIFO position for scoped commands.
pub(crate) fn admit(
	engine: &Engine,
	client_id: &str,
	ops_session_id: Option<&str>,
	lease_id: Option<&str>,
	command: &str,
	payload: Value,
) -> Admitted {
	let Some(name) = CommandName::parse(command) else {
		return Admitted::Invalid {
			session_id: ops_session_id.map(str::to_string),
			error: OpsError::InvalidRequest(format!("unknown command: {command}")),
		};
	};

	if name.is_bootstrap() {
		return Admitted::Bootstrap { name, payload };
	}

	let Some(session_id) = ops_session_id else {
		return Admitted::Invalid {
			session_id: None,
			error: OpsError::InvalidRequest("opsSessionId is required".to_string()),
		};
	};

	let mut registry = engine.registry().lock();
	let session = match registry.resolve(session_id, lease_id, client_id) {
		Ok(session) => session,
		Err(error) => {
			return Admitted::Invalid {
				session_id: Some(session_id.to_string()),
				error,
			};
		}
	};

	match name.scope() {
		Scope::Session => Admitted::Control {
			session_id: session_id.to_string(),
			name,
			payload,
			turn: session.scheduler.begin_control_turn(Instant::now()),
		},
		Scope::Target => {
			let (target_id, tab_id) =
				match session.resolve_target(explicit_target_id(&payload).as_deref()) {
					Ok(target) => (target.target_id.clone(), target.tab_id.clone()),
					Err(error) => {
						return Admitted::Invalid {
							session_id: Some(session_id.to_string()),
							error,
						};
					}
				};
			let turn = session.scheduler.begin_turn(&target_id, Instant::now());
			Admitted::Target {
				session_id: session_id.to_string(),
				target_id,
				tab_id,
				name,
				payload,
				turn,
			}
		}
	}
}

/// Async phase. Returns the session id the response correlates to (where
/// one resolved), the handler outcome, and any teardown the command
/// deferred past response delivery.
pub(crate) async fn run(
	engine: &Engine,
	client_id: &str,
	admitted: Admitted,
) -> (Option<String>, Result<Value, OpsError>, Option<Teardown>) {
	match admitted {
		Admitted::Invalid { session_id, error } => (session_id, Err(error), None),
		Admitted::Bootstrap { name, payload } => {
			match handlers::bootstrap(engine, client_id, name, &payload).await {
				Ok((session_id, value)) => (Some(session_id), Ok(value), None),
				Err(err) => (None, Err(err), None),
			}
		}
		Admitted::Control {
			session_id,
			name,
			payload,
			turn,
		} => {
			if let Some(rx) = turn {
				if rx.await.is_err() {
					let err = OpsError::SessionClosed(session_id.clone());
					return (Some(session_id), Err(err), None);
				}
			}
			let result = handlers::run_session_command(engine, &session_id, name, &payload).await;
			finish_control(engine, &session_id);
			let deferred = (result.is_ok() && name == CommandName::BrowserDisconnect)
				.then(|| Teardown::for_session(&session_id));
			(Some(session_id), result, deferred)
		}
		Admitted::Target {
			session_id,
			target_id,
			tab_id,
			name,
			payload,
			turn,
		} => {
			if let Some(rx) = turn {
				if rx.await.is_err() {
					let err = OpsError::SessionClosed(session_id.clone());
					return (Some(session_id), Err(err), None);
				}
			}
			if let Err(err) = engine.acquire_slot(&session_id, &target_id).await {
				engine.abandon_target_turn(&session_id, &target_id);
				return (Some(session_id), Err(err), None);
			}

			let result = handlers::run_target_command(
				engine, &session_id, &target_id, &tab_id, name, &payload,
			)
			.await;
			engine.finish_target_op(&session_id, &target_id);
			(Some(session_id), result, None)
		}
	}
}

fn finish_control(engine: &Engine, session_id: &str) {
	let mut registry = engine.registry().lock();
	if let Some(session) = registry.get_mut(session_id) {
		session.scheduler.finish_control_turn();
	}
}
