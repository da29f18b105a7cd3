//! WebSocket front end.
//!
//! One socket per client. Inbound frames are decoded into protocol
//! envelopes; requests dispatch into the engine on their own tasks so a
//! slow target operation never blocks the socket's read loop. Outbound
//! traffic (responses, chunks, events) funnels through one mpsc writer
//! pump per connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use tabops_core::{Engine, EngineConfig, EventSink, SystemSampler};
use tabops_protocol::{CAPABILITIES, Envelope, ErrorCode, PROTOCOL_VERSION, WireError};

use crate::drivers;

type ClientMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>;

/// Delivers server-originated envelopes to whichever socket the addressed
/// client currently holds. Envelopes for disconnected clients are dropped.
struct SocketSink {
	clients: ClientMap,
}

impl EventSink for SocketSink {
	fn deliver(&self, envelope: Envelope) {
		let tx = self.clients.lock().get(envelope.client_id()).cloned();
		match tx {
			Some(tx) => send_envelope(&tx, &envelope),
			None => debug!(
				target = "tabops.server",
				client = envelope.client_id(),
				"dropping envelope for disconnected client"
			),
		}
	}
}

fn send_envelope(tx: &mpsc::UnboundedSender<Message>, envelope: &Envelope) {
	match serde_json::to_string(envelope) {
		Ok(text) => {
			let _ = tx.send(Message::Text(text.into()));
		}
		Err(err) => warn!(target = "tabops.server", error = %err, "failed to encode envelope"),
	}
}

#[derive(Clone)]
struct AppState {
	engine: Engine,
	clients: ClientMap,
}

pub async fn run(host: &str, port: u16, config: EngineConfig) -> Result<()> {
	let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
	let sink = Arc::new(SocketSink {
		clients: clients.clone(),
	});
	let engine = Engine::new(
		config,
		drivers::unattached_drivers(),
		Arc::new(SystemSampler),
		sink,
	);
	let sampler = engine.spawn_sampler();

	let state = AppState { engine, clients };
	let app = Router::new()
		.route("/", get(|| async { "OK" }))
		.route(
			"/ws",
			get(
				|ws: WebSocketUpgrade, State(state): State<AppState>| async move {
					ws.on_upgrade(|socket| handle_socket(socket, state))
				},
			),
		)
		.with_state(state);

	let addr: SocketAddr = format!("{host}:{port}")
		.parse()
		.with_context(|| format!("invalid host/port combination: {host}:{port}"))?;

	info!(target = "tabops.server", host, port, "starting server");

	let listener = TcpListener::bind(addr)
		.await
		.with_context(|| format!("failed to bind {addr}"))?;

	axum::serve(listener, app.into_make_service())
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("server error")?;

	sampler.abort();
	info!(target = "tabops.server", "server stopped");
	Ok(())
}

async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		let mut sigterm = signal(SignalKind::terminate()).ok();
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!(target = "tabops.server", "received SIGINT, shutting down");
			}
			_ = async {
				match sigterm.as_mut() {
					Some(sigterm) => { sigterm.recv().await; }
					None => std::future::pending().await,
				}
			} => {
				info!(target = "tabops.server", "received SIGTERM, shutting down");
			}
		}
	}

	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
		info!(target = "tabops.server", "received Ctrl+C, shutting down");
	}
}

/// Outcome of the first frame on a fresh socket.
#[derive(Debug)]
enum HelloOutcome {
	Accept { client_id: String, ack: Envelope },
	Reject(Envelope),
}

fn evaluate_hello(raw: &str, max_payload_bytes: usize) -> HelloOutcome {
	let envelope = match serde_json::from_str::<Envelope>(raw) {
		Ok(envelope) => envelope,
		Err(err) => {
			return HelloOutcome::Reject(Envelope::Error {
				request_id: String::new(),
				client_id: String::new(),
				ops_session_id: None,
				error: WireError::new(
					ErrorCode::InvalidRequest,
					format!("expected hello, got undecodable frame: {err}"),
				),
			});
		}
	};
	match envelope {
		Envelope::Hello { version, client_id } if version == PROTOCOL_VERSION => {
			let ack = Envelope::HelloAck {
				version: PROTOCOL_VERSION,
				client_id: client_id.clone(),
				max_payload_bytes,
				capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
			};
			HelloOutcome::Accept { client_id, ack }
		}
		Envelope::Hello { version, client_id } => HelloOutcome::Reject(Envelope::Error {
			request_id: String::new(),
			client_id,
			ops_session_id: None,
			error: WireError::new(
				ErrorCode::NotSupported,
				format!("protocol version {version} not supported"),
			)
			.with_details(serde_json::json!({
				"supported": [PROTOCOL_VERSION],
				"received": version,
			})),
		}),
		other => HelloOutcome::Reject(Envelope::Error {
			request_id: String::new(),
			client_id: other.client_id().to_string(),
			ops_session_id: None,
			error: WireError::new(ErrorCode::InvalidRequest, "expected hello as first frame"),
		}),
	}
}

async fn handle_socket(socket: WebSocket, state: AppState) {
	let (mut ws_tx, mut ws_rx) = socket.split();
	let (tx, rx) = mpsc::unbounded_channel();
	let mut rx_stream = UnboundedReceiverStream::new(rx);
	let send_task = tokio::spawn(async move {
		while let Some(msg) = rx_stream.next().await {
			if ws_tx.send(msg).await.is_err() {
				break;
			}
		}
	});

	// Handshake: the first text frame must be a compatible hello. Anything
	// else earns one error envelope, after which the socket is quarantined
	// until the peer goes away.
	let client_id = loop {
		let Some(msg) = ws_rx.next().await else {
			send_task.abort();
			return;
		};
		match msg {
			Ok(Message::Text(text)) => {
				match evaluate_hello(text.as_str(), state.engine.config().limits.max_payload_bytes)
				{
					HelloOutcome::Accept { client_id, ack } => {
						send_envelope(&tx, &ack);
						break client_id;
					}
					HelloOutcome::Reject(error) => {
						warn!(target = "tabops.server", "rejecting handshake");
						send_envelope(&tx, &error);
						quarantine(&mut ws_rx).await;
						send_task.abort();
						return;
					}
				}
			}
			Ok(Message::Close(_)) | Err(_) => {
				send_task.abort();
				return;
			}
			Ok(_) => {}
		}
	};

	{
		let mut clients = state.clients.lock();
		if clients.insert(client_id.clone(), tx.clone()).is_some() {
			warn!(
				target = "tabops.server",
				client = %client_id,
				"replacing existing connection for client"
			);
		}
	}
	info!(target = "tabops.server", client = %client_id, "client connected");

	while let Some(msg) = ws_rx.next().await {
		match msg {
			Ok(Message::Text(text)) => handle_frame(&state, &tx, &client_id, text.as_str()),
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(err) => {
				warn!(target = "tabops.server", client = %client_id, error = %err, "websocket error");
				break;
			}
		}
	}

	{
		// A replacement connection may own the map entry by now.
		let mut clients = state.clients.lock();
		if clients
			.get(&client_id)
			.is_some_and(|current| current.same_channel(&tx))
		{
			clients.remove(&client_id);
		}
	}
	state.engine.client_disconnected(&client_id);
	send_task.abort();
	info!(target = "tabops.server", client = %client_id, "client disconnected");
}

fn handle_frame(state: &AppState, tx: &mpsc::UnboundedSender<Message>, client_id: &str, raw: &str) {
	match serde_json::from_str::<Envelope>(raw) {
		Ok(Envelope::Ping { id, .. }) => {
			send_envelope(
				tx,
				&Envelope::Pong {
					id,
					client_id: client_id.to_string(),
				},
			);
		}
		Ok(Envelope::Request {
			request_id,
			ops_session_id,
			lease_id,
			command,
			payload,
			..
		}) => {
			// Admission runs here in the read loop so queue positions
			// follow frame order; only the slow phase moves to a task.
			let admitted = state.engine.admit_request(
				client_id,
				&request_id,
				ops_session_id.as_deref(),
				lease_id.as_deref(),
				&command,
				payload,
			);
			let engine = state.engine.clone();
			let tx = tx.clone();
			tokio::spawn(async move {
				let output = engine.serve_admitted(admitted).await;
				for envelope in &output.envelopes {
					send_envelope(&tx, envelope);
				}
				engine.run_deferred(output.deferred).await;
			});
		}
		Ok(other) => {
			debug!(target = "tabops.server", client = client_id, envelope = ?other, "ignoring unexpected envelope");
		}
		Err(err) => {
			warn!(target = "tabops.server", client = client_id, error = %err, "undecodable frame");
		}
	}
}

/// Drains a rejected socket without processing anything further.
async fn quarantine(ws_rx: &mut futures::stream::SplitStream<WebSocket>) {
	while let Some(msg) = ws_rx.next().await {
		match msg {
			Ok(Message::Close(_)) | Err(_) => break,
			Ok(_) => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn compatible_hello_is_acknowledged() {
		let raw = format!(
			r#"{{"type":"hello","version":{PROTOCOL_VERSION},"clientId":"cli-1"}}"#
		);
		match evaluate_hello(&raw, 65_536) {
			HelloOutcome::Accept { client_id, ack } => {
				assert_eq!(client_id, "cli-1");
				match ack {
					Envelope::HelloAck {
						version,
						max_payload_bytes,
						capabilities,
						..
					} => {
						assert_eq!(version, PROTOCOL_VERSION);
						assert_eq!(max_payload_bytes, 65_536);
						assert!(capabilities.contains(&"chunking".to_string()));
					}
					other => panic!("unexpected ack: {other:?}"),
				}
			}
			HelloOutcome::Reject(error) => panic!("rejected: {error:?}"),
		}
	}

	#[test]
	fn version_mismatch_is_rejected_with_details() {
		let raw = r#"{"type":"hello","version":99,"clientId":"cli-2"}"#;
		match evaluate_hello(raw, 65_536) {
			HelloOutcome::Reject(Envelope::Error { error, .. }) => {
				assert_eq!(error.code, ErrorCode::NotSupported);
				let details = error.details.unwrap();
				assert_eq!(details["supported"], serde_json::json!([PROTOCOL_VERSION]));
				assert_eq!(details["received"], serde_json::json!(99));
			}
			other => panic!("expected rejection, got {other:?}"),
		}
	}

	#[test]
	fn non_hello_first_frame_is_rejected() {
		let raw = r#"{"type":"ping","id":"p1","clientId":"cli-3"}"#;
		match evaluate_hello(raw, 65_536) {
			HelloOutcome::Reject(Envelope::Error { error, client_id, .. }) => {
				assert_eq!(error.code, ErrorCode::InvalidRequest);
				assert_eq!(client_id, "cli-3");
			}
			other => panic!("expected rejection, got {other:?}"),
		}
	}
}
