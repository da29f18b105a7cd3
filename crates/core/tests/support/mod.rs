//! Shared harness for engine integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

use tabops_core::testing::FakeWorld;
use tabops_core::{Engine, EngineConfig, GovernorPolicy, Limits};
use tabops_protocol::Envelope;

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

pub fn engine_with(governor: GovernorPolicy, limits: Limits) -> (Engine, FakeWorld) {
	let world = FakeWorld::new();
	let config = EngineConfig {
		limits,
		governor,
		..EngineConfig::default()
	};
	let engine = Engine::new(
		config,
		world.drivers(),
		world.sampler.clone(),
		world.sink.clone(),
	);
	(engine, world)
}

pub fn default_engine() -> (Engine, FakeWorld) {
	engine_with(GovernorPolicy::default(), Limits::default())
}

/// Issues one request with a fresh request id and returns the envelopes.
/// Deferred teardown runs after the envelopes exist, matching the
/// transport's response-then-teardown ordering.
pub async fn request(
	engine: &Engine,
	client: &str,
	session: Option<&str>,
	lease: Option<&str>,
	command: &str,
	payload: Value,
) -> Vec<Envelope> {
	let request_id = format!("req-{}", NEXT_REQUEST.fetch_add(1, Ordering::SeqCst));
	let output = engine
		.handle_request(client, &request_id, session, lease, command, payload)
		.await;
	engine.run_deferred(output.deferred).await;
	output.envelopes
}

/// Launched-session handle used across tests.
pub struct Launched {
	pub session_id: String,
	pub lease_id: String,
	pub target_id: String,
	pub tab_id: String,
}

pub async fn launch(engine: &Engine, client: &str) -> Launched {
	let envelopes = request(engine, client, None, None, "browser.launch", json!({})).await;
	let payload = response_payload(&envelopes);
	Launched {
		session_id: payload["opsSessionId"].as_str().unwrap().to_string(),
		lease_id: payload["leaseId"].as_str().unwrap().to_string(),
		target_id: payload["targetId"].as_str().unwrap().to_string(),
		tab_id: payload["tabId"].as_str().unwrap().to_string(),
	}
}

/// Opens a named page and returns its target id.
pub async fn open_page(engine: &Engine, client: &str, launched: &Launched, name: &str) -> String {
	let envelopes = request(
		engine,
		client,
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.open",
		json!({ "name": name }),
	)
	.await;
	response_payload(&envelopes)["targetId"]
		.as_str()
		.unwrap()
		.to_string()
}

pub fn response_payload(envelopes: &[Envelope]) -> Value {
	match envelopes.first() {
		Some(Envelope::Response {
			payload: Some(payload),
			..
		}) => payload.clone(),
		other => panic!("expected single response, got {other:?}"),
	}
}

pub fn error_code(envelopes: &[Envelope]) -> String {
	match envelopes.first() {
		Some(Envelope::Error { error, .. }) => error.code.as_str().to_string(),
		other => panic!("expected error envelope, got {other:?}"),
	}
}

pub fn error_retryable(envelopes: &[Envelope]) -> bool {
	match envelopes.first() {
		Some(Envelope::Error { error, .. }) => error.retryable,
		other => panic!("expected error envelope, got {other:?}"),
	}
}

pub fn error_details(envelopes: &[Envelope]) -> Value {
	match envelopes.first() {
		Some(Envelope::Error { error, .. }) => error.details.clone().unwrap_or(Value::Null),
		other => panic!("expected error envelope, got {other:?}"),
	}
}
