use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireError;

/// One framed control-channel message.
///
/// Tagged by `type`; field names are camelCase on the wire. Every
/// client-originated envelope carries `clientId`; request/response/error
/// additionally carry `requestId` for correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Envelope {
	Hello {
		version: u32,
		client_id: String,
	},
	HelloAck {
		version: u32,
		client_id: String,
		max_payload_bytes: usize,
		capabilities: Vec<String>,
	},
	/// Liveness echo keyed by an opaque id.
	Ping {
		id: String,
		client_id: String,
	},
	Pong {
		id: String,
		client_id: String,
	},
	Request {
		request_id: String,
		client_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		ops_session_id: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		lease_id: Option<String>,
		command: String,
		#[serde(default)]
		payload: Value,
	},
	Response {
		request_id: String,
		client_id: String,
		ops_session_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		payload: Option<Value>,
		/// When true, the payload follows as `totalChunks` Chunk envelopes.
		#[serde(default, skip_serializing_if = "std::ops::Not::not")]
		chunked: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		payload_id: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		total_chunks: Option<u32>,
	},
	Chunk {
		request_id: String,
		client_id: String,
		ops_session_id: String,
		payload_id: String,
		chunk_index: u32,
		total_chunks: u32,
		data: String,
	},
	Error {
		request_id: String,
		client_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		ops_session_id: Option<String>,
		error: WireError,
	},
	Event {
		client_id: String,
		ops_session_id: String,
		event: EventName,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		payload: Option<Value>,
	},
}

impl Envelope {
	/// Client id this envelope is addressed to or originated from.
	pub fn client_id(&self) -> &str {
		match self {
			Envelope::Hello { client_id, .. }
			| Envelope::HelloAck { client_id, .. }
			| Envelope::Ping { client_id, .. }
			| Envelope::Pong { client_id, .. }
			| Envelope::Request { client_id, .. }
			| Envelope::Response { client_id, .. }
			| Envelope::Chunk { client_id, .. }
			| Envelope::Error { client_id, .. }
			| Envelope::Event { client_id, .. } => client_id,
		}
	}
}

/// Server-originated event names.
///
/// The first three are terminal: emitted exactly once, to the session's
/// (possibly prior) owner, when the session is torn down. Console/network
/// forwards are informational and carry redacted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
	OpsTabClosed,
	OpsSessionClosed,
	OpsSessionExpired,
	OpsConsole,
	OpsNetwork,
}
