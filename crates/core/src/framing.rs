//! Outbound envelope construction, including oversize-response chunking.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use tabops_protocol::{Envelope, chunk_budget, split_payload};

use crate::error::OpsError;

static NEXT_PAYLOAD_ID: AtomicU64 = AtomicU64::new(1);

fn next_payload_id() -> String {
	format!("payload-{}", NEXT_PAYLOAD_ID.fetch_add(1, Ordering::SeqCst))
}

/// Frames a handler result: one Response when it fits the budget, else a
/// chunked Response header followed by exactly `totalChunks` Chunk
/// envelopes whose data concatenates back to the serialized payload.
pub(crate) fn frame_response(
	request_id: &str,
	client_id: &str,
	ops_session_id: &str,
	payload: Value,
	max_payload_bytes: usize,
) -> Vec<Envelope> {
	let serialized = payload.to_string();
	if serialized.len() <= max_payload_bytes {
		return vec![Envelope::Response {
			request_id: request_id.to_string(),
			client_id: client_id.to_string(),
			ops_session_id: ops_session_id.to_string(),
			payload: Some(payload),
			chunked: false,
			payload_id: None,
			total_chunks: None,
		}];
	}

	let chunks = split_payload(&serialized, chunk_budget(max_payload_bytes));
	let total_chunks = chunks.len() as u32;
	let payload_id = next_payload_id();
	let mut envelopes = Vec::with_capacity(chunks.len() + 1);
	envelopes.push(Envelope::Response {
		request_id: request_id.to_string(),
		client_id: client_id.to_string(),
		ops_session_id: ops_session_id.to_string(),
		payload: None,
		chunked: true,
		payload_id: Some(payload_id.clone()),
		total_chunks: Some(total_chunks),
	});
	for (index, data) in chunks.into_iter().enumerate() {
		envelopes.push(Envelope::Chunk {
			request_id: request_id.to_string(),
			client_id: client_id.to_string(),
			ops_session_id: ops_session_id.to_string(),
			payload_id: payload_id.clone(),
			chunk_index: index as u32,
			total_chunks,
			data,
		});
	}
	envelopes
}

pub(crate) fn frame_error(
	request_id: &str,
	client_id: &str,
	ops_session_id: Option<String>,
	error: &OpsError,
) -> Envelope {
	Envelope::Error {
		request_id: request_id.to_string(),
		client_id: client_id.to_string(),
		ops_session_id,
		error: error.to_wire(),
	}
}
