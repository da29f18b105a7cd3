use thiserror::Error;

use tabops_protocol::{ErrorCode, WireError};

use crate::scheduler::BackpressureInfo;

pub type Result<T> = std::result::Result<T, OpsError>;

/// Engine error taxonomy; one variant per wire code.
///
/// Registry and scheduler errors carry their specific codes end to end and
/// are never downgraded; collaborator failures are normalized to
/// [`OpsError::ExecutionFailed`] once, at the dispatch boundary.
#[derive(Debug, Error)]
pub enum OpsError {
	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error("unknown session: {0}")]
	InvalidSession(String),

	#[error("lease or owner mismatch for session {0}")]
	NotOwner(String),

	#[error("navigation to {0} is restricted by policy")]
	RestrictedUrl(String),

	#[error("debugger attach failed: {0}")]
	CdpAttachFailed(String),

	#[error("execution failed: {0}")]
	ExecutionFailed(String),

	#[error("timeout after {ms}ms waiting for: {condition}")]
	Timeout { ms: u64, condition: String },

	#[error("snapshot size {size} exceeds limit {limit}")]
	SnapshotTooLarge { size: usize, limit: usize },

	#[error("admission rejected under backpressure after {}ms", .0.timeout_ms)]
	ParallelismBackpressure(BackpressureInfo),

	#[error("no attachable tab: {0}")]
	OpsUnavailable(String),

	#[error("protocol version {received} not supported (supported: {supported})")]
	NotSupported { supported: u32, received: u32 },

	#[error("session closed: {0}")]
	SessionClosed(String),
}

impl OpsError {
	pub fn code(&self) -> ErrorCode {
		match self {
			OpsError::InvalidRequest(_) => ErrorCode::InvalidRequest,
			OpsError::InvalidSession(_) => ErrorCode::InvalidSession,
			OpsError::NotOwner(_) => ErrorCode::NotOwner,
			OpsError::RestrictedUrl(_) => ErrorCode::RestrictedUrl,
			OpsError::CdpAttachFailed(_) => ErrorCode::CdpAttachFailed,
			OpsError::ExecutionFailed(_) => ErrorCode::ExecutionFailed,
			OpsError::Timeout { .. } => ErrorCode::Timeout,
			OpsError::SnapshotTooLarge { .. } => ErrorCode::SnapshotTooLarge,
			OpsError::ParallelismBackpressure(_) => ErrorCode::ParallelismBackpressure,
			OpsError::OpsUnavailable(_) => ErrorCode::OpsUnavailable,
			OpsError::NotSupported { .. } => ErrorCode::NotSupported,
			OpsError::SessionClosed(_) => ErrorCode::SessionClosed,
		}
	}

	/// Structured diagnostics attached to the wire error, where the variant
	/// has any.
	fn details(&self) -> Option<serde_json::Value> {
		match self {
			OpsError::ParallelismBackpressure(info) => serde_json::to_value(info).ok(),
			OpsError::Timeout { ms, condition } => {
				Some(serde_json::json!({ "timeoutMs": ms, "condition": condition }))
			}
			OpsError::SnapshotTooLarge { size, limit } => {
				Some(serde_json::json!({ "sizeBytes": size, "limitBytes": limit }))
			}
			OpsError::NotSupported { supported, received } => {
				Some(serde_json::json!({ "supported": supported, "received": received }))
			}
			OpsError::RestrictedUrl(url) => Some(serde_json::json!({ "url": url })),
			_ => None,
		}
	}

	pub fn to_wire(&self) -> WireError {
		let mut wire = WireError::new(self.code(), self.to_string());
		if let Some(details) = self.details() {
			wire = wire.with_details(details);
		}
		wire
	}

	/// Normalizes a collaborator failure message unless it already carries a
	/// specific code.
	pub fn execution(message: impl Into<String>) -> Self {
		OpsError::ExecutionFailed(message.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backpressure_details_reach_the_wire() {
		let err = OpsError::ParallelismBackpressure(BackpressureInfo {
			effective_parallel_cap: 2,
			in_flight: 2,
			wait_queue_depth: 1,
			wait_queue_age_ms: 4200,
			pressure: crate::governor::Pressure::High,
			timeout_ms: 10_000,
		});
		let wire = err.to_wire();
		assert_eq!(wire.code, ErrorCode::ParallelismBackpressure);
		assert!(wire.retryable);
		let details = wire.details.unwrap();
		assert_eq!(details["waitQueueDepth"], 1);
		assert_eq!(details["effectiveParallelCap"], 2);
		assert_eq!(details["pressure"], "high");
	}

	#[test]
	fn specific_codes_survive_to_wire() {
		assert_eq!(
			OpsError::NotOwner("s-1".into()).to_wire().code,
			ErrorCode::NotOwner
		);
		assert_eq!(
			OpsError::SessionClosed("s-1".into()).to_wire().code,
			ErrorCode::SessionClosed
		);
	}
}
