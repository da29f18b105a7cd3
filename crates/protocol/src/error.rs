use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured error carried by an Error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
	pub code: ErrorCode,
	pub message: String,
	pub retryable: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub details: Option<Value>,
}

impl WireError {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			retryable: code.is_retryable(),
			code,
			message: message.into(),
			details: None,
		}
	}

	pub fn with_details(mut self, details: Value) -> Self {
		self.details = Some(details);
		self
	}
}

/// Closed set of wire error codes, by origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	/// Malformed request or missing required fields.
	InvalidRequest,
	/// Unknown `opsSessionId`.
	InvalidSession,
	/// Lease/owner mismatch.
	NotOwner,
	/// Navigation target disallowed by policy.
	RestrictedUrl,
	CdpAttachFailed,
	ExecutionFailed,
	/// Wait-style operation exceeded its deadline.
	Timeout,
	SnapshotTooLarge,
	/// Admission failure; details carry scheduler diagnostics.
	ParallelismBackpressure,
	/// No attachable tab.
	OpsUnavailable,
	/// Protocol version mismatch.
	NotSupported,
	/// Session torn down while the request was parked.
	SessionClosed,
}

impl ErrorCode {
	/// Whether a client may usefully retry the same request.
	pub fn is_retryable(self) -> bool {
		matches!(
			self,
			ErrorCode::Timeout | ErrorCode::ParallelismBackpressure | ErrorCode::OpsUnavailable
		)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ErrorCode::InvalidRequest => "invalid_request",
			ErrorCode::InvalidSession => "invalid_session",
			ErrorCode::NotOwner => "not_owner",
			ErrorCode::RestrictedUrl => "restricted_url",
			ErrorCode::CdpAttachFailed => "cdp_attach_failed",
			ErrorCode::ExecutionFailed => "execution_failed",
			ErrorCode::Timeout => "timeout",
			ErrorCode::SnapshotTooLarge => "snapshot_too_large",
			ErrorCode::ParallelismBackpressure => "parallelism_backpressure",
			ErrorCode::OpsUnavailable => "ops_unavailable",
			ErrorCode::NotSupported => "not_supported",
			ErrorCode::SessionClosed => "session_closed",
		}
	}
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_serialize_snake_case() {
		let text = serde_json::to_string(&ErrorCode::ParallelismBackpressure).unwrap();
		assert_eq!(text, "\"parallelism_backpressure\"");
	}

	#[test]
	fn retryable_set_matches_taxonomy() {
		assert!(ErrorCode::Timeout.is_retryable());
		assert!(ErrorCode::ParallelismBackpressure.is_retryable());
		assert!(ErrorCode::OpsUnavailable.is_retryable());
		assert!(!ErrorCode::NotOwner.is_retryable());
		assert!(!ErrorCode::SnapshotTooLarge.is_retryable());
	}

	#[test]
	fn wire_error_inherits_retryable_from_code() {
		let err = WireError::new(ErrorCode::Timeout, "deadline exceeded");
		assert!(err.retryable);
		let err = WireError::new(ErrorCode::InvalidSession, "unknown session");
		assert!(!err.retryable);
	}
}
