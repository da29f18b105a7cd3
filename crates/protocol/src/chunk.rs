//! Response chunking for payloads that exceed the negotiated budget.
//!
//! Splitting is pure slicing of the serialized text: no compression, no
//! reordering tolerance. Concatenating chunk `data` fields in `chunkIndex`
//! order reproduces the original payload byte-exact.

/// Bytes reserved per Chunk envelope for its own framing fields.
const CHUNK_FRAMING_ALLOWANCE: usize = 512;

/// Smallest chunk data budget we will ever produce, so pathological
/// `maxPayloadBytes` settings cannot explode the chunk count.
const MIN_CHUNK_BYTES: usize = 1024;

/// Data bytes available per chunk once envelope framing is accounted for.
pub fn chunk_budget(max_payload_bytes: usize) -> usize {
	max_payload_bytes
		.saturating_sub(CHUNK_FRAMING_ALLOWANCE)
		.max(MIN_CHUNK_BYTES)
}

/// Splits serialized payload text into chunks of at most `chunk_bytes` bytes,
/// never cutting a UTF-8 code point in half.
pub fn split_payload(serialized: &str, chunk_bytes: usize) -> Vec<String> {
	assert!(chunk_bytes > 0, "chunk budget must be positive");
	let mut chunks = Vec::new();
	let mut rest = serialized;
	while !rest.is_empty() {
		let mut split = chunk_bytes.min(rest.len());
		while !rest.is_char_boundary(split) {
			split -= 1;
		}
		let (head, tail) = rest.split_at(split);
		chunks.push(head.to_string());
		rest = tail;
	}
	chunks
}

/// Reassembles chunk data in `chunkIndex` order.
///
/// Returns `None` if any index is missing or duplicated.
pub fn reassemble(total_chunks: u32, chunks: &[(u32, String)]) -> Option<String> {
	if chunks.len() != total_chunks as usize {
		return None;
	}
	let mut ordered: Vec<Option<&str>> = vec![None; total_chunks as usize];
	for (index, data) in chunks {
		let slot = ordered.get_mut(*index as usize)?;
		if slot.is_some() {
			return None;
		}
		*slot = Some(data);
	}
	let mut assembled = String::new();
	for slot in ordered {
		assembled.push_str(slot?);
	}
	Some(assembled)
}
