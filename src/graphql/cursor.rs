//! Relay connection cursors.
//!
//! The server hands out opaque cursors that are base64 of
//! `<prefix>:<offset>`, e.g. `arrayconnection:99`. Only the offset matters
//! here; the rest of the crate treats cursors as opaque strings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Prefix the server uses for array-backed connections.
pub const ARRAY_CONNECTION_PREFIX: &str = "arrayconnection";

/// Decode the offset carried by a cursor.
///
/// Returns `None` for invalid base64, non-UTF-8 payloads, a missing offset
/// segment, or a segment that is not a non-negative integer.
pub fn decode_offset(cursor: &str) -> Option<u64> {
  let bytes = BASE64.decode(cursor.trim()).ok()?;
  let decoded = String::from_utf8(bytes).ok()?;
  decoded.split(':').nth(1)?.trim().parse().ok()
}

/// Build a cursor the same way the server does.
pub fn encode(prefix: &str, offset: u64) -> String {
  BASE64.encode(format!("{}:{}", prefix, offset))
}
