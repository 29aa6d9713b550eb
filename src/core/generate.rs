//! Identifier and nonce generation.

use rand::RngCore;
use uuid::Uuid;

/// A UUIDv4 request identifier, attached to the ambient request context and
/// echoed to callers for correlation.
#[must_use]
pub fn request_id() -> String {
    Uuid::new_v4().to_string()
}

/// A 128-bit random nonce, hex-encoded. Minted per role-credential request
/// and echoed in the response to bind the two messages.
#[must_use]
pub fn nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut hex = String::with_capacity(32);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// A member tag unique within a rate-limiter window, so that two admissions
/// sharing a millisecond do not collapse into one ordered-set entry.
#[must_use]
pub fn unique_tag(now_millis: i64) -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{now_millis}-{:016x}", u64::from_be_bytes(bytes))
}
