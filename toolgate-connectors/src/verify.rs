//! Shared webhook verification primitives.
//!
//! HMAC computation in the two encodings providers use, plain-digest
//! canonical strings, replay-window checks, and constant-time comparison.
//! Every comparison in this module is timing-safe; callers must never
//! reveal to the remote end whether the signature or the replay window
//! failed.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Providers reject webhooks older (or newer) than this many seconds.
pub const REPLAY_WINDOW_SECS: i64 = 300;

/// Constant-time byte comparison. Mismatched lengths compare unequal
/// without an early exit on content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// HMAC-SHA256 of `data`, hex-encoded.
pub fn hmac_sha256_hex(secret: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// HMAC-SHA256 of `data`, base64-encoded.
pub fn hmac_sha256_base64(secret: &[u8], data: &[u8]) -> String {
    use base64::Engine;
    let mut mac = HmacSha256::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(data);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Plain SHA-256 of a canonical string, hex-encoded (HubSpot style, where
/// the secret is part of the hashed string rather than an HMAC key).
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare a computed hex digest against a presented signature,
/// case-normalized and constant-time.
pub fn verify_hex_signature(expected_hex: &str, presented: &str) -> bool {
    constant_time_eq(
        expected_hex.to_ascii_lowercase().as_bytes(),
        presented.to_ascii_lowercase().as_bytes(),
    )
}

/// Compare a computed base64 digest against a presented signature,
/// constant-time.
pub fn verify_base64_signature(expected_base64: &str, presented: &str) -> bool {
    constant_time_eq(expected_base64.as_bytes(), presented.as_bytes())
}

/// Whether a unix timestamp is within the replay window of `now`.
/// Millisecond timestamps are normalized to seconds first.
pub fn within_replay_window(timestamp: i64, now: i64) -> bool {
    let ts_secs = if timestamp > 100_000_000_000 {
        timestamp / 1000
    } else {
        timestamp
    };
    (now - ts_secs).abs() <= REPLAY_WINDOW_SECS
}
