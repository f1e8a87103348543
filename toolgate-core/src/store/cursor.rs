//! Opaque pagination cursors.
//!
//! A cursor encodes `(created_at, id)` as `base64(rfc3339 + "|" + uuid)`.
//! Pages are ordered `(created_at DESC, id DESC)`, so the tuple is strictly
//! decreasing and pagination stays stable under concurrent inserts.
//! Malformed cursors decode to `None`; the caller behaves as if no cursor
//! was supplied and logs the fact.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Encode a `(created_at, id)` position into an opaque cursor.
pub fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> String {
    STANDARD.encode(format!("{}|{}", super::fmt_ts(created_at), id))
}

/// Decode a cursor, tolerantly. Any malformed input yields `None`.
pub fn decode_cursor(cursor: &str) -> Option<(DateTime<Utc>, Uuid)> {
    let raw = STANDARD.decode(cursor).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let (ts, id) = text.split_once('|')?;
    let created_at = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    let id = Uuid::parse_str(id).ok()?;
    Some((created_at, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cursor_roundtrip() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let cursor = encode_cursor(now, id);
        let (ts, decoded_id) = decode_cursor(&cursor).unwrap();
        assert_eq!(decoded_id, id);
        assert!((ts - now).num_microseconds().unwrap().abs() < 2);
    }

    #[test]
    fn test_malformed_cursors_decode_to_none() {
        assert!(decode_cursor("").is_none());
        assert!(decode_cursor("not base64 !!!").is_none());
        // Valid base64, wrong payload.
        let junk = STANDARD.encode("no separator here");
        assert!(decode_cursor(&junk).is_none());
        let bad_uuid = STANDARD.encode("2024-01-01T00:00:00.000000Z|not-a-uuid");
        assert!(decode_cursor(&bad_uuid).is_none());
    }

    proptest! {
        #[test]
        fn prop_arbitrary_strings_never_panic(s in ".*") {
            let _ = decode_cursor(&s);
        }
    }
}
