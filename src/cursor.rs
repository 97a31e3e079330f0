//! # Cursor Utilities
//!
//! Opaque base64 cursors for the metric listing. A cursor pins the last row served
//! (`occurred_at`, `id`) so the next page starts strictly after it.

use axum::http::StatusCode;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ApiError;
pub use crate::repositories::metric_record::CursorData;

const MAX_CURSOR_LEN: usize = 512;
const MAX_DECODED_LEN: usize = 256;

fn invalid(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
}

/// Encode the position after `(occurred_at, id)` as an opaque string.
pub fn encode_cursor(occurred_at: DateTime<Utc>, id: Uuid) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(&CursorData { occurred_at, id })?;
    Ok(STANDARD.encode(json))
}

/// Decode a cursor produced by [`encode_cursor`], rejecting anything malformed as a 400.
pub fn decode_cursor(cursor: &str) -> Result<CursorData, ApiError> {
    if cursor.is_empty() {
        return Err(invalid("cursor cannot be empty"));
    }
    if cursor.len() > MAX_CURSOR_LEN {
        return Err(invalid("cursor is too long"));
    }
    if !cursor
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
    {
        return Err(invalid("cursor contains invalid characters"));
    }

    let decoded = STANDARD
        .decode(cursor)
        .map_err(|_| invalid("cursor is not valid base64"))?;
    if decoded.len() > MAX_DECODED_LEN {
        return Err(invalid("decoded cursor is too large"));
    }

    let data: CursorData = serde_json::from_slice(&decoded)
        .map_err(|_| invalid("cursor contains invalid JSON structure"))?;

    if data.id.is_nil() {
        return Err(invalid("cursor contains invalid ID"));
    }
    if data.occurred_at > Utc::now() + chrono::Duration::days(1) {
        return Err(invalid("cursor timestamp is in the future"));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_old_positions() {
        // Backfills reach two years back, so old cursors stay valid.
        let occurred_at = Utc::now() - chrono::Duration::days(700);
        let id = Uuid::new_v4();
        let decoded = decode_cursor(&encode_cursor(occurred_at, id).unwrap()).unwrap();
        assert_eq!(decoded.occurred_at, occurred_at);
        assert_eq!(decoded.id, id);
    }

    #[test]
    fn rejects_malformed_cursors() {
        for (cursor, needle) in [
            ("", "cannot be empty"),
            ("cursor@#$%", "invalid characters"),
            ("aW52YWxpZCBqc29u", "invalid JSON"),
        ] {
            let err = decode_cursor(cursor).unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
            assert!(err.message.contains(needle), "{cursor}: {}", err.message);
        }
        assert!(decode_cursor(&"a".repeat(MAX_CURSOR_LEN + 1)).is_err());
    }

    #[test]
    fn rejects_nil_ids_and_future_positions() {
        let nil = encode_cursor(Utc::now(), Uuid::nil()).unwrap();
        assert!(decode_cursor(&nil).unwrap_err().message.contains("invalid ID"));

        let future = encode_cursor(Utc::now() + chrono::Duration::days(30), Uuid::new_v4()).unwrap();
        assert!(decode_cursor(&future).unwrap_err().message.contains("future"));
    }
}
