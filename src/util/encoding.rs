//! Base64-JSON blob helpers.
//!
//! Job parameters and status details travel through the database as
//! base64-encoded JSON strings. The blobs are opaque at the schema boundary;
//! the typed views live in [`crate::core::job`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::core::ManagerError;

/// Encode a UTF-8 string as standard base64.
pub fn b64encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// Decode a standard base64 blob back into a UTF-8 string.
pub fn b64decode(value: &str) -> Result<String, ManagerError> {
    let bytes = STANDARD
        .decode(value.as_bytes())
        .map_err(|e| ManagerError::Codec(format!("base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| ManagerError::Codec(format!("utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_payloads() {
        let payloads = [
            "",
            r#"{"resourcegpu": 4, "jobtrainingtype": "RegularJob"}"#,
            "non-json noise \u{2603}",
        ];
        for payload in payloads {
            assert_eq!(b64decode(&b64encode(payload)).unwrap(), payload);
        }
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(b64decode("!!!not-base64!!!").is_err());
    }
}
