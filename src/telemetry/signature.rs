//! Webhook Signature Verification
//! Mission: Authenticate the telemetry webhook with HMAC-SHA256 over
//! `ts + "\n" + body`, bounded by a clock-skew window

use crate::errors::CoreError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-ingest-timestamp";
pub const SIGNATURE_HEADER: &str = "x-ingest-signature";

pub fn sign(secret: &str, ts: i64, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(ts.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(
    secret: &str,
    ts_header: &str,
    signature_hex: &str,
    body: &[u8],
    now: DateTime<Utc>,
    skew_secs: i64,
) -> Result<(), CoreError> {
    let ts: i64 = ts_header
        .parse()
        .map_err(|_| CoreError::validation("bad X-Ingest-Timestamp"))?;

    if (now.timestamp() - ts).abs() > skew_secs {
        return Err(CoreError::Forbidden("ingest timestamp outside skew window".into()));
    }

    let given = hex::decode(signature_hex)
        .map_err(|_| CoreError::validation("bad X-Ingest-Signature encoding"))?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(ts.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(body);
    mac.verify_slice(&given)
        .map_err(|_| CoreError::Forbidden("ingest signature mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_valid_signature_passes() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
        let body = br#"{"ts":1785501600,"values":{"p.charge":1.0}}"#;
        let sig = sign("shh", now.timestamp(), body);
        verify("shh", &now.timestamp().to_string(), &sig, body, now, 300).unwrap();
    }

    #[test]
    fn test_tampered_body_fails() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
        let sig = sign("shh", now.timestamp(), b"original");
        let err = verify("shh", &now.timestamp().to_string(), &sig, b"tampered", now, 300)
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[test]
    fn test_stale_timestamp_fails() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
        let old = now.timestamp() - 301;
        let sig = sign("shh", old, b"body");
        let err = verify("shh", &old.to_string(), &sig, b"body", now, 300).unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[test]
    fn test_garbage_headers_are_validation_errors() {
        let now = Utc::now();
        assert!(matches!(
            verify("shh", "not-a-number", "aa", b"", now, 300),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            verify("shh", &now.timestamp().to_string(), "zz-not-hex", b"", now, 300),
            Err(CoreError::Validation(_))
        ));
    }
}
