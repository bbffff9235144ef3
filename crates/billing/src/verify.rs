//! Webhook signature verification
//!
//! Stripe signs `"{t}." ++ body` with HMAC-SHA256 and sends the result in the
//! `Stripe-Signature` header as `t=<unix>,v1=<hex>[,v1=<hex>...]`. Several
//! `v1` entries appear while a secret is being rolled.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::events::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

/// Parsed `Stripe-Signature` header
#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    fn parse(header: &str) -> BillingResult<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse::<i64>().ok(),
                "v1" => match hex::decode(value) {
                    Ok(bytes) => signatures.push(bytes),
                    Err(_) => {
                        tracing::warn!("Non-hex v1 signature in webhook header");
                    }
                },
                // v0 and unknown schemes are ignored
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if signatures.is_empty() {
            tracing::warn!("No usable v1 signature in webhook signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

fn compute_signature(secret: &str, timestamp: i64, raw: &[u8]) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a `Stripe-Signature` header value for a payload
pub fn sign_payload(secret: &str, timestamp: i64, raw: &[u8]) -> BillingResult<String> {
    let signature = compute_signature(secret, timestamp, raw)?;
    Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
}

/// Authenticates inbound webhook deliveries
#[derive(Clone)]
pub struct EventVerifier {
    secret: String,
    tolerance: Duration,
}

impl std::fmt::Debug for EventVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl EventVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Verify against the current wall clock
    pub fn verify(&self, raw: &[u8], header: &str) -> BillingResult<WebhookEvent> {
        self.verify_at(raw, header, time::OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock reading (unix seconds)
    pub fn verify_at(&self, raw: &[u8], header: &str, now_unix: i64) -> BillingResult<WebhookEvent> {
        let header = SignatureHeader::parse(header)?;

        let age = now_unix.saturating_sub(header.timestamp).unsigned_abs();
        if age > self.tolerance.as_secs() {
            tracing::warn!(
                timestamp = header.timestamp,
                now = now_unix,
                age_secs = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = compute_signature(&self.secret, header.timestamp, raw)?;
        let matched = header
            .signatures
            .iter()
            .any(|candidate| bool::from(candidate.as_slice().ct_eq(expected.as_slice())));

        if !matched {
            tracing::warn!(payload_len = raw.len(), "Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event = WebhookEvent::parse(raw).map_err(|e| {
            tracing::warn!(error = %e, "Signed webhook body is not a valid event");
            e
        })?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            livemode = event.livemode,
            "Webhook signature verified"
        );

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    fn event_body() -> Vec<u8> {
        br#"{"id":"evt_1","type":"charge.succeeded","created":1700000000,"livemode":false,"data":{"object":{"id":"ch_1"}}}"#.to_vec()
    }

    fn verifier() -> EventVerifier {
        EventVerifier::new(SECRET, Duration::from_secs(300))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = event_body();
        let header = sign_payload(SECRET, NOW, &body).unwrap();

        let event = verifier().verify_at(&body, &header, NOW + 10).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "charge.succeeded");
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let body = event_body();
        let good = sign_payload(SECRET, NOW, &body).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v1={},v0=abc", NOW, "00".repeat(32), good_sig);

        assert!(verifier().verify_at(&body, &header, NOW).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let body = event_body();
        let header = sign_payload(SECRET, NOW, &body).unwrap();
        let mut tampered = body.clone();
        tampered.extend_from_slice(b" ");

        let err = verifier().verify_at(&tampered, &header, NOW).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = event_body();
        let header = sign_payload("whsec_other", NOW, &body).unwrap();
        assert!(verifier().verify_at(&body, &header, NOW).is_err());
    }

    #[test]
    fn test_full_secret_is_the_key() {
        // Stripe keys the HMAC with the whole secret, prefix included
        let body = event_body();
        let header = sign_payload("test_secret", NOW, &body).unwrap();
        assert!(verifier().verify_at(&body, &header, NOW).is_err());
    }

    #[test]
    fn test_timestamp_tolerance() {
        let body = event_body();
        let header = sign_payload(SECRET, NOW, &body).unwrap();

        assert!(verifier().verify_at(&body, &header, NOW + 300).is_ok());
        assert!(verifier().verify_at(&body, &header, NOW - 300).is_ok());
        assert!(verifier().verify_at(&body, &header, NOW + 301).is_err());
        assert!(verifier().verify_at(&body, &header, NOW - 301).is_err());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let body = event_body();
        let headers = vec![
            String::new(),
            "garbage".to_string(),
            "v1=deadbeef".to_string(),
            format!("t={}", NOW),
            format!("t={},v1=not-hex", NOW),
            format!("t=yesterday,v1={}", "00".repeat(32)),
        ];
        for header in &headers {
            let err = verifier().verify_at(&body, header, NOW).unwrap_err();
            assert!(
                matches!(err, BillingError::WebhookSignatureInvalid),
                "header {:?} gave {:?}",
                header,
                err
            );
        }
    }

    #[test]
    fn test_signed_garbage_is_payload_error() {
        let body = b"{\"not\":\"an event\"}".to_vec();
        let header = sign_payload(SECRET, NOW, &body).unwrap();

        let err = verifier().verify_at(&body, &header, NOW).unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", verifier());
        assert!(!rendered.contains(SECRET));
    }
}
