use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use skillbridge_common::AppError;

use crate::models::ProviderEventKind;
use crate::payments::provider::from_minor_units;

type HmacSha256 = Hmac<Sha256>;

/// How far a `t=` signature timestamp may drift from the engine clock.
pub const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// Provider callback reduced to what the coordinator acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub id: String,
    pub kind: ProviderEventKind,
    pub intent_id: String,
    pub created: DateTime<Utc>,
    pub amount: Option<Decimal>,
    pub contract_id: Option<Uuid>,
    pub payment_record_id: Option<Uuid>,
}

fn mac_for(secret: &str) -> Result<HmacSha256, AppError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal("Invalid webhook secret".to_string()))
}

/// Checks the signature header against the raw request body.
///
/// Two header shapes are accepted: a bare hex HMAC of the body, or the
/// `t=<unix>,v1=<hex>` form where the signed payload is `<unix>.<body>`.
/// The timestamped form is rejected once `t` is more than
/// [`SIGNATURE_TOLERANCE_SECONDS`] away from `now`.
pub fn verify_signature(secret: &str, body: &[u8], header: &str, now: DateTime<Utc>) -> Result<(), AppError> {
    if secret.is_empty() {
        return Err(AppError::Authentication("Webhook secret is not configured".to_string()));
    }

    let header = header.trim();
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    if let Some(timestamp) = timestamp {
        let signed_at = timestamp
            .parse::<i64>()
            .map_err(|_| AppError::Authentication("Invalid webhook signature timestamp".to_string()))?;
        if (now.timestamp() - signed_at).abs() > SIGNATURE_TOLERANCE_SECONDS {
            return Err(AppError::Authentication(
                "Webhook signature timestamp is outside the tolerance window".to_string(),
            ));
        }
    }

    let valid = match timestamp {
        Some(timestamp) => candidates.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            mac_for(secret)
                .map(|mut mac| {
                    mac.update(timestamp.as_bytes());
                    mac.update(b".");
                    mac.update(body);
                    mac.verify_slice(&expected).is_ok()
                })
                .unwrap_or(false)
        }),
        None => match hex::decode(header) {
            Ok(expected) => {
                let mut mac = mac_for(secret)?;
                mac.update(body);
                mac.verify_slice(&expected).is_ok()
            }
            Err(_) => false,
        },
    };

    if valid {
        Ok(())
    } else {
        Err(AppError::Authentication("Invalid webhook signature".to_string()))
    }
}

/// Compares two shared secrets without short-circuiting on the first
/// differing byte.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    let digest = |token: &str| {
        mac_for("token-comparison").map(|mut mac| {
            mac.update(token.as_bytes());
            mac
        })
    };
    match (digest(expected), digest(presented)) {
        (Ok(expected), Ok(presented)) => presented.verify_slice(&expected.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}

/// Hex signature for `body`, in the bare form `verify_signature` accepts.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, AppError> {
    let mut mac = mac_for(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: EventObject,
}

#[derive(Debug, Deserialize)]
struct EventObject {
    id: String,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    metadata: EventMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct EventMetadata {
    #[serde(default)]
    contract_id: Option<String>,
    #[serde(default)]
    payment_record_id: Option<String>,
}

fn kind_for(event_type: &str) -> Option<ProviderEventKind> {
    match event_type {
        "payment_intent.succeeded" | "intent.succeeded" => Some(ProviderEventKind::IntentSucceeded),
        "payment_intent.payment_failed" | "intent.failed" => Some(ProviderEventKind::IntentFailed),
        "refund.created" | "charge.refunded" => Some(ProviderEventKind::RefundCreated),
        _ => None,
    }
}

/// Parses a provider callback. Event types the engine does not handle yield `None`.
pub fn parse_event(body: &[u8]) -> Result<Option<ProviderEvent>, AppError> {
    let envelope: EventEnvelope = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Malformed provider event: {}", e)))?;

    let Some(kind) = kind_for(&envelope.event_type) else {
        tracing::debug!(event_id = %envelope.id, event_type = %envelope.event_type, "Ignoring provider event type");
        return Ok(None);
    };

    let object = envelope.data.object;
    let intent_id = match kind {
        ProviderEventKind::RefundCreated => object.payment_intent.clone(),
        _ if object.object.as_deref().map_or(true, |o| o == "payment_intent") => Some(object.id.clone()),
        _ => object.payment_intent.clone(),
    }
    .ok_or_else(|| AppError::Validation(format!("Provider event {} has no payment intent", envelope.id)))?;

    let created = DateTime::from_timestamp(envelope.created, 0)
        .ok_or_else(|| AppError::Validation(format!("Provider event {} has an invalid timestamp", envelope.id)))?;

    let currency = object.currency.as_deref().unwrap_or("usd");
    let parse_id = |raw: Option<String>| raw.and_then(|value| Uuid::parse_str(&value).ok());

    Ok(Some(ProviderEvent {
        id: envelope.id,
        kind,
        intent_id,
        created,
        amount: object.amount.map(|units| from_minor_units(units, currency)),
        contract_id: parse_id(object.metadata.contract_id),
        payment_record_id: parse_id(object.metadata.payment_record_id),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    fn signed_at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn timestamped(body: &[u8], t: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.", t).as_bytes());
        mac.update(body);
        format!("t={},v1={}", t, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_bare_hex_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let signature = sign(SECRET, body).unwrap();
        assert!(verify_signature(SECRET, body, &signature, signed_at()).is_ok());
        assert!(verify_signature("other", body, &signature, signed_at()).is_err());
    }

    #[test]
    fn accepts_timestamped_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = timestamped(body, 1_700_000_000);
        assert!(verify_signature(SECRET, body, &header, signed_at()).is_ok());
        assert!(verify_signature(SECRET, body, &header, signed_at() + chrono::Duration::seconds(299)).is_ok());

        let tampered = br#"{"id":"evt_2"}"#;
        assert!(verify_signature(SECRET, tampered, &header, signed_at()).is_err());
    }

    #[test]
    fn replayed_timestamped_signature_is_rejected() {
        let body = br#"{"id":"evt_1"}"#;
        let header = timestamped(body, 1_700_000_000);

        let late = verify_signature(SECRET, body, &header, signed_at() + chrono::Duration::minutes(6));
        assert!(matches!(late, Err(AppError::Authentication(_))));
        let early = verify_signature(SECRET, body, &header, signed_at() - chrono::Duration::minutes(6));
        assert!(early.is_err());
        assert!(verify_signature(SECRET, body, "t=soon,v1=abcd", signed_at()).is_err());
    }

    #[test]
    fn token_comparison() {
        assert!(tokens_match("cron-secret", "cron-secret"));
        assert!(!tokens_match("cron-secret", "cron-secreT"));
        assert!(!tokens_match("cron-secret", ""));
    }

    #[test]
    fn rejects_garbage_and_missing_secret() {
        assert!(verify_signature(SECRET, b"{}", "not-hex", signed_at()).is_err());
        assert!(verify_signature(SECRET, b"{}", "", signed_at()).is_err());
        assert!(verify_signature("", b"{}", "abcd", signed_at()).is_err());
    }

    #[test]
    fn parses_succeeded_intent() {
        let contract_id = Uuid::new_v4();
        let body = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1738400000,
            "data": {"object": {
                "id": "pi_123",
                "object": "payment_intent",
                "amount": 15000,
                "currency": "usd",
                "metadata": {"contract_id": contract_id.to_string()}
            }}
        });

        let event = parse_event(body.to_string().as_bytes()).unwrap().unwrap();
        assert_eq!(event.kind, ProviderEventKind::IntentSucceeded);
        assert_eq!(event.intent_id, "pi_123");
        assert_eq!(event.amount, Some(dec!(150.00)));
        assert_eq!(event.contract_id, Some(contract_id));
        assert_eq!(event.payment_record_id, None);
    }

    #[test]
    fn refunds_point_at_their_intent() {
        let body = json!({
            "id": "evt_2",
            "type": "refund.created",
            "created": 1738400000,
            "data": {"object": {"id": "re_9", "object": "refund", "payment_intent": "pi_123", "amount": 15000}}
        });

        let event = parse_event(body.to_string().as_bytes()).unwrap().unwrap();
        assert_eq!(event.kind, ProviderEventKind::RefundCreated);
        assert_eq!(event.intent_id, "pi_123");
    }

    #[test]
    fn unhandled_types_are_skipped() {
        let body = json!({
            "id": "evt_3",
            "type": "customer.created",
            "created": 1738400000,
            "data": {"object": {"id": "cus_1"}}
        });
        assert_eq!(parse_event(body.to_string().as_bytes()).unwrap(), None);
        assert!(parse_event(b"not json").is_err());
    }
}
