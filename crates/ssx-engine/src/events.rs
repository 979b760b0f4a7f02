//! Signed-event processing.
//!
//! One path for both ingestion transports (webhook ingress and the live
//! stream): verify the signature, decode the envelope, then soft-delete or
//! upsert. Re-delivery is a no-op because the gateway's timestamp guard
//! rejects older writes and ties carry identical data.

use std::fmt;

use serde_json::Value;
use tracing::{info, warn};

use ssx_stripe::webhook::{self, SignatureError, DEFAULT_TOLERANCE_SECS};
use ssx_stripe::{EventEnvelope, ObjectKind, ProviderLister};

use crate::upserter::EntityUpserter;

/// Event-path failures, in transport-mappable categories.
#[derive(Debug)]
pub enum EventError {
    /// Bad HMAC or stale timestamp → 400, never retried.
    Signature(SignatureError),
    /// The envelope could not be decoded → 400.
    Decode(String),
    /// The mirror write failed → 5xx, the sender will redeliver.
    Downstream(String),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Signature(e) => write!(f, "signature rejected: {e}"),
            EventError::Decode(msg) => write!(f, "event decode failed: {msg}"),
            EventError::Downstream(msg) => write!(f, "event apply failed: {msg}"),
        }
    }
}

impl std::error::Error for EventError {}

/// Acknowledgement returned to the transport.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Received {
    pub event_id: String,
}

/// Verify, decode, and apply one signed delivery.
///
/// `secret` is the tenant's webhook signing secret; `account_id` scopes the
/// mirrored rows.
pub async fn process_signed_event<L: ProviderLister>(
    upserter: &EntityUpserter<L>,
    account_id: &str,
    raw_body: &[u8],
    signature_header: &str,
    secret: &str,
) -> Result<Received, EventError> {
    let now = chrono::Utc::now().timestamp();
    webhook::verify_signature(raw_body, signature_header, secret, DEFAULT_TOLERANCE_SECS, now)
        .map_err(|e| {
            info!(error = %e, "rejected delivery");
            EventError::Signature(e)
        })?;

    let envelope: EventEnvelope =
        serde_json::from_slice(raw_body).map_err(|e| EventError::Decode(e.to_string()))?;
    apply_event(upserter, account_id, &envelope).await
}

/// Apply an already-authenticated envelope (the live stream verifies on its
/// own transport and hands envelopes straight here).
pub async fn apply_event<L: ProviderLister>(
    upserter: &EntityUpserter<L>,
    account_id: &str,
    envelope: &EventEnvelope,
) -> Result<Received, EventError> {
    let object = &envelope.data.object;
    let kind = object
        .get("object")
        .and_then(Value::as_str)
        .and_then(ObjectKind::parse);

    let Some(kind) = kind else {
        // Unhandled object kinds are acknowledged, not errored: the sender
        // would otherwise retry an event we will never mirror.
        warn!(
            event = %envelope.id,
            event_type = %envelope.event_type,
            "acknowledging event for unmirrored kind"
        );
        return Ok(Received {
            event_id: envelope.id.clone(),
        });
    };

    if envelope.is_deletion() {
        let id = object.get("id").and_then(Value::as_str).ok_or_else(|| {
            EventError::Decode("deletion event without object id".to_string())
        })?;
        upserter
            .soft_delete(kind, id)
            .await
            .map_err(|e| EventError::Downstream(e.to_string()))?;
        info!(event = %envelope.id, kind = %kind, id, "soft-deleted");
    } else {
        // Last-writer-wins by the provider's event clock: out-of-order
        // deliveries cannot regress a row.
        let last_synced_at = envelope.created * 1000;
        let stats = upserter
            .upsert(std::slice::from_ref(object), account_id, last_synced_at)
            .await
            .map_err(|e| EventError::Downstream(e.to_string()))?;
        if !stats.errors.is_empty() {
            let (id, msg) = &stats.errors[0];
            return Err(EventError::Downstream(format!("row {id}: {msg}")));
        }
        info!(
            event = %envelope.id,
            kind = %kind,
            written = stats.written(),
            skipped_older = stats.skipped_older,
            "event applied"
        );
    }

    Ok(Received {
        event_id: envelope.id.clone(),
    })
}
