//! Webhook ingress: verify, decode, enqueue, acknowledge.
//!
//! Nothing here touches storage, so the acknowledgement goes out immediately
//! and the dispatcher does the work off the request path.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;

use super::types::{WebhookAck, WebhookPayload};
use crate::error::{LedgerError, LedgerResult};

/// Decoded push plus the verbatim body kept for the event log
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub payload: WebhookPayload,
    pub raw: String,
}

/// Check `hex(HMAC_SHA256(partner_key, body))` in constant time
pub fn verify_signature(partner_key: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(partner_key.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Clone)]
pub struct WebhookIngress {
    tx: mpsc::Sender<InboundEvent>,
    /// Empty key disables signature checks (development)
    partner_key: String,
}

impl WebhookIngress {
    pub fn new(tx: mpsc::Sender<InboundEvent>, partner_key: impl Into<String>) -> Self {
        Self {
            tx,
            partner_key: partner_key.into(),
        }
    }

    pub fn accept(&self, body: &[u8], authorization: Option<&str>) -> LedgerResult<WebhookAck> {
        if !self.partner_key.is_empty() {
            let signature = authorization.unwrap_or_default();
            if !verify_signature(&self.partner_key, body, signature) {
                tracing::warn!("Webhook rejected: bad signature");
                return Err(LedgerError::Forbidden("invalid webhook signature".into()));
            }
        }

        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| LedgerError::Validation(format!("malformed webhook payload: {}", e)))?;
        if i64::try_from(payload.shop_id).is_err() {
            return Err(LedgerError::Validation(format!("shop_id out of range: {}", payload.shop_id)));
        }

        let event = InboundEvent {
            raw: String::from_utf8_lossy(body).into_owned(),
            payload,
        };
        let (shop_id, code) = (event.payload.shop_id, event.payload.code);
        if let Err(e) = self.tx.try_send(event) {
            tracing::error!(shop_id, code, error = %e, "Webhook queue full, event dropped");
        }
        Ok(WebhookAck::received())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(key: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    const BODY: &[u8] = br#"{"code":3,"shop_id":9,"timestamp":1700000000,"data":{"ordersn":"A1","status":"COMPLETED"}}"#;

    #[test]
    fn test_signature_check() {
        let sig = signed("k", BODY);
        assert!(verify_signature("k", BODY, &sig));
        assert!(!verify_signature("other", BODY, &sig));
        assert!(!verify_signature("k", BODY, "zz"));
    }

    #[tokio::test]
    async fn test_accept_enqueues_and_acks() {
        let (tx, mut rx) = mpsc::channel(4);
        let ingress = WebhookIngress::new(tx, "k");

        let err = ingress.accept(BODY, Some("00")).unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));

        let ack = ingress.accept(BODY, Some(&signed("k", BODY))).unwrap();
        assert_eq!(ack.code, 0);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload.shop_id, 9);
        assert!(event.raw.contains("COMPLETED"));
    }

    #[tokio::test]
    async fn test_full_queue_still_acks() {
        let (tx, _rx) = mpsc::channel(1);
        let ingress = WebhookIngress::new(tx, "");
        assert!(ingress.accept(BODY, None).is_ok());
        assert!(ingress.accept(BODY, None).is_ok());
        assert!(matches!(
            ingress.accept(b"not json", None).unwrap_err(),
            LedgerError::Validation(_)
        ));
    }
}
