// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Signed JSON webhook sink.
//!
//! The body is the serialized [`Notification`]. Headers:
//!
//! - `X-Event-Type`: event name, e.g. `lock_approved`
//! - `Idempotency-Key`: notification id, stable across redeliveries
//! - `X-Signature`: `sha256=<hex HMAC-SHA256 of the body>` when a secret is set

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;

use super::{DeliveryError, Notification, NotificationSink};

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct WebhookSink {
    name: String,
    url: url::Url,
    secret: Option<String>,
    http: Client,
}

impl WebhookSink {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        secret: Option<String>,
    ) -> Result<Self, DeliveryError> {
        let url = url
            .parse()
            .map_err(|e: url::ParseError| DeliveryError::Configuration(format!("{url}: {e}")))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DeliveryError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            url,
            secret,
            http,
        })
    }
}

/// `sha256=<hex>` signature over `body`.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::Configuration(format!("webhook secret: {e}")))?;
    mac.update(body);
    Ok(format!(
        "sha256={}",
        alloy::hex::encode(mac.finalize().into_bytes())
    ))
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(notification)
            .map_err(|e| DeliveryError::Request(format!("encode notification: {e}")))?;

        let mut request = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Event-Type", notification.event.as_str())
            .header("Idempotency-Key", notification.id.as_str());
        if let Some(secret) = &self.secret {
            request = request.header("X-Signature", sign_body(secret, &body)?);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status { status, body });
        }

        tracing::debug!(
            sink = %self.name,
            event = %notification.event,
            notification_id = %notification.id,
            "Webhook delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // RFC 4231 test case 2
        let sig = sign_body("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(matches!(
            WebhookSink::new("bank", "not a url", None),
            Err(DeliveryError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_request_error() {
        let sink = WebhookSink::new("bank", "http://127.0.0.1:9/hook", Some("k".into())).unwrap();
        let notification = Notification {
            id: "n-1".into(),
            event: super::super::NotificationEvent::NewLock,
            subject: "L1".into(),
            payload: serde_json::json!({}),
            created_at: chrono::Utc::now(),
        };
        let err = sink.deliver(&notification).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Request(_)));
    }
}
