//! Provider-style webhook signatures, so template runs look like the real sender.

use crate::error::SigningError;
use crate::types::HeaderEntry;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, SigningError> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(m) => m,
        Err(e) => return Err(SigningError(e.to_string())),
    };
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// GitHub: `X-Hub-Signature-256: sha256=<hex(hmac(body))>`.
pub fn github_signature(secret: &str, body: &[u8]) -> Result<String, SigningError> {
    let sig = hmac_sha256(secret.as_bytes(), &[body])?;
    Ok(format!("sha256={}", hex::encode(sig)))
}

/// Stripe: `Stripe-Signature: t=<ts>,v1=<hex(hmac("<ts>.<body>"))>`.
pub fn stripe_signature(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SigningError> {
    let ts = timestamp.to_string();
    let sig = hmac_sha256(secret.as_bytes(), &[ts.as_bytes(), b".".as_slice(), body])?;
    Ok(format!("t={ts},v1={}", hex::encode(sig)))
}

/// Slack: `X-Slack-Signature: v0=<hex(hmac("v0:<ts>:<body>"))>`.
pub fn slack_signature(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SigningError> {
    let ts = timestamp.to_string();
    let sig = hmac_sha256(secret.as_bytes(), &[b"v0:".as_slice(), ts.as_bytes(), b":".as_slice(), body])?;
    Ok(format!("v0={}", hex::encode(sig)))
}

/// Shopify: `X-Shopify-Hmac-Sha256: <base64(hmac(body))>`.
pub fn shopify_signature(secret: &str, body: &[u8]) -> Result<String, SigningError> {
    let sig = hmac_sha256(secret.as_bytes(), &[body])?;
    Ok(base64::engine::general_purpose::STANDARD.encode(sig))
}

/// Standard Webhooks: `webhook-signature: v1,<base64(hmac("<id>.<ts>.<body>"))>`.
/// Secrets may be given as `whsec_<base64>`, bare base64, or raw text.
pub fn standard_webhooks_signature(
    secret: &str,
    msg_id: &str,
    timestamp: i64,
    body: &[u8],
) -> Result<String, SigningError> {
    let encoded = secret.strip_prefix("whsec_").unwrap_or(secret);
    let key = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap_or_else(|_| secret.as_bytes().to_vec());
    let ts = timestamp.to_string();
    let sig = hmac_sha256(&key, &[msg_id.as_bytes(), b".".as_slice(), ts.as_bytes(), b".".as_slice(), body])?;
    Ok(format!("v1,{}", base64::engine::general_purpose::STANDARD.encode(sig)))
}

/// Headers that sign `body` the way `provider` would. Unknown providers get
/// Standard Webhooks headers.
pub fn signature_headers(
    provider: &str,
    secret: &str,
    body: &[u8],
    timestamp: i64,
) -> Result<Vec<HeaderEntry>, SigningError> {
    let headers = match provider.to_ascii_lowercase().as_str() {
        "github" => vec![HeaderEntry::new("X-Hub-Signature-256", github_signature(secret, body)?)],
        "stripe" => vec![HeaderEntry::new(
            "Stripe-Signature",
            stripe_signature(secret, timestamp, body)?,
        )],
        "slack" => vec![
            HeaderEntry::new("X-Slack-Request-Timestamp", timestamp.to_string()),
            HeaderEntry::new("X-Slack-Signature", slack_signature(secret, timestamp, body)?),
        ],
        "shopify" => vec![HeaderEntry::new(
            "X-Shopify-Hmac-Sha256",
            shopify_signature(secret, body)?,
        )],
        _ => {
            let msg_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
            let signature = standard_webhooks_signature(secret, &msg_id, timestamp, body)?;
            vec![
                HeaderEntry::new("webhook-id", msg_id),
                HeaderEntry::new("webhook-timestamp", timestamp.to_string()),
                HeaderEntry::new("webhook-signature", signature),
            ]
        }
    };
    Ok(headers)
}
