use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Checks payment signatures issued by the gateway.
///
/// The checkout signature is `hex(HMAC-SHA256(key_secret, "{order_id}|{payment_id}"))`; webhook
/// deliveries carry `hex(HMAC-SHA256(webhook_secret, raw_body))`.
#[derive(Clone)]
pub struct PaymentVerifier {
    key_secret: String,
    webhook_secret: Option<String>,
}

impl std::fmt::Debug for PaymentVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentVerifier")
            .field("key_secret", &"<redacted>")
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl PaymentVerifier {
    pub fn new(key_secret: impl Into<String>) -> Self {
        Self {
            key_secret: key_secret.into(),
            webhook_secret: None,
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn has_webhook_secret(&self) -> bool {
        self.webhook_secret.is_some()
    }

    pub fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        let payload = format!("{order_id}|{payment_id}");
        verify_hex_hmac(self.key_secret.as_bytes(), payload.as_bytes(), signature)
    }

    /// Always false when no webhook secret is configured.
    pub fn verify_webhook(&self, body: &[u8], signature: &str) -> bool {
        let Some(secret) = self.webhook_secret.as_deref() else {
            return false;
        };
        verify_hex_hmac(secret.as_bytes(), body, signature)
    }

    pub fn sign(&self, order_id: &str, payment_id: &str) -> String {
        let payload = format!("{order_id}|{payment_id}");
        hex_encode(&hmac_sha256(self.key_secret.as_bytes(), payload.as_bytes()))
    }

    pub fn sign_webhook(&self, body: &[u8]) -> Option<String> {
        let secret = self.webhook_secret.as_deref()?;
        Some(hex_encode(&hmac_sha256(secret.as_bytes(), body)))
    }
}

fn verify_hex_hmac(key: &[u8], payload: &[u8], signature: &str) -> bool {
    let Some(expected) = hex_decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

fn hmac_sha256(key: &[u8], payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    match HmacSha256::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Vec::new(),
    }
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return None;
    }
    raw.as_bytes()
        .chunks_exact(2)
        .map(|pair| Some((hex_value(pair[0])? << 4) | hex_value(pair[1])?))
        .collect()
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}
