//! Content-at-rest envelope encryption.
//!
//! When `MEMORYX_CONTENT_KEY` is configured, memory content is sealed with
//! XChaCha20-Poly1305 before it reaches the relational store. The key is a
//! hex-encoded 32-byte value; each record gets a fresh random nonce.

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, XChaCha20Poly1305,
};

use crate::types::StoredContent;

/// AEAD cipher over memory content. Cheap to clone, safe to share.
#[derive(Clone)]
pub struct ContentCipher {
    cipher: XChaCha20Poly1305,
}

impl ContentCipher {
    /// Build from a hex-encoded 32-byte key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = decode_hex(hex_key).context("MEMORYX_CONTENT_KEY is not valid hex")?;
        if bytes.len() != 32 {
            return Err(anyhow!(
                "content key must be 32 bytes, got {} bytes",
                bytes.len()
            ));
        }
        let cipher = XChaCha20Poly1305::new_from_slice(&bytes)
            .map_err(|e| anyhow!("invalid content key: {e}"))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &str) -> Result<StoredContent> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("content encryption failed: {e}"))?;
        Ok(StoredContent::Sealed {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    pub fn open(&self, content: &StoredContent) -> Result<String> {
        match content {
            StoredContent::Plain(text) => Ok(text.clone()),
            StoredContent::Sealed { nonce, ciphertext } => {
                let nonce = chacha20poly1305::XNonce::from_slice(nonce);
                let plaintext = self
                    .cipher
                    .decrypt(nonce, ciphertext.as_slice())
                    .map_err(|e| anyhow!("content decryption failed: {e}"))?;
                String::from_utf8(plaintext).context("decrypted content is not UTF-8")
            }
        }
    }
}

/// Seal content with an optional cipher; pass-through when none configured.
pub fn seal_content(cipher: Option<&ContentCipher>, plaintext: &str) -> Result<StoredContent> {
    match cipher {
        Some(c) => c.seal(plaintext),
        None => Ok(StoredContent::Plain(plaintext.to_string())),
    }
}

/// Open content with an optional cipher. A sealed record without a cipher
/// is a configuration error, not silently empty.
pub fn open_content(cipher: Option<&ContentCipher>, content: &StoredContent) -> Result<String> {
    match (cipher, content) {
        (_, StoredContent::Plain(text)) => Ok(text.clone()),
        (Some(c), sealed) => c.open(sealed),
        (None, StoredContent::Sealed { .. }) => Err(anyhow!(
            "record is encrypted but no content key is configured"
        )),
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("odd-length hex string"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| anyhow!("bad hex: {e}")))
        .collect()
}
