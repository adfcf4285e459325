//! Per-chunk symmetric encryption with per-transfer keys sealed to a server public key.
//!
//! Each transfer generates a fresh random (nonce, key) pair, encrypts chunk bytes in place with
//! an XSalsa20 stream cipher, and seals the (nonce, key) to the server's long-lived X25519
//! public key so only the server can recover them. Sealed bytes travel as base64 headers.

use crate::environment::Environment;
use crate::error::{CryptoError, TaclError};
use crate::retry::{self};
use crate::runtime_config::RuntimeConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use crypto_box::PublicKey;
use rand::RngCore;
use rand::rngs::OsRng;
use salsa20::XSalsa20;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use serde::Deserialize;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Server public key fetched once per operation from `GET /v1/{pnum}/files/crypto/key`.
#[derive(Debug, Clone)]
pub struct ServerPublicKey(PublicKey);

impl ServerPublicKey {
    /// Decode a base64-encoded 32-byte X25519 public key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let raw = BASE64.decode(encoded)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| CryptoError::MalformedPublicKey("expected 32 bytes".into()))?;
        Ok(Self(PublicKey::from(bytes)))
    }
}

/// A freshly generated per-transfer (or per-chunk) symmetric key and nonce.
#[derive(Clone)]
pub struct EncryptionContext {
    key: [u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
}

impl EncryptionContext {
    /// Generate a random 32-byte key and 24-byte nonce.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);
        Self { key, nonce }
    }

    /// Encrypt `buf` in place with XSalsa20(nonce, key).
    pub fn encrypt_in_place(&self, buf: &mut [u8]) {
        let mut cipher = XSalsa20::new(&self.key.into(), &self.nonce.into());
        cipher.apply_keystream(buf);
    }

    /// Decrypt `buf` in place. XSalsa20 is its own inverse - same keystream XOR.
    pub fn decrypt_in_place(&self, buf: &mut [u8]) {
        self.encrypt_in_place(buf);
    }

    /// A standalone keystream cipher over this (key, nonce), for callers that need to apply it
    /// across a sequence of buffers (a streaming upload body, a downloaded response stream)
    /// rather than all at once.
    pub fn cipher(&self) -> XSalsa20 {
        XSalsa20::new(&self.key.into(), &self.nonce.into())
    }

    /// Seal `(nonce, key)` to the server's public key and base64-encode each, plus the given
    /// plaintext chunk size, ready to attach as `Nacl-Nonce` / `Nacl-Key` / `Nacl-Chunksize`
    /// headers.
    pub fn seal_headers(
        &self,
        server_key: &ServerPublicKey,
        chunk_size: u64,
    ) -> Result<EncryptionHeaders, CryptoError> {
        let sealed_nonce = seal(&server_key.0, &self.nonce)?;
        let sealed_key = seal(&server_key.0, &self.key)?;
        Ok(EncryptionHeaders {
            nonce: BASE64.encode(sealed_nonce),
            key: BASE64.encode(sealed_key),
            chunk_size,
        })
    }
}

/// Sealed-box-encrypt `message` to `recipient`, matching the client side of libsodium's
/// `crypto_box_seal`: an ephemeral keypair is generated, the message is boxed to `recipient`
/// with the ephemeral secret key, and the ephemeral public key is prepended.
fn seal(recipient: &PublicKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    crypto_box::seal::seal(&mut OsRng, recipient, message)
        .map_err(|err| CryptoError::Seal(err.to_string()))
}

/// Header values the uploader/downloader attach when encryption is enabled.
#[derive(Debug, Clone)]
pub struct EncryptionHeaders {
    pub nonce: String,
    pub key: String,
    pub chunk_size: u64,
}

pub const CONTENT_TYPE_ENCRYPTED: &str = "application/octet-stream+nacl";
pub const HEADER_NONCE: &str = "Nacl-Nonce";
pub const HEADER_KEY: &str = "Nacl-Key";
pub const HEADER_CHUNKSIZE: &str = "Nacl-Chunksize";

#[derive(Debug, Deserialize)]
struct ServerKeyResponse {
    key: String,
}

/// Fetch the server's long-lived public key once per operation: `GET
/// /v1/{pnum}/files/crypto/key`, base64-decoded into a [`ServerPublicKey`].
pub async fn fetch_server_key(
    http: &mut reqwest::Client,
    env: Environment,
    tenant: &str,
    access_token: &str,
    config: &RuntimeConfig,
) -> Result<ServerPublicKey, TaclError> {
    let url = format!("{}/{}/files/crypto/key", config.api_base(env), tenant);
    let outcome = retry::execute(
        http,
        |client| client.get(&url).bearer_auth(access_token),
        config,
    )
    .await?;
    if !outcome.response.status().is_success() {
        return Err(retry::into_error(outcome.response).await);
    }
    let parsed: ServerKeyResponse = outcome.response.json().await?;
    Ok(ServerPublicKey::from_base64(&parsed.key)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let ctx = EncryptionContext::generate();
        let original = b"hello from the chunk reader".to_vec();
        let mut buf = original.clone();
        ctx.encrypt_in_place(&mut buf);
        assert_ne!(buf, original);
        ctx.decrypt_in_place(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn two_generated_contexts_differ() {
        let a = EncryptionContext::generate();
        let b = EncryptionContext::generate();
        assert_ne!(a.key, b.key);
        assert_ne!(a.nonce, b.nonce);
    }
}
