//! At-rest sealing of credentials
//!
//! Access and refresh tokens are sealed with AES-256-GCM before they reach a
//! persistence backend. Each sealed value is `base64(nonce || ciphertext || tag)`
//! and is bound to the record and field it belongs to, so a sealed refresh
//! token cannot be replayed as another record's credential.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::{
    aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN},
    rand::{SecureRandom, SystemRandom},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEY_LEN: usize = 32;

/// An error while sealing or opening a credential
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The key is not valid base64
    #[error("encryption key is not valid base64")]
    KeyEncoding(#[from] base64::DecodeError),
    /// The key has the wrong length
    #[error("encryption key must be 32 bytes, got {0}")]
    KeyLength(usize),
    /// The system random number generator failed
    #[error("unable to obtain randomness from the system")]
    Random,
    /// Sealing failed
    #[error("unable to seal credential")]
    Seal,
    /// The sealed value is malformed, was tampered with, or was sealed with another key
    #[error("unable to open sealed credential")]
    Open,
    /// The opened value is not UTF-8
    #[error("sealed credential is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A sealed credential as stored at rest
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedSecret(String);

impl SealedSecret {
    /// The encoded form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SealedSecret({} bytes)", self.0.len())
    }
}

/// Seals and opens credentials with a single AES-256-GCM key
pub struct TokenCipher {
    key: LessSafeKey,
    rng: SystemRandom,
    ephemeral: bool,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCipher")
            .field("key", &"[REDACTED]")
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

impl TokenCipher {
    /// Constructs a cipher from raw key bytes
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::KeyLength(bytes.len()));
        }

        let unbound =
            UnboundKey::new(&AES_256_GCM, bytes).map_err(|_| CryptoError::KeyLength(bytes.len()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
            ephemeral: false,
        })
    }

    /// Constructs a cipher from a base64-encoded key
    pub fn from_base64_key(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(encoded.trim())?;
        Self::from_key_bytes(&bytes)
    }

    /// Constructs a cipher with a freshly generated key that lives only as
    /// long as this process
    ///
    /// Anything sealed with it becomes unreadable after a restart, so this is
    /// only suitable for development or for purely in-memory stores.
    pub fn ephemeral() -> Result<Self, CryptoError> {
        let key = Self::generate_key_bytes()?;
        let mut cipher = Self::from_key_bytes(&key)?;
        cipher.ephemeral = true;
        tracing::warn!(
            "no encryption key configured; generated an ephemeral key for this process. \
             Stored tokens will not survive a restart. Do not use this outside development."
        );
        Ok(cipher)
    }

    /// Generates a new random key, base64-encoded, suitable for configuration
    pub fn generate_key() -> Result<String, CryptoError> {
        Ok(BASE64.encode(Self::generate_key_bytes()?))
    }

    fn generate_key_bytes() -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| CryptoError::Random)?;
        Ok(key)
    }

    /// Whether the key was generated for this process only
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Seals `plaintext`, binding it to `context`
    pub fn seal(&self, plaintext: &str, context: &str) -> Result<SealedSecret, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Random)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(context.as_bytes()), &mut in_out)
            .map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(SealedSecret(BASE64.encode(out)))
    }

    /// Opens a value sealed by [`seal`](Self::seal) with the same `context`
    pub fn open(&self, sealed: &SealedSecret, context: &str) -> Result<String, CryptoError> {
        let mut data = BASE64.decode(&sealed.0).map_err(|_| CryptoError::Open)?;
        if data.len() < NONCE_LEN {
            return Err(CryptoError::Open);
        }

        let mut ciphertext = data.split_off(NONCE_LEN);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&data);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(context.as_bytes()), &mut ciphertext)
            .map_err(|_| CryptoError::Open)?;

        Ok(String::from_utf8(plaintext.to_vec())?)
    }
}
