//! Per-connection session key: generation, RSA-OAEP wrapping, and
//! AES-256-GCM content encryption.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Length in bytes of an AES-256-GCM session key.
pub const SESSION_KEY_LEN: usize = 32;

/// Length in bytes of an AES-256-GCM IV (96-bit nonce).
pub const IV_LEN: usize = 12;

/// A 256-bit AES-GCM session key, owned by one connection for its lifetime.
///
/// Zeroized on drop so the key does not linger in memory past connection close.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Generate a fresh session key from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the CSPRNG is unavailable.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        getrandom::getrandom(&mut bytes).map_err(|_| CryptoError::RandomFailed)?;
        Ok(Self(bytes))
    }

    /// Build a session key from raw bytes, e.g. after RSA-OAEP unwrapping.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLength`] if `bytes` is not 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SESSION_KEY_LEN {
            return Err(CryptoError::InvalidLength {
                expected: SESSION_KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

/// Encrypted message content, as carried on the wire (`encryptedContent` + `iv`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    /// Base64-encoded AES-256-GCM ciphertext (includes the authentication tag).
    pub ciphertext: String,
    /// Base64-encoded 96-bit IV.
    pub iv: String,
}

/// RSA-OAEP-SHA-256 encrypt a session key under a peer's public key.
///
/// # Errors
///
/// Returns [`CryptoError::Rsa`] if encryption fails.
pub fn wrap_session_key(key: &SessionKey, peer_public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    let mut rng = OsRng;
    let padding = Oaep::new::<Sha256>();
    let wrapped = peer_public_key
        .encrypt(&mut rng, padding, key.as_bytes())
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;
    Ok(BASE64.encode(wrapped))
}

/// RSA-OAEP-SHA-256 decrypt a wrapped session key under a private key.
///
/// Used by test harnesses and any client-side simulation; the core server
/// only ever wraps, never unwraps, its own session keys.
///
/// # Errors
///
/// Returns [`CryptoError::BadKey`] if the Base64 is malformed, or
/// [`CryptoError::Rsa`] if RSA decryption fails.
pub fn unwrap_session_key(wrapped_base64: &str, private_key: &RsaPrivateKey) -> Result<SessionKey, CryptoError> {
    let wrapped = BASE64
        .decode(wrapped_base64)
        .map_err(|e| CryptoError::BadKey(format!("invalid base64: {e}")))?;
    let padding = Oaep::new::<Sha256>();
    let raw = private_key
        .decrypt(padding, &wrapped)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;
    SessionKey::from_bytes(&raw)
}

/// Encrypt `plaintext` with `key` under a freshly generated random IV.
///
/// The IV must never be reused with the same key; a new one is drawn from
/// the OS CSPRNG on every call.
///
/// # Errors
///
/// Returns [`CryptoError::Rsa`]-free AEAD failure as [`CryptoError::BadTag`]
/// only on decrypt; encryption itself only fails if key construction fails,
/// surfaced as [`CryptoError::InvalidLength`].
pub fn encrypt_message(plaintext: &str, key: &SessionKey) -> Result<Ciphertext, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut iv_bytes = [0u8; IV_LEN];
    AeadOsRng.fill_bytes(&mut iv_bytes);
    let nonce = Nonce::from_slice(&iv_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::BadTag)?;

    Ok(Ciphertext {
        ciphertext: BASE64.encode(ciphertext),
        iv: BASE64.encode(iv_bytes),
    })
}

/// Decrypt a `Ciphertext` with `key`, verifying the AES-GCM authentication tag.
///
/// # Errors
///
/// Returns [`CryptoError::BadTag`] if authentication fails, or
/// [`CryptoError::InvalidLength`] if the IV is not 12 bytes.
pub fn decrypt_message(ct: &Ciphertext, key: &SessionKey) -> Result<String, CryptoError> {
    let iv_bytes = BASE64
        .decode(&ct.iv)
        .map_err(|e| CryptoError::BadKey(format!("invalid base64 iv: {e}")))?;
    if iv_bytes.len() != IV_LEN {
        return Err(CryptoError::InvalidLength {
            expected: IV_LEN,
            actual: iv_bytes.len(),
        });
    }
    let data = BASE64
        .decode(&ct.ciphertext)
        .map_err(|e| CryptoError::BadKey(format!("invalid base64 ciphertext: {e}")))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&iv_bytes);

    let plaintext = cipher
        .decrypt(nonce, data.as_ref())
        .map_err(|_| CryptoError::BadTag)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::BadTag)
}
