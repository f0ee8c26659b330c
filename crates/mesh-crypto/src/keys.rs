//! RSA-4096 key pair management and peer key registration.
//!
//! The server holds one RSA-4096 key pair for its own identity (handshake
//! responses and message signing). Each connection registers exactly one
//! peer public key, parsed from an X.509 `SubjectPublicKeyInfo` blob.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::CryptoError;

/// RSA key size in bits, fixed by the wire protocol.
pub const KEY_BITS: usize = 4096;

/// A server (or peer) RSA key pair.
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    /// Generate a fresh RSA-4096 key pair from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Rsa`] if key generation fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(|e| CryptoError::Rsa(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// The private key, used for decrypting wrapped session keys and signing.
    #[must_use]
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// The public key, published in the handshake response.
    #[must_use]
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Encode the public key as Base64 of its X.509 `SubjectPublicKeyInfo` DER.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadKey`] if DER encoding fails.
    pub fn public_key_base64(&self) -> Result<String, CryptoError> {
        encode_public_key(&self.public)
    }

    /// Encode the private key as Base64 of its PKCS8 DER, for `keygen`-style
    /// persistence. The core never calls this; it exists for the operator
    /// binary to save a generated identity to disk.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadKey`] if DER encoding fails.
    pub fn private_key_base64(&self) -> Result<String, CryptoError> {
        let der = self
            .private
            .to_pkcs8_der()
            .map_err(|e| CryptoError::BadKey(e.to_string()))?;
        Ok(BASE64.encode(der.as_bytes()))
    }
}

/// On-startup key load: the core has no persistence of its own, so this
/// always generates a fresh key pair. A durable `UserStore`-style collaborator
/// may persist and reload the private key across restarts.
///
/// # Errors
///
/// Returns [`CryptoError::Rsa`] if key generation fails.
pub fn load_or_generate_server_key() -> Result<KeyPair, CryptoError> {
    KeyPair::generate()
}

/// Encode an RSA public key as Base64 of its X.509 `SubjectPublicKeyInfo` DER.
///
/// # Errors
///
/// Returns [`CryptoError::BadKey`] if DER encoding fails.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<String, CryptoError> {
    let der = key
        .to_public_key_der()
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

/// Parse a peer's public key from Base64-encoded X.509 `SubjectPublicKeyInfo`.
///
/// This is `registerPeerKey` from the handshake: callers associate the
/// returned key with a `connectionId` in their own registry.
///
/// # Errors
///
/// Returns [`CryptoError::BadKey`] if the Base64 or DER encoding is invalid.
pub fn register_peer_key(base64_spki: &str) -> Result<RsaPublicKey, CryptoError> {
    let der = BASE64
        .decode(base64_spki)
        .map_err(|e| CryptoError::BadKey(format!("invalid base64: {e}")))?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| CryptoError::BadKey(e.to_string()))
}
