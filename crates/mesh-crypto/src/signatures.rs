//! SHA-256-with-RSA signatures (RSASSA-PKCS1-v1_5).
//!
//! The server signs every broadcast plaintext once with its own key; clients
//! (and, in tests, simulated peers) verify against the sender's registered
//! public key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier as SignatureVerifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::CryptoError;

/// Sign `plaintext` with `private_key`, returning Base64-encoded signature bytes.
///
/// # Errors
///
/// Returns [`CryptoError::Rsa`] if signing fails.
pub fn sign(plaintext: &str, private_key: &RsaPrivateKey) -> Result<String, CryptoError> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let mut rng = rand::rngs::OsRng;
    let signature = signing_key.sign_with_rng(&mut rng, plaintext.as_bytes());
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Verify a Base64-encoded signature over `plaintext` against `public_key`.
///
/// Returns `Ok(true)`/`Ok(false)` rather than erroring on a bad signature;
/// only malformed Base64 or signature encoding is an error.
///
/// # Errors
///
/// Returns [`CryptoError::BadSignature`] if the Base64 or signature
/// encoding itself is malformed (not merely cryptographically invalid).
pub fn verify(plaintext: &str, signature_base64: &str, public_key: &RsaPublicKey) -> Result<bool, CryptoError> {
    let sig_bytes = BASE64
        .decode(signature_base64)
        .map_err(|_| CryptoError::BadSignature)?;
    let signature = Signature::try_from(sig_bytes.as_slice()).map_err(|_| CryptoError::BadSignature)?;

    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    Ok(verifying_key.verify(plaintext.as_bytes(), &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn sign_verify_roundtrip() {
        let pair = KeyPair::generate().unwrap();
        let sig = sign("hello world", pair.private_key()).unwrap();
        assert!(verify("hello world", &sig, pair.public_key()).unwrap());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let pair = KeyPair::generate().unwrap();
        let sig = sign("hello world", pair.private_key()).unwrap();
        assert!(!verify("goodbye world", &sig, pair.public_key()).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let pair = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();
        let sig = sign("hello world", pair.private_key()).unwrap();
        assert!(!verify("hello world", &sig, other.public_key()).unwrap());
    }

    #[test]
    fn verify_rejects_malformed_base64() {
        let pair = KeyPair::generate().unwrap();
        assert!(verify("hello", "not-valid-base64!!!", pair.public_key()).is_err());
    }
}
