//! Error types for the mesh crypto crate.

use thiserror::Error;

/// Errors raised by key management, encryption, and signing operations.
#[derive(Debug, Error, Clone)]
pub enum CryptoError {
    /// A peer public key could not be parsed as X.509 `SubjectPublicKeyInfo`.
    #[error("bad key: {0}")]
    BadKey(String),

    /// AES-256-GCM authentication tag verification failed during decryption.
    #[error("bad authentication tag")]
    BadTag,

    /// A signature did not verify against the expected public key.
    #[error("bad signature")]
    BadSignature,

    /// RSA encryption or decryption failed for a reason other than a bad key or tag.
    #[error("rsa operation failed: {0}")]
    Rsa(String),

    /// The OS CSPRNG failed to produce randomness.
    #[error("random number generation failed")]
    RandomFailed,

    /// A Base64-encoded wire value was malformed.
    #[error("invalid base64: {0}")]
    InvalidBase64(String),

    /// A decoded value had the wrong length for its purpose (e.g. a non-12-byte IV).
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },
}
