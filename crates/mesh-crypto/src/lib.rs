//! # Mesh Crypto
//!
//! Cryptographic primitives for the encrypted chat mesh server.
//!
//! This crate provides:
//! - RSA-4096 key pair generation and X.509 `SubjectPublicKeyInfo` parsing
//! - RSA-OAEP-SHA-256 session key wrapping
//! - AES-256-GCM content encryption with a 96-bit IV and 128-bit tag
//! - SHA-256-with-RSA (RSASSA-PKCS1-v1_5) signing and verification
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Notes |
//! |----------|-----------|-------|
//! | Key wrap | RSA-4096-OAEP-SHA256 | wraps the per-connection session key |
//! | Content | AES-256-GCM | 96-bit IV, 128-bit tag, fresh IV per call |
//! | Signatures | SHA-256-with-RSA | server signs every broadcast plaintext |
//! | Wire encoding | Base64 (standard, padded) | all binary blobs |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod keys;
pub mod session;
pub mod signatures;

pub use error::CryptoError;
pub use keys::{KeyPair, load_or_generate_server_key, register_peer_key};
pub use session::{Ciphertext, SessionKey, decrypt_message, encrypt_message, unwrap_session_key, wrap_session_key};
pub use signatures::{sign, verify};
