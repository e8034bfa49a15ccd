//! # Cryptographic Suite
//!
//! The long-term identity of a node lives in a signature group that is chosen
//! by the application, not by the TLS stack. This module defines the narrow
//! interface the handshake needs from that group:
//!
//! - **Point codec**: marshal/unmarshal of long-term public keys
//! - **Signatures**: Schnorr-style sign and verify over arbitrary bytes
//! - **Randomness**: uniformly random bytes for nonces and serial numbers
//!
//! [`Ed25519Suite`] is the implementation used by the binary and the tests.
//!
//! ## Concurrency
//!
//! A suite is shared by every in-flight handshake, so implementations must be
//! `Send + Sync` and must not hold mutable state behind `&self`.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Length of an Ed25519 public key encoding.
pub const ED25519_POINT_LEN: usize = 32;

/// Length of an Ed25519 signature.
pub const ED25519_SIGNATURE_LEN: usize = 64;

/// Errors raised by suite operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuiteError {
    /// Encoded point has the wrong number of bytes.
    #[error("point encoding has invalid length: expected {expected}, got {actual}")]
    InvalidPointLength { expected: usize, actual: usize },

    /// Bytes have the right length but do not decode to a group element.
    #[error("bytes do not encode a valid group point")]
    InvalidPoint,

    /// Signature has the wrong number of bytes.
    #[error("signature has invalid length: expected {expected}, got {actual}")]
    InvalidSignatureLength { expected: usize, actual: usize },

    /// Signature does not verify for the given key and message.
    #[error("signature verification failed")]
    VerificationFailed,

    /// The signer could not produce a signature.
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Group arithmetic, signature scheme and randomness for long-term identities.
pub trait Suite: Send + Sync + 'static {
    /// Long-term public key.
    type Point: Clone + PartialEq + fmt::Debug + Send + Sync + Unpin + 'static;
    /// Long-term private key.
    type Scalar: Send + Sync + 'static;

    /// Short human-readable suite name, used in logs.
    fn name(&self) -> &'static str;

    /// Canonical byte encoding of a public key.
    fn marshal_point(&self, point: &Self::Point) -> Vec<u8>;

    /// Inverse of [`Suite::marshal_point`]. Trailing bytes are rejected.
    fn unmarshal_point(&self, bytes: &[u8]) -> Result<Self::Point, SuiteError>;

    /// Fresh private key from the suite's randomness source.
    fn generate_secret(&self) -> Self::Scalar;

    /// Public key belonging to `secret`.
    fn public_from_secret(&self, secret: &Self::Scalar) -> Self::Point;

    fn sign(&self, secret: &Self::Scalar, msg: &[u8]) -> Result<Vec<u8>, SuiteError>;

    fn verify(&self, public: &Self::Point, msg: &[u8], sig: &[u8]) -> Result<(), SuiteError>;

    /// Fill `buf` with uniformly random bytes. Must tolerate concurrent callers.
    fn random_bytes(&self, buf: &mut [u8]);
}

/// Ed25519 long-term identities (Schnorr signatures over edwards25519).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Suite;

impl Suite for Ed25519Suite {
    type Point = VerifyingKey;
    type Scalar = SigningKey;

    fn name(&self) -> &'static str {
        "Ed25519"
    }

    fn marshal_point(&self, point: &VerifyingKey) -> Vec<u8> {
        point.to_bytes().to_vec()
    }

    fn unmarshal_point(&self, bytes: &[u8]) -> Result<VerifyingKey, SuiteError> {
        let arr: [u8; ED25519_POINT_LEN] =
            bytes
                .try_into()
                .map_err(|_| SuiteError::InvalidPointLength {
                    expected: ED25519_POINT_LEN,
                    actual: bytes.len(),
                })?;
        VerifyingKey::from_bytes(&arr).map_err(|_| SuiteError::InvalidPoint)
    }

    fn generate_secret(&self) -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn public_from_secret(&self, secret: &SigningKey) -> VerifyingKey {
        secret.verifying_key()
    }

    fn sign(&self, secret: &SigningKey, msg: &[u8]) -> Result<Vec<u8>, SuiteError> {
        Ok(secret.sign(msg).to_bytes().to_vec())
    }

    fn verify(&self, public: &VerifyingKey, msg: &[u8], sig: &[u8]) -> Result<(), SuiteError> {
        let sig_bytes: [u8; ED25519_SIGNATURE_LEN] =
            sig.try_into()
                .map_err(|_| SuiteError::InvalidSignatureLength {
                    expected: ED25519_SIGNATURE_LEN,
                    actual: sig.len(),
                })?;
        let sig = Signature::from_bytes(&sig_bytes);
        public
            .verify_strict(msg, &sig)
            .map_err(|_| SuiteError::VerificationFailed)
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_succeeds() {
        let suite = Ed25519Suite;
        let secret = suite.generate_secret();
        let public = suite.public_from_secret(&secret);

        let sig = suite.sign(&secret, b"challenge").expect("signing must succeed");
        assert_eq!(sig.len(), ED25519_SIGNATURE_LEN);
        suite
            .verify(&public, b"challenge", &sig)
            .expect("signature must verify");
    }

    #[test]
    fn verify_rejects_other_message_and_other_key() {
        let suite = Ed25519Suite;
        let secret = suite.generate_secret();
        let other = suite.public_from_secret(&suite.generate_secret());
        let sig = suite.sign(&secret, b"challenge").unwrap();

        assert_eq!(
            suite.verify(&suite.public_from_secret(&secret), b"other", &sig),
            Err(SuiteError::VerificationFailed)
        );
        assert_eq!(
            suite.verify(&other, b"challenge", &sig),
            Err(SuiteError::VerificationFailed)
        );
    }

    #[test]
    fn verify_rejects_truncated_signature() {
        let suite = Ed25519Suite;
        let secret = suite.generate_secret();
        let sig = suite.sign(&secret, b"m").unwrap();

        assert_eq!(
            suite.verify(&suite.public_from_secret(&secret), b"m", &sig[..63]),
            Err(SuiteError::InvalidSignatureLength {
                expected: ED25519_SIGNATURE_LEN,
                actual: 63
            })
        );
    }

    #[test]
    fn point_codec_round_trips_and_checks_length() {
        let suite = Ed25519Suite;
        let public = suite.public_from_secret(&suite.generate_secret());
        let bytes = suite.marshal_point(&public);

        assert_eq!(suite.unmarshal_point(&bytes).unwrap(), public);
        assert_eq!(
            suite.unmarshal_point(&bytes[..31]),
            Err(SuiteError::InvalidPointLength {
                expected: ED25519_POINT_LEN,
                actual: 31
            })
        );

        let mut long = bytes.clone();
        long.push(0);
        assert!(suite.unmarshal_point(&long).is_err());
    }

    #[test]
    fn random_bytes_are_not_constant() {
        let suite = Ed25519Suite;
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        suite.random_bytes(&mut a);
        suite.random_bytes(&mut b);
        assert_ne!(a, b);
    }
}
