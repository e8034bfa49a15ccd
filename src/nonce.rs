//! # Challenge Nonces
//!
//! TLS 1.2 has no application-data channel before the certificates are sent,
//! so each side tunnels its challenge through a handshake field that is read
//! before the peer picks its certificate:
//!
//! | Role | Carrier | Peer reads it in |
//! |------|---------|------------------|
//! | initiator | SNI `server_name` | `ResolvesServerCert::resolve` |
//! | responder | CertificateRequest CA names | `ResolvesClientCert::resolve` |
//!
//! rustls only accepts DNS syntax in SNI, so there the nonce travels as two
//! hex labels followed by [`SNI_NONCE_LABEL`]. The CA-name carrier takes the
//! raw bytes.
//!
//! Nonces never contain `.`, `[`, `]` or `%`, which keeps the raw value legal
//! in any hostname-shaped field.

use std::fmt;

use rustls::pki_types::ServerName;
use rustls::DistinguishedName;
use thiserror::Error;

use crate::suite::Suite;

/// Nonce length in bytes (256 bits).
pub const NONCE_SIZE: usize = 256 / 8;

/// Bytes a nonce may not contain.
pub const FORBIDDEN_NONCE_BYTES: &[u8] = b".[]%";

/// Final SNI label marking a tunneled nonce.
pub const SNI_NONCE_LABEL: &str = "nonce";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NonceError {
    #[error("nonce is the wrong size: expected {NONCE_SIZE} bytes, got {actual}")]
    InvalidSize { actual: usize },

    #[error("peer did not send a server name")]
    MissingServerName,

    #[error("server name {0:?} does not carry a nonce")]
    MalformedServerName(String),

    #[error("peer did not provide a nonce in the acceptable CA list")]
    MissingHint,
}

/// A single-use 256-bit challenge.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Draws a fresh nonce from the suite's randomness, redrawing until it is
    /// free of [`FORBIDDEN_NONCE_BYTES`].
    pub fn generate<S: Suite>(suite: &S) -> Self {
        let mut buf = [0u8; NONCE_SIZE];
        loop {
            suite.random_bytes(&mut buf);
            if !buf.iter().any(|b| FORBIDDEN_NONCE_BYTES.contains(b)) {
                return Self(buf);
            }
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, NonceError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| NonceError::InvalidSize {
                actual: bytes.len(),
            })
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    // ------------------------------------------------------------------------
    // Initiator carrier: SNI
    // ------------------------------------------------------------------------

    /// `<hex[..32]>.<hex[32..]>.nonce`
    pub fn to_server_name(&self) -> String {
        let hex = hex::encode(self.0);
        format!("{}.{}.{}", &hex[..NONCE_SIZE], &hex[NONCE_SIZE..], SNI_NONCE_LABEL)
    }

    /// The SNI carrier as a rustls server name.
    pub fn server_name(&self) -> Result<ServerName<'static>, NonceError> {
        let name = self.to_server_name();
        ServerName::try_from(name.clone()).map_err(|_| NonceError::MalformedServerName(name))
    }

    pub fn from_server_name(name: &str) -> Result<Self, NonceError> {
        let malformed = || NonceError::MalformedServerName(name.to_string());

        let mut labels = name.split('.');
        let (Some(high), Some(low), Some(SNI_NONCE_LABEL), None) =
            (labels.next(), labels.next(), labels.next(), labels.next())
        else {
            return Err(malformed());
        };
        if high.len() != NONCE_SIZE || low.len() != NONCE_SIZE {
            return Err(malformed());
        }

        let mut buf = [0u8; NONCE_SIZE];
        hex::decode_to_slice(format!("{high}{low}"), &mut buf).map_err(|_| malformed())?;
        Ok(Self(buf))
    }

    // ------------------------------------------------------------------------
    // Responder carrier: acceptable CA names
    // ------------------------------------------------------------------------

    pub fn to_ca_hint(&self) -> DistinguishedName {
        DistinguishedName::from(self.0.to_vec())
    }

    /// Reads the nonce from the first acceptable-CA entry.
    pub fn from_ca_hints(hints: &[&[u8]]) -> Result<Self, NonceError> {
        let first = hints.first().ok_or(NonceError::MissingHint)?;
        Self::from_slice(first)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(&self.0[..8]))
    }
}
