//! Errors surfaced by [`crate::connect`], [`crate::listen`] and [`crate::Conn`].

use std::io;

use thiserror::Error;

use crate::cert::IssueError;
use crate::identity::Address;
use crate::nonce::NonceError;
use crate::verify::VerifyError;

#[derive(Debug, Error)]
pub enum Error {
    /// The remote address does not use the TLS transport.
    #[error("{address} is not a tls address")]
    NotTls { address: Address },

    /// The local identity has no private key to prove itself with.
    #[error("private key is not set")]
    MissingPrivateKey,

    /// Issuance failed for a reason other than a missing private key, which
    /// is always reported as [`Error::MissingPrivateKey`].
    #[error("certificate issuance failed: {0}")]
    Issue(#[source] IssueError),

    #[error("nonce channel error: {0}")]
    Nonce(#[from] NonceError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),

    /// Our verifier rejected the peer's certificate.
    #[error("handshake verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// The handshake failed for any other reason, including the peer
    /// rejecting our certificate.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// Every dial attempt failed. `source` is the error of the last attempt.
    #[error("timed out connecting to {address} after {attempts} attempts")]
    ConnectTimeout {
        address: Address,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("packet of {size} bytes exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },
}

impl From<IssueError> for Error {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::MissingPrivateKey => Error::MissingPrivateKey,
            other => Error::Issue(other),
        }
    }
}

impl Error {
    /// Configuration problems abort `connect` before any dial attempt and are
    /// never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::NotTls { .. } | Error::MissingPrivateKey | Error::TlsConfig(_)
        )
    }

    /// Verification failure behind this error, looking through retries.
    pub fn verify_error(&self) -> Option<&VerifyError> {
        match self {
            Error::Verify(e) => Some(e),
            Error::ConnectTimeout { source, .. } => source.verify_error(),
            _ => None,
        }
    }
}
