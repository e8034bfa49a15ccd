//! # peertls - Zero-Configuration Mutual TLS Between Nodes
//!
//! peertls authenticates both ends of a TCP connection by their long-term
//! signing keys, using nothing but a stock TLS 1.2 handshake:
//!
//! - **No PKI**: no certificate authority, no certificate or key files
//! - **Ephemeral certificates**: minted per handshake, self-signed by a
//!   throwaway ECDSA key, valid for two hours
//! - **Proof of possession**: each certificate carries a long-term-key
//!   signature over a nonce chosen by the *peer*, so it cannot be replayed
//!
//! ## Handshake
//!
//! ```text
//! initiator                                   responder
//!   nonce_c ──── SNI server_name ───────────▶  issue(nonce_c) → cert_s
//!           ◀─── cert_s + CertificateRequest ── CA names = nonce_s
//!   verify(cert_s, nonce_c, expected)
//!   issue(nonce_s) → cert_c ────────────────▶  verify(cert_c, nonce_s)
//! ```
//!
//! The responder accepts any peer that proves its own key; the initiator also
//! checks that the responder is the identity it meant to reach.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `suite` | Long-term key group, signatures, randomness (`Suite`, `Ed25519Suite`) |
//! | `identity` | `ServerIdentity`, `Address`, certificate subject encoding |
//! | `nonce` | Challenge generation and the two handshake carriers |
//! | `cert` | Ephemeral identity certificate issuance |
//! | `verify` | Peer certificate verification |
//! | `config` | Retry and timeout settings |
//! | `transport` | `connect`, `listen`, `Conn` |
//! | `error` | Error taxonomy |

mod cert;
mod config;
mod error;
mod identity;
mod nonce;
mod suite;
mod transport;
mod verify;

pub use cert::{
    CertIssuer, IdentityCertificate, IssueError, CERT_BACKDATE, CERT_LIFETIME, PROOF_EXTENSION_OID,
};
pub use config::{
    DialConfig, DIAL_TIMEOUT, HANDSHAKE_TIMEOUT, MAX_PACKET_SIZE, MAX_RETRY_CONNECT, WAIT_RETRY,
};
pub use error::Error;
pub use identity::{
    pub_from_cn, pub_to_cn, Address, AddressError, ConnType, ServerIdentity, SubjectError,
    CN_PREFIX,
};
pub use nonce::{Nonce, NonceError, FORBIDDEN_NONCE_BYTES, NONCE_SIZE, SNI_NONCE_LABEL};
pub use suite::{Ed25519Suite, Suite, SuiteError};
pub use transport::{
    connect, connect_with, listen, listen_with, Conn, ListenerConfig, TlsListener, ALPN,
};
pub use verify::{peer_public, verify_error_of, PeerVerifier, VerifyError};
