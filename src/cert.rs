//! # Identity Certificates
//!
//! Certificates are minted on demand, one per handshake, and never stored.
//!
//! - The certificate key is an ephemeral ECDSA P-256 keypair, chosen because
//!   every TLS 1.2 stack can use it. It self-signs the certificate.
//! - The subject CommonName names the long-term public key (see
//!   [`crate::identity::pub_to_cn`]).
//! - A non-critical extension ([`PROOF_EXTENSION_OID`]) carries a long-term
//!   signature over `peer_nonce || DER(CommonName)`.
//!
//! The long-term key never signs the certificate itself: its algorithm may not
//! be one TLS 1.2 understands. It only signs the proof, and the proof is over
//! the *peer's* nonce, so a captured certificate is useless in any other
//! handshake.
//!
//! [`CertIssuer`] plugs into rustls as both [`ResolvesServerCert`] (nonce from
//! SNI) and [`ResolvesClientCert`] (nonce from the CA hints).

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use rcgen::{
    CertificateParams, CustomExtension, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, PrintableString, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, SigningKey};
use rustls::SignatureScheme;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{trace, warn};
use x509_parser::der_parser::asn1_rs::{self, ToDer};

use crate::identity::{pub_to_cn, ServerIdentity};
use crate::nonce::{Nonce, NonceError, NONCE_SIZE};
use crate::suite::{Suite, SuiteError};

/// Registered arc for the long-term key proof extension.
pub const PROOF_EXTENSION_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 51281, 1, 1];

/// How far `not_before` is backdated to absorb clock skew.
pub const CERT_BACKDATE: Duration = Duration::from_secs(5 * 60);

/// Lifetime of an issued certificate from the moment of issuance.
pub const CERT_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Length of the random serial number (128 bits).
const SERIAL_LEN: usize = 16;

/// Lazily-initialized crypto provider for rustls, backed by ring.
pub(crate) static CRYPTO_PROVIDER: LazyLock<Arc<CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("nonce is the wrong size: expected {NONCE_SIZE} bytes, got {actual}")]
    InvalidNonceSize { actual: usize },

    #[error("private key is not set")]
    MissingPrivateKey,

    #[error("failed to generate ephemeral key: {0}")]
    KeyGeneration(#[source] rcgen::Error),

    #[error("failed to sign proof: {0}")]
    Sign(#[from] SuiteError),

    #[error("failed to encode subject: {0}")]
    Subject(String),

    #[error("failed to encode certificate: {0}")]
    Encode(#[from] rcgen::Error),

    #[error("ephemeral key rejected by TLS provider: {0}")]
    SigningKey(#[from] rustls::Error),
}

/// A freshly issued certificate together with the key that can use it.
#[derive(Debug, Clone)]
pub struct IdentityCertificate {
    certified: Arc<CertifiedKey>,
}

impl IdentityCertificate {
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.certified.cert[0]
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }
}

/// Issues identity certificates for one long-term identity.
///
/// The ephemeral keypair is created in [`CertIssuer::new`] and reused for every
/// certificate this issuer mints. It is read-only afterwards, so one issuer can
/// serve any number of concurrent handshakes.
pub struct CertIssuer<S: Suite> {
    suite: Arc<S>,
    identity: Arc<ServerIdentity<S>>,
    subject: String,
    subject_der: Vec<u8>,
    key_pair: KeyPair,
    signing_key: Arc<dyn SigningKey>,
}

impl<S: Suite> CertIssuer<S> {
    pub fn new(suite: Arc<S>, identity: Arc<ServerIdentity<S>>) -> Result<Self, IssueError> {
        if identity.private().is_none() {
            return Err(IssueError::MissingPrivateKey);
        }

        let key_pair =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(IssueError::KeyGeneration)?;
        let pkcs8 = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = CRYPTO_PROVIDER.key_provider.load_private_key(pkcs8)?;

        let subject = pub_to_cn(&*suite, identity.public());
        let subject_der = subject_der(&subject)?;

        Ok(Self {
            suite,
            identity,
            subject,
            subject_der,
            key_pair,
            signing_key,
        })
    }

    /// CommonName placed in every certificate from this issuer.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Mints a certificate proving control of the long-term key to whoever
    /// generated `nonce`.
    pub fn issue(&self, nonce: &[u8]) -> Result<IdentityCertificate, IssueError> {
        if nonce.len() != NONCE_SIZE {
            return Err(IssueError::InvalidNonceSize {
                actual: nonce.len(),
            });
        }
        let secret = self
            .identity
            .private()
            .ok_or(IssueError::MissingPrivateKey)?;
        let proof = self
            .suite
            .sign(secret, &proof_message(nonce, &self.subject_der))?;

        // Unused by the proof, but TLS peers expect distinct serials for
        // distinct keys from the same issuer.
        let mut serial = [0u8; SERIAL_LEN];
        self.suite.random_bytes(&mut serial);
        serial[0] = (serial[0] & 0x7f) | 0x40;

        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::PrintableString(PrintableString::try_from(self.subject.as_str())?),
        );
        params.not_before = now - CERT_BACKDATE;
        params.not_after = now + CERT_LIFETIME;
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.is_ca = IsCa::ExplicitNoCa;
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.custom_extensions = vec![CustomExtension::from_oid_content(
            PROOF_EXTENSION_OID,
            proof,
        )];

        let cert = params.self_signed(&self.key_pair)?;
        trace!(subject = %self.subject, "issued identity certificate");

        Ok(IdentityCertificate {
            certified: Arc::new(CertifiedKey::new(
                vec![cert.der().clone()],
                Arc::clone(&self.signing_key),
            )),
        })
    }

    fn issue_for_handshake(&self, nonce: Result<Nonce, NonceError>) -> Option<Arc<CertifiedKey>> {
        let nonce = match nonce {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(error = %e, "peer did not supply a usable nonce");
                return None;
            }
        };
        match self.issue(nonce.as_bytes()) {
            Ok(cert) => Some(cert.certified_key()),
            Err(e) => {
                warn!(error = %e, subject = %self.subject, "certificate issuance failed");
                None
            }
        }
    }
}

impl<S: Suite> fmt::Debug for CertIssuer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertIssuer")
            .field("suite", &self.suite.name())
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

impl<S: Suite> ResolvesServerCert for CertIssuer<S> {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let nonce = client_hello
            .server_name()
            .ok_or(NonceError::MissingServerName)
            .and_then(Nonce::from_server_name);
        self.issue_for_handshake(nonce)
    }
}

impl<S: Suite> ResolvesClientCert for CertIssuer<S> {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.issue_for_handshake(Nonce::from_ca_hints(root_hint_subjects))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// `nonce || subject_der`, the message covered by the proof extension.
pub(crate) fn proof_message(nonce: &[u8], subject_der: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(nonce.len() + subject_der.len());
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(subject_der);
    msg
}

/// DER encoding of the CommonName value as an ASN.1 PrintableString, the
/// form this issuer writes into the subject.
pub(crate) fn subject_der(cn: &str) -> Result<Vec<u8>, IssueError> {
    asn1_rs::PrintableString::new(cn)
        .to_der_vec()
        .map_err(|e| IssueError::Subject(e.to_string()))
}
