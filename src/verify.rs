//! # Peer Certificate Verification
//!
//! [`PeerVerifier`] replaces rustls' chain validation on both sides of the
//! handshake. Each verifier is created for exactly one handshake: it captures
//! a freshly generated [`Nonce`] (which the caller tunnels to the peer) and,
//! for outbound connections, the identity the caller expects to reach.
//!
//! ## Checks (first failure wins)
//!
//! 1. exactly one certificate presented
//! 2. valid self-signature, inside its validity window
//! 3. subject equals the expected identity (outbound only)
//! 4. proof extension present
//! 5. subject decodes to a long-term public key
//! 6. proof verifies over `our_nonce || DER(subject)` under that key
//!
//! Inbound verifiers skip step 3: they establish that the peer holds the key it
//! names, not who that key belongs to. Callers that need authorization should
//! inspect [`crate::Conn::peer_public`].

use std::fmt;
use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, SignatureScheme};
use thiserror::Error;
use tracing::{debug, trace};
use x509_parser::der_parser::asn1_rs::ToDer;
use x509_parser::prelude::*;

use crate::cert::{proof_message, CRYPTO_PROVIDER, PROOF_EXTENSION_OID};
use crate::identity::{pub_from_cn, pub_to_cn, ServerIdentity};
use crate::nonce::Nonce;
use crate::suite::Suite;

/// Reasons a peer certificate is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("expected exactly one certificate, got {0}")]
    MalformedChain(usize),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("certificate is outside its validity window")]
    Expired,

    #[error("certificate names {actual}, expected {expected}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("proof extension not found")]
    MissingProofExtension,

    #[error("proof signature does not verify")]
    InvalidProofSignature,
}

impl From<VerifyError> for rustls::Error {
    fn from(err: VerifyError) -> Self {
        rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(err))))
    }
}

/// One-shot verifier bound to a nonce and, optionally, an expected peer.
pub struct PeerVerifier<S: Suite> {
    suite: Arc<S>,
    nonce: Nonce,
    expected: Option<String>,
    hints: Vec<DistinguishedName>,
}

impl<S: Suite> PeerVerifier<S> {
    /// Verifier for an inbound handshake: fresh nonce, no identity constraint.
    pub fn for_server(suite: Arc<S>) -> Self {
        let nonce = Nonce::generate(&*suite);
        Self::with_nonce(suite, nonce, None)
    }

    /// Verifier for an outbound handshake to `them`.
    pub fn for_client(suite: Arc<S>, them: &ServerIdentity<S>) -> Self {
        let nonce = Nonce::generate(&*suite);
        Self::with_nonce(suite, nonce, Some(them.public()))
    }

    pub fn with_nonce(suite: Arc<S>, nonce: Nonce, expected: Option<&S::Point>) -> Self {
        let expected = expected.map(|public| pub_to_cn(&*suite, public));
        Self {
            suite,
            hints: vec![nonce.to_ca_hint()],
            nonce,
            expected,
        }
    }

    /// The challenge the peer must sign.
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Runs every check against `chain` at time `now`, returning the peer's
    /// long-term public key on success.
    pub fn verify(&self, chain: &[CertificateDer<'_>], now: UnixTime) -> Result<S::Point, VerifyError> {
        let [end_entity] = chain else {
            return Err(VerifyError::MalformedChain(chain.len()));
        };

        let (rest, cert) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|e| VerifyError::InvalidCertificate(e.to_string()))?;
        if !rest.is_empty() {
            return Err(VerifyError::InvalidCertificate(
                "trailing data after certificate".into(),
            ));
        }

        cert.verify_signature(None)
            .map_err(|e| VerifyError::InvalidCertificate(format!("bad self-signature: {e}")))?;

        let now = i64::try_from(now.as_secs()).unwrap_or(i64::MAX);
        let validity = cert.validity();
        if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
            return Err(VerifyError::Expired);
        }

        let cn_attr = common_name_attr(&cert)?;
        let cn = common_name(cn_attr)?;
        if let Some(expected) = &self.expected {
            if cn != expected.as_str() {
                return Err(VerifyError::IdentityMismatch {
                    expected: expected.clone(),
                    actual: cn.to_string(),
                });
            }
        }

        let proof = cert
            .extensions()
            .iter()
            .find(|ext| {
                ext.oid
                    .iter()
                    .is_some_and(|arcs| arcs.eq(PROOF_EXTENSION_OID.iter().copied()))
            })
            .map(|ext| ext.value)
            .ok_or(VerifyError::MissingProofExtension)?;

        let public = pub_from_cn(&*self.suite, cn)
            .map_err(|e| VerifyError::InvalidCertificate(e.to_string()))?;

        // The proof covers the CN exactly as the peer encoded it.
        let cn_der = cn_attr
            .attr_value()
            .to_der_vec()
            .map_err(|e| VerifyError::InvalidCertificate(format!("cannot encode common name: {e}")))?;
        let msg = proof_message(self.nonce.as_bytes(), &cn_der);
        self.suite
            .verify(&public, &msg, proof)
            .map_err(|_| VerifyError::InvalidProofSignature)?;

        Ok(public)
    }

    fn verify_presented(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());

        match self.verify(&chain, now) {
            Ok(public) => {
                trace!(peer = ?public, "peer certificate verified");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "peer certificate rejected");
                Err(e.into())
            }
        }
    }
}

impl<S: Suite> fmt::Debug for PeerVerifier<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerVerifier")
            .field("nonce", &self.nonce)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

impl<S: Suite> ServerCertVerifier for PeerVerifier<S> {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.verify_presented(end_entity, intermediates, now)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl<S: Suite> ClientCertVerifier for PeerVerifier<S> {
    /// Carries our nonce to the client in the CertificateRequest.
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.verify_presented(end_entity, intermediates, now)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Long-term public key named by an already verified peer certificate.
pub fn peer_public<S: Suite>(suite: &S, cert: &CertificateDer<'_>) -> Result<S::Point, VerifyError> {
    let (_, cert) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| VerifyError::InvalidCertificate(e.to_string()))?;
    let cn = common_name(common_name_attr(&cert)?)?;
    pub_from_cn(suite, cn).map_err(|e| VerifyError::InvalidCertificate(e.to_string()))
}

/// Recovers the [`VerifyError`] behind a failed handshake, if our verifier
/// was the one that aborted it.
pub fn verify_error_of(err: &io::Error) -> Option<VerifyError> {
    let tls = err.get_ref()?.downcast_ref::<rustls::Error>()?;
    match tls {
        rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(inner))) => {
            inner.downcast_ref::<VerifyError>().cloned()
        }
        _ => None,
    }
}

fn common_name_attr<'a>(
    cert: &'a X509Certificate<'_>,
) -> Result<&'a AttributeTypeAndValue<'a>, VerifyError> {
    cert.subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| VerifyError::InvalidCertificate("missing common name".into()))
}

fn common_name<'a>(attr: &AttributeTypeAndValue<'a>) -> Result<&'a str, VerifyError> {
    attr.as_str()
        .map_err(|e| VerifyError::InvalidCertificate(format!("common name is not a string: {e}")))
}
