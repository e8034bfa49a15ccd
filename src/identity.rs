//! # Node Identity
//!
//! - [`Address`]: `scheme://host:port` network address with a [`ConnType`]
//! - [`ServerIdentity`]: long-term public key, optional private key, address
//! - [`pub_to_cn`] / [`pub_from_cn`]: certificate subject encoding of a public key
//!
//! ## Subject Encoding
//!
//! Certificates name their owner in the CommonName. New certificates always use
//! the prefixed form `Z<hex(marshal(pub))>`; the prefix keeps point encodings of
//! different groups from colliding. Unprefixed hex is the legacy form and is
//! only ever decoded, never produced.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::suite::{Suite, SuiteError};

/// Leading byte of the current CommonName encoding.
pub const CN_PREFIX: char = 'Z';

// ============================================================================
// Addresses
// ============================================================================

/// Transport an address is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    /// Plain TCP, no transport security.
    Tcp,
    /// TCP wrapped in the mutually authenticated TLS handshake of this crate.
    Tls,
    /// In-process transport, used by local test harnesses.
    Local,
}

impl ConnType {
    pub fn scheme(self) -> &'static str {
        match self {
            ConnType::Tcp => "tcp",
            ConnType::Tls => "tls",
            ConnType::Local => "local",
        }
    }
}

impl FromStr for ConnType {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ConnType::Tcp),
            "tls" => Ok(ConnType::Tls),
            "local" => Ok(ConnType::Local),
            other => Err(AddressError::UnknownScheme(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address {0:?} has no scheme (expected scheme://host:port)")]
    MissingScheme(String),

    #[error("unknown address scheme {0:?}")]
    UnknownScheme(String),

    #[error("address {0:?} is missing a port")]
    MissingPort(String),

    #[error("address {0:?} has an invalid port")]
    InvalidPort(String),

    #[error("address has an empty host")]
    EmptyHost,
}

/// A network address tagged with the transport it expects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    conn_type: ConnType,
    network: String,
}

impl Address {
    /// Builds an address, validating `host:port` for network transports.
    pub fn new(conn_type: ConnType, network: impl Into<String>) -> Result<Self, AddressError> {
        let network = network.into();
        if network.is_empty() {
            return Err(AddressError::EmptyHost);
        }
        if conn_type != ConnType::Local {
            let (host, port) = network
                .rsplit_once(':')
                .ok_or_else(|| AddressError::MissingPort(network.clone()))?;
            if host.is_empty() {
                return Err(AddressError::EmptyHost);
            }
            port.parse::<u16>()
                .map_err(|_| AddressError::InvalidPort(network.clone()))?;
        }
        Ok(Self { conn_type, network })
    }

    /// `tls://` address for a bound socket.
    pub fn tls(addr: SocketAddr) -> Self {
        Self {
            conn_type: ConnType::Tls,
            network: addr.to_string(),
        }
    }

    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    /// The `host:port` part, suitable for dialing.
    pub fn network_address(&self) -> &str {
        &self.network
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| AddressError::MissingScheme(s.to_string()))?;
        Address::new(scheme.parse()?, rest)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.conn_type.scheme(), self.network)
    }
}

// ============================================================================
// Server Identity
// ============================================================================

/// Long-term identity of a node.
///
/// Remote peers are described without a private key; the local node needs one
/// for any role that issues certificates.
pub struct ServerIdentity<S: Suite> {
    public: S::Point,
    private: Option<S::Scalar>,
    address: Address,
}

impl<S: Suite> ServerIdentity<S> {
    /// Identity of a remote peer: public key and address only.
    pub fn new(public: S::Point, address: Address) -> Self {
        Self {
            public,
            private: None,
            address,
        }
    }

    /// Local identity whose public key is derived from `secret`.
    pub fn with_private(suite: &S, secret: S::Scalar, address: Address) -> Self {
        Self {
            public: suite.public_from_secret(&secret),
            private: Some(secret),
            address,
        }
    }

    /// Identity assembled from independent parts. The public key is not
    /// checked against the private key.
    pub fn from_parts(public: S::Point, private: Option<S::Scalar>, address: Address) -> Self {
        Self {
            public,
            private,
            address,
        }
    }

    /// Fresh local identity.
    pub fn generate(suite: &S, address: Address) -> Self {
        Self::with_private(suite, suite.generate_secret(), address)
    }

    pub fn public(&self) -> &S::Point {
        &self.public
    }

    pub fn private(&self) -> Option<&S::Scalar> {
        self.private.as_ref()
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The same identity as a remote peer would see it.
    pub fn public_view(&self) -> Self {
        Self::new(self.public.clone(), self.address.clone())
    }
}

impl<S: Suite> fmt::Debug for ServerIdentity<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("public", &self.public)
            .field("has_private", &self.private.is_some())
            .field("address", &self.address)
            .finish()
    }
}

// ============================================================================
// Subject Encoding
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubjectError {
    #[error("common name is empty")]
    Empty,

    #[error("common name is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("common name does not encode a public key: {0}")]
    Point(#[from] SuiteError),
}

/// CommonName for `public`, always in the prefixed form.
pub fn pub_to_cn<S: Suite>(suite: &S, public: &S::Point) -> String {
    format!("{CN_PREFIX}{}", hex::encode(suite.marshal_point(public)))
}

/// Decodes a CommonName in either the prefixed or the legacy unprefixed form.
pub fn pub_from_cn<S: Suite>(suite: &S, cn: &str) -> Result<S::Point, SubjectError> {
    let hex_part = match cn.strip_prefix(CN_PREFIX) {
        Some(rest) => rest,
        None if cn.is_empty() => return Err(SubjectError::Empty),
        None => cn,
    };
    let bytes = hex::decode(hex_part)?;
    Ok(suite.unmarshal_point(&bytes)?)
}
