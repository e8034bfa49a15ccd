//! # TLS Transport
//!
//! Connection setup for both roles, on top of plain TCP:
//!
//! - [`connect`] / [`connect_with`]: outbound. One verifier and one nonce per
//!   call, reused across the call's sequential dial attempts.
//! - [`listen`] → [`TlsListener`]: inbound. One long-lived [`ListenerConfig`]
//!   (and ephemeral keypair); every accepted socket gets its own handshake
//!   task and its own derived `rustls::ServerConfig` with a fresh nonce and
//!   verifier, so a stalled peer never holds up the others.
//! - [`Conn`]: an authenticated byte stream with the peer's long-term key.
//!
//! ## Wire Profile
//!
//! - TLS 1.2 only, ring provider, ALPN [`ALPN`]
//! - Client auth mandatory; chain validation replaced by [`PeerVerifier`]
//! - No session resumption on either side: a resumed session would skip the
//!   certificate proof

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::server::NoServerSessionStorage;
use rustls::{ClientConfig, ServerConfig, SupportedProtocolVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info, trace, warn};

use crate::cert::{CertIssuer, CRYPTO_PROVIDER};
use crate::config::DialConfig;
use crate::error::Error;
use crate::identity::{ConnType, ServerIdentity};
use crate::nonce::Nonce;
use crate::suite::Suite;
use crate::verify::{peer_public, verify_error_of, PeerVerifier, VerifyError};

/// ALPN protocol identifier offered and required by both sides.
pub const ALPN: &[u8] = b"peertls/1";

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];

/// Authenticated connections buffered ahead of [`TlsListener::accept`].
const ACCEPT_QUEUE: usize = 64;

/// Length prefix of a packet sent with [`Conn::send`].
const PACKET_HEADER_LEN: usize = 4;

// ============================================================================
// Outbound
// ============================================================================

/// Connects to `them` with default [`DialConfig`] settings.
pub async fn connect<S: Suite>(
    us: &Arc<ServerIdentity<S>>,
    them: &ServerIdentity<S>,
    suite: &Arc<S>,
) -> Result<Conn<S>, Error> {
    connect_with(us, them, suite, &DialConfig::default()).await
}

/// Connects to `them`, checking that it proves control of `them.public()`.
///
/// Fails immediately if `them` is not a `tls://` address or `us` has no
/// private key. Otherwise dials up to `config.max_retries` times, sleeping
/// `config.retry_delay` between attempts, and reports
/// [`Error::ConnectTimeout`] once all attempts have failed.
pub async fn connect_with<S: Suite>(
    us: &Arc<ServerIdentity<S>>,
    them: &ServerIdentity<S>,
    suite: &Arc<S>,
    config: &DialConfig,
) -> Result<Conn<S>, Error> {
    debug!(to = %them.address(), "dialing TLS peer");
    if them.address().conn_type() != ConnType::Tls {
        return Err(Error::NotTls {
            address: them.address().clone(),
        });
    }
    if us.private().is_none() {
        return Err(Error::MissingPrivateKey);
    }

    // One nonce per call: attempts are strictly sequential, so a retry can
    // reuse the challenge of the attempt it replaces.
    let verifier = Arc::new(PeerVerifier::for_client(Arc::clone(suite), them));
    let server_name = verifier.nonce().server_name()?;
    let connector = TlsConnector::from(Arc::new(client_config(suite, us, verifier)?));

    let addr = them.address().network_address();
    let attempts = config.attempts();
    let mut last_err = None;
    for attempt in 1..=attempts {
        match dial_once(&connector, server_name.clone(), addr, suite, config).await {
            Ok(conn) => {
                debug!(to = %them.address(), attempt, "TLS connection established");
                return Ok(conn);
            }
            Err(e) => {
                debug!(to = %them.address(), attempt, error = %e, "TLS dial attempt failed");
                last_err = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    let source = last_err.unwrap_or_else(|| Error::Io(io::ErrorKind::TimedOut.into()));
    warn!(to = %them.address(), attempts, error = %source, "giving up on TLS peer");
    Err(Error::ConnectTimeout {
        address: them.address().clone(),
        attempts,
        source: Box::new(source),
    })
}

fn client_config<S: Suite>(
    suite: &Arc<S>,
    us: &Arc<ServerIdentity<S>>,
    verifier: Arc<PeerVerifier<S>>,
) -> Result<ClientConfig, Error> {
    let issuer = CertIssuer::new(Arc::clone(suite), Arc::clone(us))?;

    let mut config = ClientConfig::builder_with_provider(Arc::clone(&*CRYPTO_PROVIDER))
        .with_protocol_versions(TLS12_ONLY)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_cert_resolver(Arc::new(issuer));
    config.alpn_protocols = vec![ALPN.to_vec()];
    config.resumption = Resumption::disabled();
    config.enable_sni = true;
    Ok(config)
}

async fn dial_once<S: Suite>(
    connector: &TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
    addr: &str,
    suite: &Arc<S>,
    config: &DialConfig,
) -> Result<Conn<S>, Error> {
    let tcp = tokio::time::timeout(config.dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| timed_out("tcp dial"))??;
    tcp.set_nodelay(true)?;

    let stream = tokio::time::timeout(config.handshake_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| Error::Handshake(timed_out("TLS handshake")))?
        .map_err(handshake_error)?;

    Conn::new(&**suite, stream.into(), config.max_packet_size)
}

// ============================================================================
// Inbound
// ============================================================================

/// Shared listener template. Per-connection configs are derived from it and
/// never written back.
pub struct ListenerConfig<S: Suite> {
    suite: Arc<S>,
    provider: Arc<CryptoProvider>,
    issuer: Arc<CertIssuer<S>>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl<S: Suite> ListenerConfig<S> {
    pub fn new(suite: Arc<S>, us: Arc<ServerIdentity<S>>) -> Result<Self, Error> {
        let issuer = CertIssuer::new(Arc::clone(&suite), us)?;
        Ok(Self {
            suite,
            provider: Arc::clone(&*CRYPTO_PROVIDER),
            issuer: Arc::new(issuer),
            alpn_protocols: vec![ALPN.to_vec()],
        })
    }

    pub fn subject(&self) -> &str {
        self.issuer.subject()
    }

    /// Config for one inbound handshake.
    ///
    /// The public template fields are copied into a freshly built
    /// `ServerConfig`; the per-connection verifier and nonce exist only in the
    /// returned value.
    pub fn for_connection(&self) -> Result<(Arc<ServerConfig>, Nonce), Error> {
        let verifier = Arc::new(PeerVerifier::for_server(Arc::clone(&self.suite)));
        let nonce = *verifier.nonce();

        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(TLS12_ONLY)?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(self.issuer.clone());
        config.alpn_protocols = self.alpn_protocols.clone();
        config.session_storage = Arc::new(NoServerSessionStorage {});
        config.send_tls13_tickets = 0;
        Ok((Arc::new(config), nonce))
    }
}

/// Binds `bind` and prepares to accept authenticated connections as `us`.
pub async fn listen<S: Suite>(
    us: &Arc<ServerIdentity<S>>,
    suite: &Arc<S>,
    bind: &str,
) -> Result<TlsListener<S>, Error> {
    listen_with(us, suite, bind, &DialConfig::default()).await
}

pub async fn listen_with<S: Suite>(
    us: &Arc<ServerIdentity<S>>,
    suite: &Arc<S>,
    bind: &str,
    config: &DialConfig,
) -> Result<TlsListener<S>, Error> {
    if us.private().is_none() {
        return Err(Error::MissingPrivateKey);
    }
    let template = Arc::new(ListenerConfig::new(Arc::clone(suite), Arc::clone(us))?);
    let tcp = TcpListener::bind(bind).await?;
    let local = tcp.local_addr()?;
    info!(
        addr = %local,
        subject = %template.subject(),
        suite = suite.name(),
        "TLS listener bound"
    );

    let (ready_tx, ready_rx) = mpsc::channel(ACCEPT_QUEUE);
    let acceptor = tokio::spawn(accept_loop(
        tcp,
        Arc::clone(&template),
        config.clone(),
        ready_tx,
    ));

    Ok(TlsListener {
        local,
        template,
        ready: Mutex::new(ready_rx),
        acceptor,
    })
}

/// A bound listener that authenticates every incoming connection.
///
/// A background task accepts sockets and runs each handshake on its own task;
/// only connections whose handshake succeeded reach [`TlsListener::accept`].
/// Dropping the listener stops that task and closes the socket.
pub struct TlsListener<S: Suite> {
    local: SocketAddr,
    template: Arc<ListenerConfig<S>>,
    ready: Mutex<mpsc::Receiver<Conn<S>>>,
    acceptor: JoinHandle<()>,
}

impl<S: Suite> TlsListener<S> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn template(&self) -> &ListenerConfig<S> {
        &self.template
    }

    /// Waits for the next connection whose handshake succeeded.
    pub async fn accept(&self) -> Result<Conn<S>, Error> {
        self.ready.lock().await.recv().await.ok_or_else(listener_stopped)
    }

    /// Hands every authenticated connection to `handler` on its own task
    /// until `shutdown` resolves.
    pub async fn serve<F, Fut>(self, handler: F, shutdown: impl Future<Output = ()>) -> Result<(), Error>
    where
        F: Fn(Conn<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut ready = self.ready.lock().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %self.local, "TLS listener shutting down");
                    return Ok(());
                }
                conn = ready.recv() => {
                    let conn = conn.ok_or_else(listener_stopped)?;
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move { (*handler)(conn).await });
                }
            }
        }
    }
}

impl<S: Suite> Drop for TlsListener<S> {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_loop<S: Suite>(
    tcp: TcpListener,
    template: Arc<ListenerConfig<S>>,
    config: DialConfig,
    ready: mpsc::Sender<Conn<S>>,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = ready.closed() => break,
            accepted = tcp.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let template = Arc::clone(&template);
        let config = config.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match handshake(&template, stream, &config).await {
                Ok(conn) => {
                    if ready.send(conn).await.is_err() {
                        trace!(%remote, "listener closed before connection was accepted");
                    }
                }
                Err(e) => debug!(%remote, error = %e, "rejected inbound TLS connection"),
            }
        });
    }
    debug!(addr = ?tcp.local_addr().ok(), "TLS accept loop stopped");
}

fn listener_stopped() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "TLS listener stopped"))
}

async fn handshake<S: Suite>(
    template: &ListenerConfig<S>,
    tcp: TcpStream,
    config: &DialConfig,
) -> Result<Conn<S>, Error> {
    tcp.set_nodelay(true)?;
    let (server_config, nonce) = template.for_connection()?;
    trace!(remote = ?tcp.peer_addr().ok(), ?nonce, "derived per-connection TLS config");

    let stream = tokio::time::timeout(
        config.handshake_timeout,
        TlsAcceptor::from(server_config).accept(tcp),
    )
    .await
    .map_err(|_| Error::Handshake(timed_out("TLS handshake")))?
    .map_err(handshake_error)?;

    Conn::new(&*template.suite, stream.into(), config.max_packet_size)
}

fn handshake_error(err: io::Error) -> Error {
    match verify_error_of(&err) {
        Some(e) => Error::Verify(e),
        None => Error::Handshake(err),
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}

// ============================================================================
// Connection
// ============================================================================

/// An authenticated TLS connection.
///
/// Implements `AsyncRead + AsyncWrite` for raw byte-stream use; [`Conn::send`]
/// and [`Conn::receive`] add length-prefixed packets on top.
pub struct Conn<S: Suite> {
    stream: TlsStream<TcpStream>,
    peer: S::Point,
    local: SocketAddr,
    remote: SocketAddr,
    tx: u64,
    rx: u64,
    max_packet_size: usize,
}

impl<S: Suite> Conn<S> {
    fn new(suite: &S, stream: TlsStream<TcpStream>, max_packet_size: usize) -> Result<Self, Error> {
        let (tcp, state) = stream.get_ref();
        let local = tcp.local_addr()?;
        let remote = tcp.peer_addr()?;
        let cert = state
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or(VerifyError::MalformedChain(0))?;
        let peer = peer_public(suite, cert)?;

        Ok(Self {
            stream,
            peer,
            local,
            remote,
            tx: 0,
            rx: 0,
            max_packet_size,
        })
    }

    /// Long-term public key the peer proved control of.
    pub fn peer_public(&self) -> &S::Point {
        &self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Bytes written to the TLS stream, excluding record overhead.
    pub fn tx(&self) -> u64 {
        self.tx
    }

    /// Bytes read from the TLS stream, excluding record overhead.
    pub fn rx(&self) -> u64 {
        self.rx
    }

    /// Sends one packet: a big-endian u32 length followed by `payload`.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > self.max_packet_size {
            return Err(Error::PacketTooLarge {
                size: payload.len(),
                max: self.max_packet_size,
            });
        }
        let len = u32::try_from(payload.len()).map_err(|_| Error::PacketTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut frame = Vec::with_capacity(PACKET_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);
        self.write_all(&frame).await?;
        self.flush().await?;
        Ok(())
    }

    /// Receives one packet sent with [`Conn::send`].
    pub async fn receive(&mut self) -> Result<Vec<u8>, Error> {
        let mut len_buf = [0u8; PACKET_HEADER_LEN];
        self.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_packet_size {
            return Err(Error::PacketTooLarge {
                size: len,
                max: self.max_packet_size,
            });
        }

        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Sends close_notify and shuts down the write half.
    pub async fn close(mut self) -> Result<(), Error> {
        self.shutdown().await?;
        Ok(())
    }
}

impl<S: Suite> std::fmt::Debug for Conn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .finish()
    }
}

impl<S: Suite> AsyncRead for Conn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.rx += (buf.filled().len() - before) as u64;
        }
        poll
    }
}

impl<S: Suite> AsyncWrite for Conn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.stream).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.tx += n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::Ed25519Suite;

    fn template() -> ListenerConfig<Ed25519Suite> {
        let suite = Arc::new(Ed25519Suite);
        let us = ServerIdentity::generate(&*suite, "tls://127.0.0.1:1".parse().unwrap());
        ListenerConfig::new(suite, Arc::new(us)).unwrap()
    }

    #[test]
    fn per_connection_configs_do_not_share_nonces() {
        let template = template();
        let issuer_before = Arc::as_ptr(&template.issuer);

        let (a, nonce_a) = template.for_connection().unwrap();
        let (b, nonce_b) = template.for_connection().unwrap();

        assert_ne!(nonce_a, nonce_b);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(Arc::as_ptr(&template.issuer), issuer_before);
        assert_eq!(a.alpn_protocols, vec![ALPN.to_vec()]);
        assert_eq!(b.alpn_protocols, template.alpn_protocols);
    }

    #[test]
    fn derived_config_is_tls12_only_without_resumption() {
        let (config, _) = template().for_connection().unwrap();
        assert_eq!(config.send_tls13_tickets, 0);
        assert!(!config.session_storage.can_cache());
    }

    #[test]
    fn listener_config_requires_private_key() {
        let suite = Arc::new(Ed25519Suite);
        let us = ServerIdentity::generate(&*suite, "tls://127.0.0.1:1".parse().unwrap());
        let Err(err) = ListenerConfig::new(suite, Arc::new(us.public_view())) else {
            panic!("listener config built without a private key");
        };
        assert!(matches!(err, Error::MissingPrivateKey));
        assert!(err.is_configuration());
    }
}
