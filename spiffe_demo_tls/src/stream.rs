//! mTLS over plain TCP.
//!
//! [`MtlsListener`] accepts connections and runs each one on its own task;
//! a connection that fails the handshake or authorization is logged and
//! dropped without disturbing the listener. [`dial`] is the client side.
//! Either way the caller only ever gets an [`MtlsStream`] whose peer has
//! been authorized.
//!
//! ```no_run
//! # async fn f(source: std::sync::Arc<spiffe_demo_identity::IdentitySource>) -> Result<(), Box<dyn std::error::Error>> {
//! use spiffe_demo_tls::{Authorizer, server_config, stream::MtlsListener};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
//!
//! let rule: Authorizer = "spiffe://example.org/client".parse()?;
//! let config = server_config(source, Arc::new(rule))?;
//! let listener =
//!     MtlsListener::bind("127.0.0.1:8080", Arc::new(config), Duration::from_secs(10)).await?;
//! listener
//!     .serve(|stream| async move {
//!         let mut stream = BufReader::new(stream);
//!         let mut line = String::new();
//!         if stream.read_line(&mut line).await.is_ok() {
//!             let _ = stream.write_all(b"Hello client\n").await;
//!         }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use spiffe_demo_identity::SpiffeId;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::channel::{ChannelError, ChannelState};
use crate::peer::peer_identity;

// Sent to satisfy the TLS API. With SNI off it never leaves the process
// and the server certificate is checked by SPIFFE ID only.
const PLACEHOLDER_SERVER_NAME: &str = "spiffe";

/// An authorized mTLS connection.
pub struct MtlsStream<IO = TcpStream> {
    inner: TlsStream<IO>,
    peer: SpiffeId,
    state: ChannelState,
}

impl<IO> MtlsStream<IO> {
    /// Who we are talking to.
    pub fn peer_identity(&self) -> &SpiffeId {
        &self.peer
    }

    /// [`ChannelState::Authorized`] until either side closes.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The chain the peer presented during the handshake.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.inner.get_ref().1.peer_certificates()
    }

    /// The underlying transport.
    pub fn get_ref(&self) -> &IO {
        self.inner.get_ref().0
    }

    fn mark_closed(&mut self) {
        if self.state == ChannelState::Authorized {
            let _ = self.state.advance(ChannelState::Closed);
        }
    }
}

impl<IO> std::fmt::Debug for MtlsStream<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "MtlsStream {{ peer: {}, state: {:?} }}", self.peer, self.state)
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncRead for MtlsStream<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let r = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &r {
            if buf.filled().len() == before && buf.remaining() > 0 {
                this.mark_closed();
            }
        }
        r
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MtlsStream<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let r = Pin::new(&mut this.inner).poll_shutdown(cx);
        if r.is_ready() {
            this.mark_closed();
        }
        r
    }
}

async fn handshake<IO, S, F>(io_handshake: F, timeout: Duration) -> Result<MtlsStream<IO>, ChannelError>
where
    F: Future<Output = io::Result<S>>,
    S: Into<TlsStream<IO>>,
{
    let mut state = ChannelState::Idle;
    state.advance(ChannelState::TransportConnected)?;
    state.advance(ChannelState::Handshaking)?;
    let outcome = match tokio::time::timeout(timeout, io_handshake).await {
        Err(_) => Err(ChannelError::Timeout(timeout.into())),
        Ok(Err(e)) => Err(ChannelError::from_tls_io(e)),
        Ok(Ok(tls)) => {
            let inner: TlsStream<IO> = tls.into();
            match peer_identity(inner.get_ref().1) {
                Ok(peer) => Ok((inner, peer)),
                Err(e) => {
                    log::warn!("Handshake finished without a usable peer identity: {}", e);
                    Err(ChannelError::AuthorizationDenied)
                }
            }
        }
    };
    match outcome {
        Ok((inner, peer)) => {
            state.advance(ChannelState::Authorized)?;
            Ok(MtlsStream { inner, peer, state })
        }
        Err(e) => {
            state.advance(ChannelState::Denied)?;
            Err(e)
        }
    }
}

/// Run the server side of the handshake on an established transport.
pub async fn accept<IO>(
    acceptor: &TlsAcceptor,
    io: IO,
    timeout: Duration,
) -> Result<MtlsStream<IO>, ChannelError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    handshake(acceptor.accept(io), timeout).await
}

/// Run the client side of the handshake on an established transport.
pub async fn connect<IO>(
    connector: &TlsConnector,
    io: IO,
    timeout: Duration,
) -> Result<MtlsStream<IO>, ChannelError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(PLACEHOLDER_SERVER_NAME)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    handshake(connector.connect(name, io), timeout).await
}

/// Connect to `addr` and complete an mTLS handshake. `timeout` bounds the
/// TCP connect and the handshake separately.
pub async fn dial(
    addr: impl ToSocketAddrs,
    config: Arc<ClientConfig>,
    timeout: Duration,
) -> Result<MtlsStream, ChannelError> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ChannelError::Timeout(timeout.into()))??;
    connect(&TlsConnector::from(config), tcp, timeout).await
}

/// A TCP listener that hands out authorized [`MtlsStream`]s.
pub struct MtlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl MtlsListener {
    /// Listen on `addr`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: Arc<ServerConfig>,
        handshake_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("mTLS server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(config),
            handshake_timeout,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one connection and run its handshake inline. Most callers
    /// want [`MtlsListener::serve`] instead.
    pub async fn accept(&self) -> Result<(MtlsStream, SocketAddr), ChannelError> {
        let (tcp, addr) = self.listener.accept().await?;
        let stream = accept(&self.acceptor, tcp, self.handshake_timeout).await?;
        Ok((stream, addr))
    }

    /// Accept connections until the listener itself fails. Each one is
    /// handshaken on its own task and, if authorized, passed to `handler`.
    pub async fn serve<H, Fut>(self, handler: H) -> io::Result<()>
    where
        H: Fn(MtlsStream) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let (tcp, addr) = self.listener.accept().await?;
            let acceptor = self.acceptor.clone();
            let handler = handler.clone();
            let timeout = self.handshake_timeout;
            tokio::spawn(async move {
                match accept(&acceptor, tcp, timeout).await {
                    Ok(stream) => {
                        log::info!("Accepted {} from {}", stream.peer_identity(), addr);
                        handler(stream).await;
                    }
                    Err(e) => log::warn!("Dropping connection from {}: {}", addr, e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::Either;
    use rustls::pki_types::pem::PemObject;
    use spiffe_demo_identity::{IdentitySource, MemoryProvider, X509Context, testdata};
    use std::pin::pin;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use crate::config::{client_config, server_config};
    use crate::policy::Authorizer;

    const HANDSHAKE: Duration = Duration::from_secs(10);

    async fn source(context: X509Context) -> Arc<IdentitySource> {
        Arc::new(
            IdentitySource::connect(MemoryProvider::with_context(context), Duration::from_secs(3))
                .await
                .unwrap(),
        )
    }

    fn rule(s: &str) -> Arc<Authorizer> {
        Arc::new(s.parse().unwrap())
    }

    async fn acceptor(allow: &str) -> TlsAcceptor {
        let source = source(testdata::server_context()).await;
        TlsAcceptor::from(Arc::new(server_config(source, rule(allow)).unwrap()))
    }

    async fn connector(context: X509Context, allow: &str) -> TlsConnector {
        let source = source(context).await;
        TlsConnector::from(Arc::new(client_config(source, rule(allow)).unwrap()))
    }

    fn cert(pem: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from_pem_slice(pem).unwrap()
    }

    async fn talk(
        client: impl Future<Output = Result<MtlsStream<DuplexStream>, ChannelError>>,
        server: impl Future<Output = Result<MtlsStream<DuplexStream>, ChannelError>>,
    ) {
        let client_task = pin!(async move {
            let mut stream = client.await.expect("client connected");
            assert_eq!(stream.state(), ChannelState::Authorized);
            assert_eq!(stream.peer_identity().to_string(), "spiffe://example.org/server");
            stream.write_all(b"hello").await.expect("write hello to server");
            let mut buf = vec![0u8; 3];
            stream.read_exact(&mut buf).await.expect("read bye from server");
            assert_eq!(buf, b"bye");
        });
        let server_task = pin!(async move {
            let mut stream = server.await.expect("server accepted");
            assert_eq!(stream.state(), ChannelState::Authorized);
            assert_eq!(stream.peer_identity().to_string(), "spiffe://example.org/client");
            let mut buf = vec![0u8; 5];
            stream.read_exact(&mut buf).await.expect("read hello from client");
            assert_eq!(buf, b"hello");
            stream.write_all(b"bye").await.expect("write bye to client");
            stream.shutdown().await.expect("shutdown");
            assert_eq!(stream.state(), ChannelState::Closed);
        });
        match futures::future::select(client_task, server_task).await {
            Either::Left((_, server_task)) => server_task.await,
            Either::Right((_, client_task)) => client_task.await,
        }
    }

    #[tokio::test]
    async fn authorized_both_ways() {
        let acceptor = acceptor("spiffe://example.org/client").await;
        let connector = connector(testdata::client_context(), "spiffe://example.org/server").await;
        let (c, s) = tokio::io::duplex(4096);
        talk(
            connect(&connector, c, HANDSHAKE),
            accept(&acceptor, s, HANDSHAKE),
        )
        .await;
    }

    #[tokio::test]
    async fn server_denies_client() {
        let acceptor = acceptor("spiffe://example.org/other").await;
        let connector = connector(testdata::client_context(), "spiffe://example.org/server").await;
        let (c, s) = tokio::io::duplex(4096);
        let client = async move {
            // TLS 1.3 clients finish before the server has looked at their
            // certificate; the refusal arrives on the first read.
            if let Ok(mut stream) = connect(&connector, c, HANDSHAKE).await {
                let _ = stream.write_all(b"Hello server\n").await;
                let mut buf = Vec::new();
                match stream.read_to_end(&mut buf).await {
                    Ok(n) => assert_eq!(n, 0),
                    Err(e) => assert!(matches!(
                        ChannelError::from_tls_io(e),
                        ChannelError::Handshake(_) | ChannelError::Io(_)
                    )),
                }
            }
        };
        let (_, server) = tokio::join!(client, accept(&acceptor, s, HANDSHAKE));
        assert!(matches!(server, Err(ChannelError::AuthorizationDenied)));
    }

    #[tokio::test]
    async fn client_denies_server() {
        let acceptor = acceptor("spiffe://example.org/client").await;
        let connector = connector(testdata::client_context(), "spiffe://example.org/other").await;
        let (c, s) = tokio::io::duplex(4096);
        let (client, server) = tokio::join!(
            connect(&connector, c, HANDSHAKE),
            accept(&acceptor, s, HANDSHAKE)
        );
        assert!(matches!(client, Err(ChannelError::AuthorizationDenied)));
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn untrusted_client() {
        let acceptor = acceptor("*").await;
        let foreign = testdata::context(
            testdata::FOREIGN_CERT,
            testdata::FOREIGN_KEY,
            &[
                ("other.org", testdata::OTHER_ORG_BUNDLE),
                ("example.org", testdata::EXAMPLE_ORG_BUNDLE),
            ],
        );
        let connector = connector(foreign, "*").await;
        let (c, s) = tokio::io::duplex(4096);
        let client = async move {
            if let Ok(mut stream) = connect(&connector, c, HANDSHAKE).await {
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf).await;
                assert!(buf.is_empty());
            }
        };
        let (_, server) = tokio::join!(client, accept(&acceptor, s, HANDSHAKE));
        assert!(matches!(
            server,
            Err(ChannelError::Handshake(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer
            )))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let acceptor = acceptor("*").await;
        let (_c, s) = tokio::io::duplex(4096);
        let started = tokio::time::Instant::now();
        let r = accept(&acceptor, s, HANDSHAKE).await;
        assert!(matches!(r, Err(ChannelError::Timeout(_))));
        assert!(started.elapsed() >= HANDSHAKE);
    }

    async fn exchange(stream: &mut MtlsStream) -> String {
        stream.write_all(b"Hello server\n").await.unwrap();
        let mut line = String::new();
        let mut reader = BufReader::new(stream);
        reader.read_line(&mut line).await.unwrap();
        line
    }

    async fn echo_server(listener: MtlsListener) {
        let _ = listener
            .serve(|stream| async move {
                let mut stream = BufReader::new(stream);
                loop {
                    let mut line = String::new();
                    match stream.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if stream.write_all(b"Hello client\n").await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .await;
    }

    #[tokio::test]
    async fn listener_survives_denied_connections() {
        let server_source = source(testdata::server_context()).await;
        let config = server_config(server_source, rule("spiffe://example.org/client")).unwrap();
        let listener = MtlsListener::bind("127.0.0.1:0", Arc::new(config), HANDSHAKE)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(echo_server(listener));

        let other = source(testdata::context(
            testdata::OTHER_CERT,
            testdata::OTHER_KEY,
            &[("example.org", testdata::EXAMPLE_ORG_BUNDLE)],
        ))
        .await;
        let other_config = Arc::new(client_config(other, rule("*")).unwrap());
        if let Ok(mut stream) = dial(addr, other_config, HANDSHAKE).await {
            let _ = stream.write_all(b"Hello server\n").await;
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
            assert!(buf.is_empty());
        }

        let client = source(testdata::client_context()).await;
        let config = Arc::new(client_config(client, rule("spiffe://example.org/server")).unwrap());
        let mut stream = dial(addr, config, HANDSHAKE).await.unwrap();
        assert_eq!(exchange(&mut stream).await, "Hello client\n");
        server.abort();
    }

    #[tokio::test]
    async fn rotation_leaves_established_connections_alone() {
        let provider = MemoryProvider::with_context(testdata::server_context());
        let server_source = Arc::new(
            IdentitySource::connect(provider.clone(), Duration::from_secs(3))
                .await
                .unwrap(),
        );
        let config = server_config(Arc::clone(&server_source), rule("*")).unwrap();
        let listener = MtlsListener::bind("127.0.0.1:0", Arc::new(config), HANDSHAKE)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(echo_server(listener));

        let client = source(testdata::client_context()).await;
        let config = Arc::new(client_config(client, rule("spiffe://example.org/server")).unwrap());
        let mut before = dial(addr, Arc::clone(&config), HANDSHAKE).await.unwrap();
        assert_eq!(exchange(&mut before).await, "Hello client\n");

        let old = server_source.current_svid().unwrap();
        provider.push(testdata::context(
            testdata::SERVER_ROTATED_CERT,
            testdata::SERVER_ROTATED_KEY,
            &[("example.org", testdata::EXAMPLE_ORG_BUNDLE)],
        ));
        for _ in 0..100 {
            if !Arc::ptr_eq(&server_source.current_svid().unwrap(), &old) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(exchange(&mut before).await, "Hello client\n");
        assert_eq!(before.state(), ChannelState::Authorized);
        assert_eq!(
            before.peer_certificates().unwrap()[0],
            cert(testdata::SERVER_CERT)
        );

        let mut after = dial(addr, config, HANDSHAKE).await.unwrap();
        assert_eq!(exchange(&mut after).await, "Hello client\n");
        assert_eq!(
            after.peer_certificates().unwrap()[0],
            cert(testdata::SERVER_ROTATED_CERT)
        );
        server.abort();
    }
}
