//! mTLS for HTTP: an [`axum`] server that knows who each request came
//! from, and a [`reqwest`] client.
//!
//! On the server side every connection is handshaken by [`MtlsAcceptor`].
//! Handlers can extract the authorized peer with
//! `axum::Extension<PeerIdentity>`. A peer that fails verification or
//! authorization never gets as far as HTTP.
//!
//! ```no_run
//! # async fn f(source: std::sync::Arc<spiffe_demo_identity::IdentitySource>) -> Result<(), Box<dyn std::error::Error>> {
//! use axum::Extension;
//! use axum::routing::get;
//! use spiffe_demo_tls::http::{PeerIdentity, serve};
//! use spiffe_demo_tls::{Authorizer, server_config};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let rule: Authorizer = "spiffe://example.org/client".parse()?;
//! let config = server_config(source, Arc::new(rule))?;
//! let router = axum::Router::new().route(
//!     "/",
//!     get(|Extension(PeerIdentity(peer)): Extension<PeerIdentity>| async move {
//!         format!("hello {}", peer)
//!     }),
//! );
//! serve(
//!     "127.0.0.1:8443".parse()?,
//!     config,
//!     Duration::from_secs(10),
//!     router,
//!     axum_server::Handle::new(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use axum_server::accept::Accept;
use futures::FutureExt;
use futures::future::BoxFuture;
use rustls::{ClientConfig, ServerConfig};
use spiffe_demo_identity::SpiffeId;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::peer::{PeerIdentityError, peer_identity_from_der};
use crate::stream::{MtlsStream, accept};

/// The authorized SPIFFE ID of the client, inserted into the extensions of
/// every request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerIdentity(pub SpiffeId);

/// Service wrapper that attaches a [`PeerIdentity`] to each request.
#[derive(Clone, Debug)]
pub struct AddPeerIdentity<S> {
    inner: S,
    peer: PeerIdentity,
}

impl<S, B> tower_service::Service<http::Request<B>> for AddPeerIdentity<S>
where
    S: tower_service::Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        req.extensions_mut().insert(self.peer.clone());
        self.inner.call(req)
    }
}

/// [`axum_server`] acceptor performing the mTLS handshake.
#[derive(Clone)]
pub struct MtlsAcceptor {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl MtlsAcceptor {
    /// Handshake with `config`, giving up after `handshake_timeout`.
    pub fn new(config: Arc<ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            handshake_timeout,
        }
    }
}

impl<S: Send + 'static> Accept<TcpStream, S> for MtlsAcceptor {
    type Stream = MtlsStream<TcpStream>;
    type Service = AddPeerIdentity<S>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: TcpStream, service: S) -> Self::Future {
        let acceptor = self.acceptor.clone();
        let timeout = self.handshake_timeout;
        async move {
            let remote = stream.peer_addr().ok();
            match accept(&acceptor, stream, timeout).await {
                Ok(tls) => {
                    log::debug!("HTTPS connection from {} ({:?})", tls.peer_identity(), remote);
                    let peer = PeerIdentity(tls.peer_identity().clone());
                    Ok((
                        tls,
                        AddPeerIdentity {
                            inner: service,
                            peer,
                        },
                    ))
                }
                Err(e) => {
                    log::warn!("Dropping HTTPS connection from {:?}: {}", remote, e);
                    Err(io::Error::other(e))
                }
            }
        }
        .boxed()
    }
}

/// Serve `router` over mTLS on `addr` until `handle` is told to shut down.
pub async fn serve(
    addr: SocketAddr,
    config: ServerConfig,
    handshake_timeout: Duration,
    router: axum::Router,
    handle: axum_server::Handle,
) -> io::Result<()> {
    let mut sc = config;
    sc.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    log::info!("Secure HTTP server listening on {}", addr);
    axum_server::bind(addr)
        .acceptor(MtlsAcceptor::new(Arc::new(sc), handshake_timeout))
        .handle(handle)
        .serve(router.into_make_service())
        .await
}

/// A [`reqwest::Client`] making mTLS calls with `config`. `timeout` covers
/// each whole request.
pub fn client(config: ClientConfig, timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    let mut cc = config;
    cc.alpn_protocols = vec![b"http/1.1".to_vec()];
    reqwest::Client::builder()
        .use_preconfigured_tls(cc)
        .tls_info(true)
        .timeout(timeout)
        .build()
}

/// The server's SPIFFE ID, from a response obtained with [`client`].
pub fn response_peer_identity(resp: &reqwest::Response) -> Result<SpiffeId, PeerIdentityError> {
    let der = resp
        .extensions()
        .get::<reqwest::tls::TlsInfo>()
        .and_then(|info| info.peer_certificate())
        .ok_or(PeerIdentityError::NoPeerCertificate)?;
    peer_identity_from_der(der)
}

/// Error returned by [`get_with_peer`].
#[derive(Debug, Error)]
pub enum CallError {
    /// The request failed, including at the TLS level.
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    /// The server's identity could not be read back.
    #[error("{0}")]
    PeerIdentity(#[from] PeerIdentityError),
}

/// GET `url` and return the server's SPIFFE ID along with the body.
pub async fn get_with_peer(
    client: &reqwest::Client,
    url: &str,
) -> Result<(SpiffeId, String), CallError> {
    let resp = client.get(url).send().await?;
    let peer = response_peer_identity(&resp)?;
    let body = resp.text().await?;
    Ok((peer, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Extension;
    use axum::routing::get;
    use spiffe_demo_identity::{IdentitySource, MemoryProvider, X509Context, testdata};

    use crate::config::{client_config, server_config};
    use crate::policy::Authorizer;
    use crate::testutil::{localhost, pick_unused_port, wait_until_serving};

    const TIMEOUT: Duration = Duration::from_secs(3);

    async fn source(context: X509Context) -> Arc<IdentitySource> {
        Arc::new(
            IdentitySource::connect(MemoryProvider::with_context(context), TIMEOUT)
                .await
                .unwrap(),
        )
    }

    fn rule(s: &str) -> Arc<Authorizer> {
        Arc::new(s.parse().unwrap())
    }

    async fn start(allow: &str) -> (SocketAddr, axum_server::Handle) {
        let source = source(testdata::server_context()).await;
        let config = server_config(source, rule(allow)).unwrap();
        let router = axum::Router::new().route(
            "/",
            get(|Extension(PeerIdentity(peer)): Extension<PeerIdentity>| async move {
                format!("Hello {}", peer)
            }),
        );
        let addr = localhost(pick_unused_port());
        let handle = axum_server::Handle::new();
        let h = handle.clone();
        tokio::spawn(async move { serve(addr, config, TIMEOUT, router, h).await });
        wait_until_serving(&addr).await;
        (addr, handle)
    }

    async fn http_client(context: X509Context, allow: &str) -> reqwest::Client {
        let source = source(context).await;
        client(client_config(source, rule(allow)).unwrap(), TIMEOUT).unwrap()
    }

    fn other_context() -> X509Context {
        testdata::context(
            testdata::OTHER_CERT,
            testdata::OTHER_KEY,
            &[("example.org", testdata::EXAMPLE_ORG_BUNDLE)],
        )
    }

    #[tokio::test]
    async fn authorized_client() {
        let (addr, handle) = start("spiffe://example.org/client").await;
        let client = http_client(testdata::client_context(), "spiffe://example.org/server").await;
        let url = format!("https://{}/", addr);
        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(
            response_peer_identity(&resp).unwrap().to_string(),
            "spiffe://example.org/server"
        );
        assert_eq!(resp.text().await.unwrap(), "Hello spiffe://example.org/client");

        let (peer, body) = get_with_peer(&client, &url).await.unwrap();
        assert_eq!(peer.to_string(), "spiffe://example.org/server");
        assert_eq!(body, "Hello spiffe://example.org/client");
        handle.shutdown();
    }

    #[tokio::test]
    async fn unauthorized_client_gets_no_response() {
        let (addr, handle) = start("spiffe://example.org/client").await;
        let client = http_client(other_context(), "spiffe://example.org/server").await;
        let r = client.get(format!("https://{}/", addr)).send().await;
        assert!(r.is_err(), "{:?}", r);

        // The server is still there for the right client.
        let client = http_client(testdata::client_context(), "*").await;
        let r = client.get(format!("https://{}/", addr)).send().await.unwrap();
        assert_eq!(r.status(), http::StatusCode::OK);
        handle.shutdown();
    }

    #[tokio::test]
    async fn client_refuses_unexpected_server() {
        let (addr, handle) = start("*").await;
        let client = http_client(testdata::client_context(), "spiffe://example.org/other").await;
        let r = get_with_peer(&client, &format!("https://{}/", addr)).await;
        assert!(matches!(r, Err(CallError::Request(_))));
        handle.shutdown();
    }
}
