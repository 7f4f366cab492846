use axum::extract::State;
use axum::routing::get;
use http::StatusCode;
use rustls::ClientConfig;
use spiffe_demo_identity::{CertificateDetails, IdentitySource};
use spiffe_demo_tls::http::{client, get_with_peer};
use spiffe_demo_tls::{Authorizer, MtlsArgs, client_config, dial};
use std::error::Error;
use std::fmt::{Display, Write as _};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::server::{run_until, termination};

#[derive(clap::Args, Debug)]
pub struct Args {
    #[command(flatten)]
    identity: spiffe_demo_identity::source::Args,

    #[command(flatten)]
    mtls: MtlsArgs,

    #[arg(
        short = 'l',
        long,
        default_value = "127.0.0.1:8080",
        help = "Address to listen on."
    )]
    server_address: SocketAddr,

    #[arg(
        short = 'b',
        long,
        default_value = "localhost:8080",
        help = "Location on where to reach the mTLS stream backend (host:port)."
    )]
    backend_service: String,

    #[arg(
        long,
        default_value = "https://localhost:8443/",
        help = "URL of the mTLS HTTP backend."
    )]
    mtls_backend_url: String,

    #[arg(long, help = "URL of the second mTLS HTTP backend.")]
    http_backend_service: Option<String>,

    #[arg(
        long,
        requires = "http_backend_service",
        help = "The SPIFFE ID that the second HTTP backend must present. Defaults to --authorized-spiffe."
    )]
    authorized_spiffe_http_backend: Option<Authorizer>,

    #[arg(
        long,
        default_value = "3s",
        value_parser = humantime::parse_duration,
        help = "Deadline for each call to a backend."
    )]
    call_timeout: Duration,
}

struct HttpBackend {
    client: reqwest::Client,
    url: String,
}

pub(crate) struct Customer {
    source: Arc<IdentitySource>,
    backend_service: String,
    backend_config: Arc<ClientConfig>,
    mtls: HttpBackend,
    http_backend: Option<HttpBackend>,
    handshake_timeout: Duration,
    call_timeout: Duration,
}

impl Customer {
    fn new(source: Arc<IdentitySource>, args: Args) -> Result<Self, Box<dyn Error>> {
        let authorizer = Arc::new(args.mtls.authorized_spiffe);
        let config = client_config(Arc::clone(&source), Arc::clone(&authorizer))?;
        let mtls = HttpBackend {
            client: client(config.clone(), args.call_timeout)?,
            url: args.mtls_backend_url,
        };
        let http_backend = match args.http_backend_service {
            Some(url) => {
                let authorizer = match args.authorized_spiffe_http_backend {
                    Some(a) => Arc::new(a),
                    None => Arc::clone(&authorizer),
                };
                let config = client_config(Arc::clone(&source), authorizer)?;
                Some(HttpBackend {
                    client: client(config, args.call_timeout)?,
                    url,
                })
            }
            None => None,
        };
        Ok(Self {
            source,
            backend_service: args.backend_service,
            backend_config: Arc::new(config),
            mtls,
            http_backend,
            handshake_timeout: args.mtls.handshake_timeout,
            call_timeout: args.call_timeout,
        })
    }
}

// The customer sees a bare 500; the reason only goes to our log.
fn internal(what: &str, e: impl Display) -> StatusCode {
    log::error!("{}: {}", what, e);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn relay(State(c): State<Arc<Customer>>) -> Result<String, StatusCode> {
    log::info!("Handling a request for the stream backend");
    let stream = dial(
        c.backend_service.as_str(),
        Arc::clone(&c.backend_config),
        c.handshake_timeout,
    )
    .await
    .map_err(|e| internal("Unable to create TLS connection", e))?;
    log::info!("Connected to {}", stream.peer_identity());
    let mut stream = BufReader::new(stream);
    let exchange = async {
        stream.get_mut().write_all(b"Hello server\n").await?;
        let mut line = String::new();
        stream.read_line(&mut line).await?;
        Ok::<_, std::io::Error>(line)
    };
    let line = tokio::time::timeout(c.call_timeout, exchange)
        .await
        .map_err(|e| internal("Backend did not answer", e))?
        .map_err(|e| internal("Unable to read server response", e))?;
    Ok(format!("Server says: {:?}\n", line))
}

async fn call(backend: &HttpBackend) -> Result<String, StatusCode> {
    let (peer, body) = get_with_peer(&backend.client, &backend.url)
        .await
        .map_err(|e| internal(&format!("Error calling {:?}", backend.url), e))?;
    Ok(format!(
        "Got a response from: {}\nServer says: {:?}\n",
        peer, body
    ))
}

async fn mtls(State(c): State<Arc<Customer>>) -> Result<String, StatusCode> {
    log::info!("Handling a request for the mTLS HTTP backend");
    call(&c.mtls).await
}

async fn http_backend(State(c): State<Arc<Customer>>) -> Result<String, StatusCode> {
    log::info!("Handling a request for the second HTTP backend");
    match &c.http_backend {
        Some(backend) => call(backend).await,
        None => Err(internal(
            "No second HTTP backend",
            "--http-backend-service is not set",
        )),
    }
}

async fn spiffe_retriever(State(c): State<Arc<Customer>>) -> Result<String, StatusCode> {
    log::info!("Handling a request in the SPIFFE retriever");
    let svid = c
        .source
        .current_svid()
        .map_err(|e| internal("Unable to fetch X.509 SVID", e))?;
    let mut page = String::new();
    for (i, cert) in svid.cert_chain().iter().enumerate() {
        let details = CertificateDetails::from_der(cert)
            .map_err(|e| internal("Unable to parse certificate", e))?;
        let _ = writeln!(page, "Certificate {}\n{}", i, details);
    }
    Ok(page)
}

pub(crate) fn router(customer: Arc<Customer>) -> axum::Router {
    axum::Router::new()
        .route("/", get(relay))
        .route("/mtls", get(mtls))
        .route("/httpbackend", get(http_backend))
        .route("/spifferetriever", get(spiffe_retriever))
        .with_state(customer)
}

/// The plain HTTP front end.
pub async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let source = Arc::new(IdentitySource::from_args(&args.identity).await?);
    let addr = args.server_address;
    let customer = Arc::new(Customer::new(Arc::clone(&source), args)?);
    log::info!("Starting server at {}", addr);
    let handle = axum_server::Handle::new();
    let serve = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(router(customer).into_make_service());
    let r = run_until(serve, handle, termination()).await;
    source.close();
    r?;
    Ok(())
}
