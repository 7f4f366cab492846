use axum::Extension;
use axum::routing::get;
use spiffe_demo_identity::IdentitySource;
use spiffe_demo_tls::http::PeerIdentity;
use spiffe_demo_tls::{MtlsArgs, MtlsListener, MtlsStream, server_config};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::httpservice::{greeting, now};
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
}

const REPLY: &[u8] = b"Hello client\n";

/// Read one line from an authorized client and answer it.
pub(crate) async fn talk(stream: MtlsStream) {
    let peer = stream.peer_identity().clone();
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    match stream.read_line(&mut line).await {
        Ok(0) => {
            log::info!("{} hung up without saying anything", peer);
            return;
        }
        Ok(_) => log::info!("Client says: {:?}", line),
        Err(e) => {
            log::error!("Error reading from {}: {}", peer, e);
            return;
        }
    }
    let mut stream = stream.into_inner();
    if let Err(e) = stream.write_all(REPLY).await {
        log::error!("Error replying to {}: {}", peer, e);
        return;
    }
    let _ = stream.shutdown().await;
}

async fn source(args: &Args) -> Result<Arc<IdentitySource>, Box<dyn Error>> {
    let source = IdentitySource::from_args(&args.identity).await?;
    Ok(Arc::new(source))
}

/// The line-oriented mTLS backend.
pub async fn run_stream(args: Args) -> Result<(), Box<dyn Error>> {
    let source = source(&args).await?;
    let config = server_config(Arc::clone(&source), Arc::new(args.mtls.authorized_spiffe))?;
    let listener =
        MtlsListener::bind(args.server_address, Arc::new(config), args.mtls.handshake_timeout)
            .await?;
    let r = tokio::select! {
        r = listener.serve(talk) => r,
        r = termination() => r,
    };
    source.close();
    r?;
    Ok(())
}

pub(crate) fn router() -> axum::Router {
    axum::Router::new().route(
        "/",
        get(|Extension(PeerIdentity(peer)): Extension<PeerIdentity>| async move {
            log::info!("Request from {}", peer);
            greeting("backend service", now())
        }),
    )
}

/// The HTTPS mTLS backend.
pub async fn run_http(args: Args) -> Result<(), Box<dyn Error>> {
    let source = source(&args).await?;
    let config = server_config(Arc::clone(&source), Arc::new(args.mtls.authorized_spiffe))?;
    let handle = axum_server::Handle::new();
    let serve = spiffe_demo_tls::http::serve(
        args.server_address,
        config,
        args.mtls.handshake_timeout,
        router(),
        handle.clone(),
    );
    let r = run_until(serve, handle, termination()).await;
    source.close();
    r?;
    Ok(())
}
