//! Demo workloads that talk to each other over SPIFFE mutual TLS.
//!
//! Run one subcommand per workload:
//!
//! | Subcommand | What it is |
//! |------------|------------|
//! | `backend` | mTLS TCP server answering `Hello client` |
//! | `backend-http` | mTLS HTTPS server |
//! | `httpservice` | plain HTTP server, meant to sit behind a SPIFFE-aware proxy |
//! | `customer` | plain HTTP front end calling the backends |
//! | `watch` | logs every SVID and trust bundle rotation |
//!
//! All workloads except `httpservice` read their identity from the SVID
//! directory kept up to date by the local SPIFFE agent (`--svid-dir`).

use clap::{Parser, Subcommand};

mod backend;
mod customer;
mod httpservice;
mod server;
mod watch;

#[derive(Parser)]
#[command(
    version,
    about = "Workloads authenticating each other with SPIFFE X.509 SVIDs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// A simple backend service. It accepts mTLS connections from authorized
    /// SPIFFE IDs, reads one line and replies.
    Backend(backend::Args),
    /// The same backend behind HTTPS with mTLS.
    BackendHttp(backend::Args),
    /// A plain HTTP service. It does not do any mTLS itself.
    Httpservice(httpservice::Args),
    /// The endpoints that serve requests to customers. Relays messages from
    /// the backend services.
    Customer(customer::Args),
    /// Log SVID and trust bundle updates until interrupted.
    Watch(watch::Args),
}

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    // Every rustls configuration in this program uses this one.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    match Cli::parse().command {
        Command::Backend(args) => backend::run_stream(args).await,
        Command::BackendHttp(args) => backend::run_http(args).await,
        Command::Httpservice(args) => httpservice::run(args).await,
        Command::Customer(args) => customer::run(args).await,
        Command::Watch(args) => watch::run(args).await,
    }
}
