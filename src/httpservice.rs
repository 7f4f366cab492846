use axum::routing::get;
use std::error::Error;
use std::net::SocketAddr;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::server::{run_until, termination};

#[derive(clap::Args, Debug)]
pub struct Args {
    #[arg(
        short = 'l',
        long,
        default_value = "127.0.0.1:8080",
        help = "Address to listen on."
    )]
    server_address: SocketAddr,
}

/// Local time if the offset can be determined, UTC otherwise.
pub(crate) fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

pub(crate) fn greeting(service: &str, at: OffsetDateTime) -> String {
    let stamp = at
        .format(format_description!(
            "[day]/[month]/[year repr:last_two] [hour]:[minute]:[second]"
        ))
        .unwrap_or_else(|_| at.to_string());
    format!("{}: Successfully connected to the {}!!!", stamp, service)
}

fn router() -> axum::Router {
    axum::Router::new().route(
        "/",
        get(|| async {
            log::info!("Handling a request");
            greeting("HTTP service", now())
        }),
    )
}

/// Plain HTTP. Authentication is left to whatever proxy sits in front.
pub async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    log::info!("HTTP server listening on {}", args.server_address);
    let handle = axum_server::Handle::new();
    let serve = axum_server::bind(args.server_address)
        .handle(handle.clone())
        .serve(router().into_make_service());
    run_until(serve, handle, termination()).await?;
    Ok(())
}
