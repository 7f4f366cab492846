use futures::future::join;
use spiffe_demo_identity::watch::handlers;
use spiffe_demo_identity::{
    CertificateDetails, IdentitySource, Subscription, WatchError, WatchKind, WatchUpdate,
};
use std::error::Error;

use crate::server::termination;

#[derive(clap::Args, Debug)]
pub struct Args {
    #[command(flatten)]
    identity: spiffe_demo_identity::source::Args,
}

fn describe(update: &WatchUpdate) -> String {
    match update {
        WatchUpdate::Svid(svid) => {
            let mut s = format!(
                "SVID updated for {:?}, expires {}",
                svid.spiffe_id().to_string(),
                svid.not_after()
            );
            match CertificateDetails::from_der(svid.leaf()) {
                Ok(details) => s.push_str(&format!("\n{}", details)),
                Err(e) => s.push_str(&format!(" (unreadable leaf: {})", e)),
            }
            s
        }
        WatchUpdate::Bundles(bundles) => {
            let domains: Vec<String> = bundles
                .iter()
                .map(|b| format!("{} ({} authorities)", b.trust_domain(), b.authorities().len()))
                .collect();
            format!("Trust bundles updated: {}", domains.join(", "))
        }
    }
}

fn log_fault(e: WatchError) {
    if e != WatchError::Cancelled {
        log::error!("Watch failed: {}", e);
    }
}

fn subscribe(source: &IdentitySource, kind: WatchKind) -> Subscription {
    source.subscribe(
        kind,
        handlers(|update| log::info!("{}", describe(&update)), log_fault),
    )
}

/// Log every rotation until interrupted or until the provider fails.
pub async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let source = IdentitySource::from_args(&args.identity).await?;
    let svids = subscribe(&source, WatchKind::Svid);
    let bundles = subscribe(&source, WatchKind::TrustBundle);
    // Dropping a subscription stops it.
    let r: Result<(), Box<dyn Error>> = tokio::select! {
        r = termination() => r.map_err(Into::into),
        (svid, _) = join(svids.wait(), bundles.wait()) => match svid {
            WatchError::Cancelled => Ok(()),
            e => Err(e.into()),
        },
    };
    source.close();
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiffe_demo_identity::{MemoryProvider, testdata};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn describes_both_kinds() {
        let source = IdentitySource::connect(
            MemoryProvider::with_context(testdata::client_context()),
            Duration::from_secs(3),
        )
        .await
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for kind in [WatchKind::Svid, WatchKind::TrustBundle] {
            let seen = Arc::clone(&seen);
            subs.push(source.subscribe(
                kind,
                handlers(
                    move |update| seen.lock().unwrap().push(describe(&update)),
                    log_fault,
                ),
            ));
        }
        while seen.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for sub in subs {
            sub.cancel().await;
        }

        let seen = seen.lock().unwrap();
        let svid = seen.iter().find(|s| s.starts_with("SVID")).unwrap();
        assert!(
            svid.starts_with("SVID updated for \"spiffe://example.org/client\", expires "),
            "{}",
            svid
        );
        assert!(svid.contains("URI: spiffe://example.org/client"), "{}", svid);
        let bundles = seen.iter().find(|s| s.starts_with("Trust")).unwrap();
        assert!(bundles.starts_with("Trust bundles updated: example.org ("), "{}", bundles);
    }
}
