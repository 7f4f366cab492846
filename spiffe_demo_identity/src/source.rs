//! The identity source: holds the workload's current SVID and trust bundles
//! and keeps them fresh from an [`IdentityProvider`].
//!
//! A single background task per source consumes the provider's update
//! stream and swaps in new material atomically. Readers load the current
//! snapshot without taking any lock, so a handshake in progress never waits
//! on a rotation and never sees a certificate paired with a stale key.
//!
//! ```no_run
//! # async fn f() -> Result<(), Box<dyn std::error::Error>> {
//! use spiffe_demo_identity::{DirectoryProvider, IdentitySource};
//! use std::time::Duration;
//!
//! let provider = DirectoryProvider::new("/run/spiffe/svid", Duration::from_secs(1));
//! let source = IdentitySource::connect(provider, Duration::from_secs(3)).await?;
//! println!("I am {}", source.current_svid()?.spiffe_id());
//! source.close();
//! # Ok(())
//! # }
//! ```

use arc_swap::ArcSwapOption;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bundle::X509Bundle;
use crate::bundle::X509BundleSet;
use crate::files::{self, DirectoryProvider};
use crate::id::TrustDomain;
use crate::provider::{IdentityProvider, ProviderError, X509Context};
use crate::svid::X509Svid;

/// Bootstrap timeout used when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const EXPIRY_WARNING_THRESHOLD: time::Duration = time::Duration::seconds(30);

// Once the source has been running, this many consecutive subscriptions
// that end without delivering anything put it in the failed state.
const MAX_RESUBSCRIBE_ATTEMPTS: u32 = 8;

/// Command line arguments for [`IdentitySource`].
#[derive(clap::Args, Debug, Default)]
#[group(id = "spiffe_demo_identity_args")]
pub struct Args {
    /// Where the SVID files live.
    #[command(flatten)]
    pub files: files::Args,

    /// Bootstrap timeout.
    #[arg(
        long,
        default_value = "3s",
        value_parser = humantime::parse_duration,
        help = "How long to wait for the first SVID and trust bundle before giving up."
    )]
    pub identity_timeout: Option<Duration>,
}

/// Error type returned by [`IdentitySource`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// No initial SVID and bundle arrived in time.
    #[error("no SVID and trust bundle from the identity provider within {0}")]
    Connect(humantime::Duration),
    /// Queried before the first successful fetch.
    #[error("identity material not fetched yet")]
    NotReady,
    /// No bundle is known for the requested trust domain.
    #[error("no trust bundle for trust domain {0}")]
    UnknownTrustDomain(TrustDomain),
    /// [`IdentitySource::close`] has been called.
    #[error("identity source is closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Starting,
    Running,
    Failed,
    Closed,
}

/// Published to watchers each time the snapshot or phase changes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Status {
    pub(crate) phase: Phase,
    pub(crate) svid_generation: u64,
    pub(crate) bundle_generation: u64,
}

pub(crate) struct Shared {
    pub(crate) snapshot: ArcSwapOption<X509Context>,
    pub(crate) status: watch::Sender<Status>,
    pub(crate) last_error: ArcSwapOption<String>,
    closed: AtomicBool,
}

enum Applied {
    Changed,
    Unchanged,
}

impl Shared {
    // Only ever called from the refresh task, so load-then-store cannot race
    // with another writer.
    fn apply(&self, update: X509Context) -> Result<Applied, ProviderError> {
        update.validate()?;
        let current = self.snapshot.load_full();
        let (svid, svid_changed) = match current {
            None => (update.svid, true),
            Some(ref cur) if cur.svid.same_material(&update.svid) => (Arc::clone(&cur.svid), false),
            Some(ref cur) if update.svid.not_before() < cur.svid.not_before() => {
                log::warn!(
                    "Ignoring SVID for {} issued at {}, older than the current one issued at {}",
                    update.svid.spiffe_id(),
                    update.svid.not_before(),
                    cur.svid.not_before()
                );
                (Arc::clone(&cur.svid), false)
            }
            Some(_) => (update.svid, true),
        };
        let (bundles, bundles_changed) = match current {
            Some(ref cur) if *cur.bundles == *update.bundles => (Arc::clone(&cur.bundles), false),
            _ => (update.bundles, true),
        };
        if !svid_changed && !bundles_changed {
            return Ok(Applied::Unchanged);
        }
        let next = X509Context { svid, bundles };
        next.validate()?;
        if svid_changed {
            log::info!(
                "SVID for {} rotated, valid until {}",
                next.svid.spiffe_id(),
                next.svid.not_after()
            );
            warn_if_expiring(&next.svid, OffsetDateTime::now_utc());
        }
        if bundles_changed {
            log::info!("Trust bundles updated for {} trust domain(s)", next.bundles.len());
        }
        self.snapshot.store(Some(Arc::new(next)));
        self.status.send_modify(|s| {
            s.phase = Phase::Running;
            if svid_changed {
                s.svid_generation += 1;
            }
            if bundles_changed {
                s.bundle_generation += 1;
            }
        });
        Ok(Applied::Changed)
    }

    fn has_material(&self) -> bool {
        self.snapshot.load().is_some()
    }
}

fn warn_if_expiring(svid: &X509Svid, now: OffsetDateTime) -> bool {
    let left = svid.time_to_expiry(now);
    if left < EXPIRY_WARNING_THRESHOLD {
        log::warn!(
            "SVID for {} expires at {} ({} seconds from now)",
            svid.spiffe_id(),
            svid.not_after(),
            left.whole_seconds()
        );
        true
    } else {
        false
    }
}

fn resubscribe_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(100),
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(10),
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

async fn refresh_loop<P: IdentityProvider>(provider: P, shared: Arc<Shared>) {
    let mut backoff = resubscribe_backoff();
    let mut failures = 0;
    loop {
        let mut stream = provider.watch();
        let mut delivered = false;
        while let Some(item) = stream.next().await {
            match item.and_then(|update| shared.apply(update)) {
                Ok(applied) => {
                    if let Applied::Unchanged = applied {
                        log::debug!("Identity provider sent unchanged material");
                    }
                    delivered = true;
                    failures = 0;
                    backoff.reset();
                }
                Err(e) => {
                    log::error!("Identity provider update: {}", e);
                    shared.last_error.store(Some(Arc::new(e.to_string())));
                }
            }
        }
        log::error!("lost identity provider stream");
        // Before the first material arrives, connect's timeout is in charge.
        if !delivered && shared.has_material() {
            failures += 1;
            if failures >= MAX_RESUBSCRIBE_ATTEMPTS {
                log::error!(
                    "Giving up on the identity provider after {} attempts",
                    failures
                );
                shared.status.send_modify(|s| s.phase = Phase::Failed);
                return;
            }
        }
        let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
        tokio::time::sleep(delay).await;
    }
}

/// The workload's identity material, kept current by a background task.
///
/// Share it between consumers with an [`Arc`]. Dropping it is the same as
/// calling [`IdentitySource::close`].
pub struct IdentitySource {
    pub(crate) shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IdentitySource {
    /// Subscribe to `provider` and wait, at most `timeout`, for the first
    /// SVID and trust bundle to arrive.
    pub async fn connect<P: IdentityProvider>(
        provider: P,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let (status, mut rx) = watch::channel(Status {
            phase: Phase::Starting,
            svid_generation: 0,
            bundle_generation: 0,
        });
        let shared = Arc::new(Shared {
            snapshot: ArcSwapOption::empty(),
            status,
            last_error: ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
        });
        let task = tokio::spawn(refresh_loop(provider, Arc::clone(&shared)));
        let source = Self {
            shared,
            task: Mutex::new(Some(task)),
        };
        let ready = tokio::time::timeout(timeout, rx.wait_for(|s| s.phase != Phase::Starting))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !ready {
            if let Some(e) = source.shared.last_error.load_full() {
                log::error!("Identity provider not ready: {}", e);
            }
            source.close();
            return Err(SourceError::Connect(timeout.into()));
        }
        Ok(source)
    }

    /// Connect to the directory provider named on the command line.
    pub async fn from_args(args: &Args) -> Result<Self, SourceError> {
        Self::connect(
            DirectoryProvider::from_args(&args.files),
            args.identity_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        )
        .await
    }

    /// The SVID and bundles as one consistent snapshot.
    pub fn snapshot(&self) -> Result<Arc<X509Context>, SourceError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SourceError::Closed);
        }
        self.shared.snapshot.load_full().ok_or(SourceError::NotReady)
    }

    /// The latest SVID.
    pub fn current_svid(&self) -> Result<Arc<X509Svid>, SourceError> {
        self.snapshot().map(|s| Arc::clone(&s.svid))
    }

    /// The latest bundle for `trust_domain`.
    pub fn current_bundle(&self, trust_domain: &TrustDomain) -> Result<Arc<X509Bundle>, SourceError> {
        self.snapshot()?
            .bundles
            .get(trust_domain)
            .cloned()
            .ok_or_else(|| SourceError::UnknownTrustDomain(trust_domain.clone()))
    }

    /// Every known bundle.
    pub fn bundles(&self) -> Result<Arc<X509BundleSet>, SourceError> {
        self.snapshot().map(|s| Arc::clone(&s.bundles))
    }

    /// Whether the provider has been given up on. The last material stays
    /// readable until it expires.
    pub fn is_failed(&self) -> bool {
        self.shared.status.borrow().phase == Phase::Failed
    }

    /// Stop refreshing and release the provider subscription. Watch
    /// subscriptions end without an error. Calling this more than once is
    /// harmless.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Runs on drop, so a poisoned lock must not panic here.
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.shared.status.send_modify(|s| s.phase = Phase::Closed);
    }
}

impl Drop for IdentitySource {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySource")
            .field("status", &*self.shared.status.borrow())
            .finish()
    }
}
