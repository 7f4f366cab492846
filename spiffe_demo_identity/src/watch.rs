//! Watch subscriptions: deliver SVID or trust bundle rotations to a
//! caller-supplied handler from a background task.
//!
//! ```no_run
//! # async fn f(source: &spiffe_demo_identity::IdentitySource) {
//! use spiffe_demo_identity::watch::{WatchKind, WatchUpdate, handlers};
//!
//! let sub = source.subscribe(
//!     WatchKind::Svid,
//!     handlers(
//!         |update| {
//!             if let WatchUpdate::Svid(svid) = update {
//!                 log::info!("now {}", svid.spiffe_id());
//!             }
//!         },
//!         |e| log::error!("watch failed: {}", e),
//!     ),
//! );
//! // ...
//! sub.cancel().await;
//! # }
//! ```

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::bundle::X509BundleSet;
use crate::provider::X509Context;
use crate::source::{IdentitySource, Phase, Shared, Status};
use crate::svid::X509Svid;

/// What a subscription is interested in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchKind {
    /// The workload's own SVID.
    Svid,
    /// The set of trust bundles.
    TrustBundle,
}

impl WatchKind {
    fn generation(self, status: &Status) -> u64 {
        match self {
            Self::Svid => status.svid_generation,
            Self::TrustBundle => status.bundle_generation,
        }
    }

    fn update(self, snapshot: &X509Context) -> WatchUpdate {
        match self {
            Self::Svid => WatchUpdate::Svid(Arc::clone(&snapshot.svid)),
            Self::TrustBundle => WatchUpdate::Bundles(Arc::clone(&snapshot.bundles)),
        }
    }
}

/// Material delivered to [`Watcher::on_update`].
#[derive(Clone, Debug)]
pub enum WatchUpdate {
    /// A new SVID.
    Svid(Arc<X509Svid>),
    /// A new set of trust bundles.
    Bundles(Arc<X509BundleSet>),
}

impl WatchUpdate {
    // The source keeps the old Arc when material does not change, so
    // pointer identity is material identity.
    fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Svid(a), Self::Svid(b)) => Arc::ptr_eq(a, b),
            (Self::Bundles(a), Self::Bundles(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// How a subscription ended.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    /// The subscription or its source was shut down. Not a failure, and
    /// never passed to [`Watcher::on_error`].
    #[error("watch cancelled")]
    Cancelled,
    /// The identity provider failed for good.
    #[error("identity provider failed: {0}")]
    Fault(String),
}

/// Receives updates for one subscription. Callbacks run on the
/// subscription's task, one at a time.
pub trait Watcher: Send + 'static {
    /// Called with the current material and then after every rotation.
    fn on_update(&mut self, update: WatchUpdate);

    /// Called at most once, with [`WatchError::Fault`], right before the
    /// subscription ends.
    fn on_error(&mut self, error: WatchError);
}

/// A [`Watcher`] made of two closures. See [`handlers`].
pub struct Handlers<U, E> {
    on_update: U,
    on_error: E,
}

/// Build a [`Watcher`] from an update closure and an error closure.
pub fn handlers<U, E>(on_update: U, on_error: E) -> Handlers<U, E>
where
    U: FnMut(WatchUpdate) + Send + 'static,
    E: FnMut(WatchError) + Send + 'static,
{
    Handlers {
        on_update,
        on_error,
    }
}

impl<U, E> Watcher for Handlers<U, E>
where
    U: FnMut(WatchUpdate) + Send + 'static,
    E: FnMut(WatchError) + Send + 'static,
{
    fn on_update(&mut self, update: WatchUpdate) {
        (self.on_update)(update)
    }

    fn on_error(&mut self, error: WatchError) {
        (self.on_error)(error)
    }
}

fn stop_requested(stop: &mut oneshot::Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(oneshot::error::TryRecvError::Empty))
}

async fn watch_loop<W: Watcher>(
    kind: WatchKind,
    shared: Arc<Shared>,
    mut watcher: W,
    mut stop: oneshot::Receiver<()>,
) -> WatchError {
    let mut rx = shared.status.subscribe();
    let mut seen = None;
    let mut delivered: Option<WatchUpdate> = None;
    loop {
        if stop_requested(&mut stop) {
            return WatchError::Cancelled;
        }
        let status = *rx.borrow_and_update();
        if status.phase == Phase::Closed {
            return WatchError::Cancelled;
        }
        let generation = kind.generation(&status);
        if seen != Some(generation) {
            // The snapshot is stored before the status announcing it, so it
            // may already be newer than what woke us up.
            if let Some(snapshot) = shared.snapshot.load_full() {
                let update = kind.update(&snapshot);
                if !delivered.as_ref().is_some_and(|d| d.is(&update)) {
                    watcher.on_update(update.clone());
                    delivered = Some(update);
                }
                seen = Some(generation);
            }
        }
        if status.phase == Phase::Failed {
            let reason = shared
                .last_error
                .load_full()
                .map(|e| e.to_string())
                .unwrap_or_else(|| String::from("subscription lost"));
            let e = WatchError::Fault(reason);
            watcher.on_error(e.clone());
            return e;
        }
        tokio::select! {
            biased;
            _ = &mut stop => return WatchError::Cancelled,
            r = rx.changed() => {
                if r.is_err() {
                    return WatchError::Cancelled;
                }
            }
        }
    }
}

/// Handle on a running subscription. Dropping it cancels the subscription
/// without waiting for the task to finish.
pub struct Subscription {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<WatchError>>,
}

impl Subscription {
    /// Cancel the subscription and wait for its task to finish. Once this
    /// returns, neither handler will be called again.
    pub async fn cancel(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Wait for the subscription to end on its own: [`WatchError::Cancelled`]
    /// if the source was closed, or the fault that was reported to
    /// [`Watcher::on_error`].
    pub async fn wait(mut self) -> WatchError {
        match self.task.take() {
            Some(task) => task
                .await
                .unwrap_or_else(|e| WatchError::Fault(format!("watcher task: {}", e))),
            None => WatchError::Cancelled,
        }
    }

    /// Whether the subscription task has finished.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl IdentitySource {
    /// Start delivering `kind` updates to `watcher`. The current material,
    /// if any, is delivered first.
    pub fn subscribe<W: Watcher>(&self, kind: WatchKind, watcher: W) -> Subscription {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(watch_loop(kind, Arc::clone(&self.shared), watcher, stop_rx));
        Subscription {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}
