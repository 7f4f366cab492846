//! An in-process identity provider. Material is pushed in by the embedder,
//! which makes it convenient for tests and for programs that obtain SVIDs by
//! some means of their own.

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::sync::{Arc, Mutex};

use crate::provider::{IdentityProvider, ProviderError, X509Context};

type Sender = mpsc::UnboundedSender<Result<X509Context, ProviderError>>;

struct Inner {
    current: Option<X509Context>,
    available: bool,
    subscribers: Vec<Sender>,
}

/// Identity provider fed by [`MemoryProvider::push`]. Clones share state.
#[derive(Clone)]
pub struct MemoryProvider(Arc<Mutex<Inner>>);

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// A reachable provider with no material yet.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Inner {
            current: None,
            available: true,
            subscribers: Vec::new(),
        })))
    }

    /// A reachable provider that already has material.
    pub fn with_context(context: X509Context) -> Self {
        let p = Self::new();
        p.push(context);
        p
    }

    /// Publish new material to every subscriber.
    pub fn push(&self, context: X509Context) {
        let mut inner = self.0.lock().unwrap();
        inner
            .subscribers
            .retain(|tx| tx.unbounded_send(Ok(context.clone())).is_ok());
        inner.current = Some(context);
    }

    /// Deliver an error to every subscriber without ending their streams.
    pub fn fail(&self, reason: &str) {
        let mut inner = self.0.lock().unwrap();
        inner.subscribers.retain(|tx| {
            tx.unbounded_send(Err(ProviderError::Unavailable(reason.to_owned())))
                .is_ok()
        });
    }

    /// End every subscriber's stream, as if the provider connection dropped.
    pub fn disconnect(&self) {
        self.0.lock().unwrap().subscribers.clear();
    }

    /// While unavailable, fetching fails and new subscriptions end
    /// immediately with an error. Going unavailable also disconnects.
    pub fn set_available(&self, available: bool) {
        let mut inner = self.0.lock().unwrap();
        inner.available = available;
        if !available {
            inner.subscribers.clear();
        }
    }

    /// Number of subscriptions whose receiving end is still alive.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.0.lock().unwrap();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

impl IdentityProvider for MemoryProvider {
    fn fetch(&self) -> BoxFuture<'_, Result<X509Context, ProviderError>> {
        let inner = self.0.lock().unwrap();
        let result = if !inner.available {
            Err(ProviderError::Unavailable(String::from("provider unreachable")))
        } else {
            inner
                .current
                .clone()
                .ok_or_else(|| ProviderError::Unavailable(String::from("no identity issued yet")))
        };
        futures::future::ready(result).boxed()
    }

    fn watch(&self) -> BoxStream<'static, Result<X509Context, ProviderError>> {
        let mut inner = self.0.lock().unwrap();
        if !inner.available {
            return futures::stream::once(futures::future::ready(Err(
                ProviderError::Unavailable(String::from("provider unreachable")),
            )))
            .boxed();
        }
        let (tx, rx) = mpsc::unbounded();
        if let Some(ref current) = inner.current {
            let _ = tx.unbounded_send(Ok(current.clone()));
        }
        inner.subscribers.push(tx);
        rx.boxed()
    }
}
