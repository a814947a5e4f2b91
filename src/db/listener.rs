//! LISTEN/NOTIFY handlers.
//!
//! A [`NotificationHandler`] receives notifications whose payload has already
//! been decoded into `P`. Plain closures become handlers through
//! [`handler_fn`] (synchronous) or [`async_handler_fn`] (returning a future);
//! both register the same way.
//!
//! ```no_run
//! use pgtemplate::{Notification, handler_fn};
//!
//! let on_order = handler_fn(|n: Notification<i64>| {
//!     println!("order {} on {}", n.payload, n.channel);
//! });
//! ```

use crate::db::decoder::RowDecoder;
use crate::db::transport::RawListener;
use crate::models::{Notification, RawNotification};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Receives decoded notifications.
#[async_trait]
pub trait NotificationHandler<P: Send + 'static>: Send + Sync {
    async fn handle(&self, notification: Notification<P>);
}

/// Handler backed by a synchronous closure.
pub struct FnHandler<F>(F);

#[async_trait]
impl<P, F> NotificationHandler<P> for FnHandler<F>
where
    P: Send + 'static,
    F: Fn(Notification<P>) + Send + Sync,
{
    async fn handle(&self, notification: Notification<P>) {
        (self.0)(notification)
    }
}

/// Handler backed by a closure returning a future.
pub struct AsyncFnHandler<F>(F);

#[async_trait]
impl<P, F, Fut> NotificationHandler<P> for AsyncFnHandler<F>
where
    P: Send + 'static,
    F: Fn(Notification<P>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, notification: Notification<P>) {
        (self.0)(notification).await
    }
}

/// Wrap a synchronous closure as a handler.
///
/// Keep the returned `Arc`: removal is by identity.
pub fn handler_fn<P, F>(f: F) -> Arc<dyn NotificationHandler<P>>
where
    P: Send + 'static,
    F: Fn(Notification<P>) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap a closure returning a future as a handler.
pub fn async_handler_fn<P, F, Fut>(f: F) -> Arc<dyn NotificationHandler<P>>
where
    P: Send + 'static,
    F: Fn(Notification<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(AsyncFnHandler(f))
}

/// Bridges the transport's raw callback to a typed handler.
pub(crate) struct ListenerAdapter<P, H: ?Sized> {
    connection_id: String,
    handler: Arc<H>,
    _payload: PhantomData<fn() -> P>,
}

impl<P, H: ?Sized> ListenerAdapter<P, H> {
    pub(crate) fn new(connection_id: String, handler: Arc<H>) -> Self {
        Self {
            connection_id,
            handler,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P, H> RawListener for ListenerAdapter<P, H>
where
    P: DeserializeOwned + Send + 'static,
    H: NotificationHandler<P> + ?Sized + 'static,
{
    async fn notify(&self, raw: RawNotification) {
        let payload = match RowDecoder::decode::<P>(&JsonValue::String(raw.payload)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    connection_id = %self.connection_id,
                    channel = %raw.channel,
                    error = %e,
                    "Dropping notification with undecodable payload"
                );
                return;
            }
        };

        self.handler
            .handle(Notification {
                connection_id: self.connection_id.clone(),
                process_id: raw.process_id,
                channel: raw.channel,
                payload,
            })
            .await;
    }
}

/// Pointer identity of a handler, ignoring vtable metadata.
pub(crate) fn handler_key<H: ?Sized>(handler: &Arc<H>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

/// Maps `(handler, channel)` to the adapter registered with the transport.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    entries: HashMap<(usize, String), Arc<dyn RawListener>>,
}

impl ListenerRegistry {
    /// Record an adapter, returning the one it replaces.
    pub(crate) fn insert(
        &mut self,
        key: usize,
        channel: &str,
        adapter: Arc<dyn RawListener>,
    ) -> Option<Arc<dyn RawListener>> {
        self.entries.insert((key, channel.to_string()), adapter)
    }

    pub(crate) fn remove(&mut self, key: usize, channel: &str) -> Option<Arc<dyn RawListener>> {
        self.entries.remove(&(key, channel.to_string()))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry, yielding `(channel, adapter)`.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (String, Arc<dyn RawListener>)> + '_ {
        self.entries
            .drain()
            .map(|((_, channel), adapter)| (channel, adapter))
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.entries.len())
            .finish()
    }
}
