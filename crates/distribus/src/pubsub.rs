//! Channel based publish/subscribe on top of the host mesh.
//!
//! Subscriptions are local to a host. Publishing runs local subscribers
//! first, then notifies every connected host, which runs its own.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;

use distribus_core::Request;

use crate::host::Host;

/// Callback invoked with each message published on a channel.
pub type Subscriber = Arc<dyn Fn(&Value) + Send + Sync>;

/// Wrap a closure as a [`Subscriber`]. Keep the handle to unsubscribe later.
pub fn subscriber<F>(callback: F) -> Subscriber
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(callback)
}

impl Host {
    /// Add `callback` to `channel`. Subscribing the same handle twice makes
    /// it run twice per message.
    pub fn subscribe(&self, channel: impl Into<String>, callback: Subscriber) {
        self.inner.channels.entry(channel.into()).or_default().push(callback);
    }

    /// Remove one registration of `callback` from `channel`.
    pub fn unsubscribe(&self, channel: &str, callback: &Subscriber) {
        if let Entry::Occupied(mut entry) = self.inner.channels.entry(channel.to_string()) {
            let subscribers = entry.get_mut();
            if let Some(pos) = subscribers.iter().position(|s| Arc::ptr_eq(s, callback)) {
                subscribers.remove(pos);
            }
            if subscribers.is_empty() {
                entry.remove();
            }
        }
    }

    /// Publish `message` on `channel` to this host and every connected one.
    ///
    /// Local subscribers run before this returns. The returned future
    /// notifies the connected hosts; dropping it skips only that part.
    /// Best effort: hosts that cannot be notified are skipped.
    pub fn publish(&self, channel: &str, message: Value) -> BoxFuture<'static, ()> {
        self.fan_out(channel, &message);

        let connections: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if connections.is_empty() {
            return future::ready(()).boxed();
        }

        let payload = Request::Publish {
            channel: channel.to_string(),
            message,
        }
        .to_payload();
        future::join_all(connections.into_iter().map(move |(url, conn)| {
            let payload = payload.clone();
            async move {
                if let Err(e) = conn.notify(payload).await {
                    tracing::debug!(%url, error = %e, "publish notify failed");
                }
            }
        }))
        .map(|_| ())
        .boxed()
    }

    /// Channels with at least one local subscriber, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.inner.channels.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner.channels.get(channel).map_or(0, |s| s.len())
    }

    /// Run the local subscribers of `channel` on a snapshot of the list.
    pub(crate) fn fan_out(&self, channel: &str, message: &Value) {
        let subscribers = self
            .inner
            .channels
            .get(channel)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        for subscriber in subscribers {
            subscriber(message);
        }
    }
}
