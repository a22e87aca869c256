//! Peer lookup and message routing across the mesh.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;

use distribus_core::{BusError, Request};

use super::Host;
use crate::peer::MESSAGE;

impl Host {
    /// Url of the host where peer `id` lives.
    ///
    /// Local peers resolve to our own url (`None` while not listening). Remote
    /// lookups hit the address cache first, then ask every connected host at
    /// once; the first positive answer wins and is cached.
    pub async fn find(&self, id: &str) -> Result<Option<String>, BusError> {
        if self.inner.peers.contains_key(id) {
            return Ok(self.url());
        }
        let cached = self.inner.addresses.get(id).map(|url| url.value().clone());
        if let Some(url) = cached {
            return Ok(Some(url));
        }

        let request = Request::Find { id: id.to_string() }.to_payload();
        let mut answers: FuturesUnordered<_> = self
            .inner
            .connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|(via, conn)| {
                let request = request.clone();
                async move { (via, conn.request(request).await) }
            })
            .collect();

        while let Some((via, answer)) = answers.next().await {
            match answer {
                Ok(Value::String(url)) if !url.is_empty() => {
                    tracing::debug!(peer = id, %url, "found peer");
                    self.inner.addresses.insert(id.to_string(), url.clone());
                    return Ok(Some(url));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(peer = id, url = %via, error = %e, "find failed"),
            }
        }
        Err(BusError::PeerNotFound(id.to_string()))
    }

    /// Deliver `message` from `from` to peer `to`, wherever it lives.
    ///
    /// Fails with [`BusError::PeerNotFound`] when no host knows `to` (a stale
    /// cache entry is dropped on the way) and with
    /// [`BusError::PeerUnreachable`] when its host cannot be reached.
    pub async fn send(&self, from: &str, to: &str, message: Value) -> Result<(), BusError> {
        if self.inner.peers.contains_key(to) {
            return self.deliver(from, to, &message);
        }

        let Some(url) = self.find(to).await? else {
            return Err(BusError::PeerNotFound(to.to_string()));
        };
        let Some(conn) = self.connection(&url) else {
            return Err(BusError::PeerUnreachable { id: to.to_string(), url });
        };

        let request = Request::Send {
            from: from.to_string(),
            to: to.to_string(),
            message,
        };
        match conn.request(request.to_payload()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_peer_not_found() => {
                tracing::debug!(peer = to, %url, "dropping stale address");
                self.inner.addresses.remove_if(to, |_, cached| *cached == url);
                Err(BusError::PeerNotFound(to.to_string()))
            }
            Err(e) => {
                tracing::debug!(peer = to, %url, error = %e, "send failed");
                Err(BusError::PeerUnreachable { id: to.to_string(), url })
            }
        }
    }

    /// Emit `message` on local peer `to`.
    pub(crate) fn deliver(&self, from: &str, to: &str, message: &Value) -> Result<(), BusError> {
        let peer = self.get(to).ok_or_else(|| BusError::PeerNotFound(to.to_string()))?;
        peer.emit(MESSAGE, from, message);
        Ok(())
    }
}
