//! Host — owns local peers, connections to other hosts, the peer address
//! cache, and the pub/sub channel table.
//!
//! Every table is a `DashMap` owned by one `Host`; two hosts in the same
//! process share nothing. No table guard is ever held across an `.await`.

mod handler;
mod membership;
mod reconnect;
mod routing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{self, FutureExt};
use serde_json::Value;
use tokio::task::AbortHandle;

use distribus_core::config::NetworkConfig;
use distribus_core::BusError;

use crate::connection::Connection;
use crate::peer::{Peer, Route};
use crate::pubsub::Subscriber;

pub(crate) use handler::HostHandler;

/// Reconnect and request timing of a host.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Give up reconnecting this long after the connection was lost.
    pub reconnect_timeout: Duration,
    /// Delay before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Each failed attempt divides the delay by this factor.
    pub reconnect_decay: f64,
    pub request_timeout: Duration,
}

impl From<&NetworkConfig> for Settings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            reconnect_timeout: config.reconnect_timeout(),
            reconnect_delay: config.reconnect_delay(),
            reconnect_decay: config.reconnect_decay,
            request_timeout: config.request_timeout(),
        }
    }
}

/// Partial update applied by [`Host::config`]. `None` fields are left as is.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    pub network_id: Option<String>,
    pub reconnect_timeout: Option<Duration>,
    pub reconnect_delay: Option<Duration>,
    pub reconnect_decay: Option<f64>,
    pub request_timeout: Option<Duration>,
}

impl From<&NetworkConfig> for HostOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            network_id: config.network_id.clone(),
            reconnect_timeout: Some(config.reconnect_timeout()),
            reconnect_delay: Some(config.reconnect_delay()),
            reconnect_decay: Some(config.reconnect_decay),
            request_timeout: Some(config.request_timeout()),
        }
    }
}

pub(crate) struct Listening {
    address: String,
    port: u16,
    url: String,
    accept: AbortHandle,
}

pub(crate) struct HostInner {
    /// Local peers by id.
    peers: DashMap<String, Arc<Peer>>,
    /// Greeted connections by the remote host's url.
    pub(crate) connections: DashMap<String, Connection>,
    /// Peer id -> url of the host it was last found on.
    addresses: DashMap<String, String>,
    /// Pub/sub subscribers by channel name.
    pub(crate) channels: DashMap<String, Vec<Subscriber>>,
    /// Every live socket, greeted or not, by connection id.
    sockets: DashMap<u64, Connection>,
    /// Active reconnect timers: url -> timer generation.
    reconnects: DashMap<String, u64>,
    next_timer: AtomicU64,
    /// Bumped by every `close()`; work started under an older epoch must not
    /// register anything.
    epoch: AtomicU64,
    server: RwLock<Option<Listening>>,
    network_id: RwLock<Option<String>>,
    settings: RwLock<Settings>,
}

/// A node of the mesh. Cloning yields another handle to the same host.
#[derive(Clone)]
pub struct Host {
    pub(crate) inner: Arc<HostInner>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("url", &self.url())
            .field("peers", &self.inner.peers.len())
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

impl Host {
    pub fn new() -> Self {
        Self::with_config(&NetworkConfig::default())
    }

    pub fn with_config(config: &NetworkConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                peers: DashMap::new(),
                connections: DashMap::new(),
                addresses: DashMap::new(),
                channels: DashMap::new(),
                sockets: DashMap::new(),
                reconnects: DashMap::new(),
                next_timer: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                server: RwLock::new(None),
                network_id: RwLock::new(config.network_id.clone()),
                settings: RwLock::new(Settings::from(config)),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<HostInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<HostInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// Apply a partial configuration update.
    ///
    /// The network id can be set once; changing it afterwards fails with
    /// [`BusError::NetworkIdLocked`].
    pub fn config(&self, options: HostOptions) -> Result<(), BusError> {
        if let Some(requested) = options.network_id {
            let mut slot = write(&self.inner.network_id);
            if let Some(current) = slot.as_deref() {
                if current != requested {
                    return Err(BusError::NetworkIdLocked {
                        current: current.to_string(),
                        requested,
                    });
                }
            }
            *slot = Some(requested);
        }

        let mut settings = write(&self.inner.settings);
        if let Some(v) = options.reconnect_timeout {
            settings.reconnect_timeout = v;
        }
        if let Some(v) = options.reconnect_delay {
            settings.reconnect_delay = v;
        }
        if let Some(v) = options.reconnect_decay {
            settings.reconnect_decay = v;
        }
        if let Some(v) = options.request_timeout {
            settings.request_timeout = v;
        }
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        read(&self.inner.settings).clone()
    }

    pub fn network_id(&self) -> Option<String> {
        read(&self.inner.network_id).clone()
    }

    /// Reconcile our network id with one announced by another host.
    /// An unset local id adopts the remote one.
    pub(crate) fn adopt_network_id(&self, remote: Option<&str>) -> Result<(), BusError> {
        let Some(remote) = remote else {
            return Ok(());
        };
        let mut slot = write(&self.inner.network_id);
        if let Some(local) = slot.as_deref() {
            return if local == remote {
                Ok(())
            } else {
                Err(BusError::NetworkIdMismatch {
                    local: local.to_string(),
                    remote: remote.to_string(),
                })
            };
        }
        *slot = Some(remote.to_string());
        tracing::info!(network_id = remote, "adopted network id");
        Ok(())
    }

    // ── Local peers ──────────────────────────────────────────────────────────

    /// Create a peer on this host.
    pub fn create(&self, id: impl Into<String>) -> Result<Arc<Peer>, BusError> {
        let id = id.into();
        match self.inner.peers.entry(id.clone()) {
            Entry::Occupied(_) => Err(BusError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let peer = Arc::new(Peer::new(id, self.route()));
                slot.insert(peer.clone());
                Ok(peer)
            }
        }
    }

    /// Remove a peer by id. Unknown ids are ignored.
    pub fn remove(&self, id: &str) {
        self.inner.peers.remove(id);
    }

    /// Remove a peer by instance, but only if it is still the one registered.
    pub fn remove_peer(&self, peer: &Peer) {
        self.inner
            .peers
            .remove_if(peer.id(), |_, registered| std::ptr::eq(registered.as_ref(), peer));
    }

    /// Local lookup only; never consults the network.
    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.inner.peers.get(id).map(|p| p.value().clone())
    }

    fn route(&self) -> Route {
        let host = self.downgrade();
        Arc::new(move |from: String, to: String, message: Value| match host.upgrade() {
            Some(inner) => {
                let host = Host::from_inner(inner);
                async move { host.send(&from, &to, message).await }.boxed()
            }
            None => future::ready(Err(BusError::Detached)).boxed(),
        })
    }

    // ── Observable state ─────────────────────────────────────────────────────

    /// Ids of local peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        sorted_keys(&self.inner.peers)
    }

    /// Urls of connected hosts, sorted.
    pub fn connections(&self) -> Vec<String> {
        sorted_keys(&self.inner.connections)
    }

    pub fn connection(&self, url: &str) -> Option<Connection> {
        self.inner.connections.get(url).map(|c| c.value().clone())
    }

    /// Snapshot of the peer address cache.
    pub fn addresses(&self) -> HashMap<String, String> {
        self.inner
            .addresses
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn url(&self) -> Option<String> {
        read(&self.inner.server).as_ref().map(|s| s.url.clone())
    }

    pub fn address(&self) -> Option<String> {
        read(&self.inner.server).as_ref().map(|s| s.address.clone())
    }

    pub fn port(&self) -> Option<u16> {
        read(&self.inner.server).as_ref().map(|s| s.port)
    }

    /// Url of the greeted connection `conn`, if it is registered.
    pub(crate) fn url_of(&self, conn: &Connection) -> Option<String> {
        self.inner
            .connections
            .iter()
            .find(|e| e.value().same(conn))
            .map(|e| e.key().clone())
    }

    /// Drop every cached address pointing at `url`.
    pub(crate) fn forget_addresses(&self, url: &str) {
        self.inner.addresses.retain(|_, cached| cached != url);
    }
}

fn sorted_keys<V>(map: &DashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
    keys.sort();
    keys
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
