//! Mesh membership: listening, joining, greeting, goodbye and shutdown.
//!
//! A host joins another by dialing its url and sending a greeting carrying
//! its own url and network id. The accepting side registers the socket under
//! the greeter's url and asks every other connected host to join the
//! newcomer, so the mesh converges to a complete graph.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use futures::future;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;

use distribus_core::rpc::{Greeting, Welcome};
use distribus_core::{BusError, Request};

use super::{read, write, Host, HostHandler, HostInner, Listening};
use crate::connection::Connection;

impl Host {
    /// Start accepting connections on `address:port` and return this host's
    /// url. Port 0 lets the OS pick; the url carries the actual port.
    pub async fn listen(&self, address: &str, port: u16) -> Result<String, BusError> {
        if read(&self.inner.server).is_some() {
            return Err(BusError::AlreadyListening);
        }

        let listener = TcpListener::bind((address, port)).await?;
        let port = listener.local_addr()?.port();
        let url = format!("ws://{address}:{port}");
        let accept = tokio::spawn(accept_loop(listener, self.downgrade(), self.epoch())).abort_handle();

        {
            let mut server = write(&self.inner.server);
            if server.is_some() {
                accept.abort();
                return Err(BusError::AlreadyListening);
            }
            *server = Some(Listening {
                address: address.to_string(),
                port,
                url: url.clone(),
                accept,
            });
        }

        tracing::info!(%url, "listening");
        Ok(url)
    }

    /// Connect to the host at `url`.
    ///
    /// Resolves once the greeting was accepted, the connection registered and
    /// the other connected hosts told to join `url` as well. Joining our own
    /// url or an already connected one is a no-op.
    pub async fn join(&self, url: &str) -> Result<(), BusError> {
        if url.is_empty()
            || self.url().as_deref() == Some(url)
            || self.inner.connections.contains_key(url)
        {
            return Ok(());
        }
        let epoch = self.epoch();

        let conn = Connection::connect(url, self.handler(), self.settings().request_timeout).await?;
        self.track(&conn);

        let greeting = Request::Greeting(Greeting {
            url: self.url(),
            network_id: self.network_id(),
        });
        let welcome = match conn.request(greeting.to_payload()).await {
            Ok(reply) => reply,
            Err(e) => {
                conn.close();
                tracing::warn!(%url, error = %e, "greeting rejected");
                return Err(match e {
                    // The remote reports from its own point of view.
                    BusError::NetworkIdMismatch { local, remote } => {
                        BusError::NetworkIdMismatch { local: remote, remote: local }
                    }
                    other => other,
                });
            }
        };

        let welcome: Welcome = serde_json::from_value(welcome).unwrap_or_default();
        if let Err(e) = self.adopt_network_id(welcome.network_id.as_deref()) {
            conn.close();
            tracing::warn!(%url, error = %e, "welcome rejected");
            return Err(e);
        }

        conn.set_remote_url(url);
        self.inner.connections.insert(url.to_string(), conn.clone());
        // Checked after the insert: a concurrent close() bumps the epoch
        // before draining the table.
        if conn.is_closed() || self.epoch() != epoch {
            self.inner.connections.remove_if(url, |_, c| c.same(&conn));
            conn.close();
            tracing::debug!(%url, "host closed while joining");
            return Err(BusError::ConnectionClosed);
        }
        self.cancel_reconnect(url);
        tracing::info!(%url, "joined host");

        self.broadcast_join(url).await;
        Ok(())
    }

    /// Say goodbye to every connected host, close every socket and stop
    /// listening. Pending reconnects are cancelled. Never fails.
    pub async fn close(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.reconnects.clear();

        let urls: Vec<String> = self.inner.connections.iter().map(|e| e.key().clone()).collect();
        let closing: Vec<(String, Connection)> = urls
            .into_iter()
            .filter_map(|url| self.inner.connections.remove(&url))
            .collect();

        let goodbye = Request::Goodbye.to_payload();
        future::join_all(closing.into_iter().map(|(url, conn)| {
            let goodbye = goodbye.clone();
            async move {
                if let Err(e) = conn.request(goodbye).await {
                    tracing::debug!(%url, error = %e, "goodbye failed");
                }
                conn.close();
            }
        }))
        .await;

        let sockets: Vec<Connection> = self.inner.sockets.iter().map(|e| e.value().clone()).collect();
        for conn in sockets {
            conn.close();
        }
        self.inner.sockets.clear();

        let server = write(&self.inner.server).take();
        if let Some(server) = server {
            server.accept.abort();
            tracing::info!(url = %server.url, "stopped listening");
        }
        self.inner.addresses.clear();
    }

    /// Accepting side of a join.
    pub(crate) async fn on_greeting(&self, conn: &Connection, greeting: Greeting) -> Result<Value, BusError> {
        if let Err(e) = self.adopt_network_id(greeting.network_id.as_deref()) {
            tracing::warn!(url = ?greeting.url, error = %e, "rejecting greeting");
            return Err(e);
        }

        if let Some(url) = greeting.url.filter(|url| !url.is_empty()) {
            conn.set_remote_url(&url);
            let registered = match self.inner.connections.entry(url.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(conn.clone());
                    true
                }
            };
            if registered {
                self.cancel_reconnect(&url);
                tracing::info!(%url, "host joined");
                self.broadcast_join(&url).await;
            }
        }

        let welcome = Welcome { network_id: self.network_id() };
        Ok(serde_json::to_value(welcome)?)
    }

    /// Ask every connected host except `url` itself to join `url`.
    pub(crate) async fn broadcast_join(&self, url: &str) {
        let others: Vec<(String, Connection)> = self
            .inner
            .connections
            .iter()
            .filter(|e| e.key() != url)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if others.is_empty() {
            return;
        }

        let request = Request::Join { url: url.to_string() }.to_payload();
        future::join_all(others.into_iter().map(|(other, conn)| {
            let request = request.clone();
            async move {
                if let Err(e) = conn.request(request).await {
                    tracing::debug!(url = %other, error = %e, "join broadcast failed");
                }
            }
        }))
        .await;
    }

    /// The remote host is leaving on purpose: forget it without reconnecting.
    pub(crate) fn on_goodbye(&self, conn: &Connection) {
        let Some(url) = self.url_of(conn).or_else(|| conn.remote_url()) else {
            return;
        };
        self.forget_addresses(&url);
        self.cancel_reconnect(&url);
        self.inner.connections.remove(&url);
        tracing::info!(%url, "host left");
    }

    /// A socket closed. Registered connections that did not say goodbye are
    /// scheduled for reconnection.
    pub(crate) fn connection_lost(&self, conn: &Connection) {
        self.inner.sockets.remove(&conn.id());

        let Some(url) = self.url_of(conn) else {
            return;
        };
        if self.inner.connections.remove_if(&url, |_, c| c.same(conn)).is_none() {
            return;
        }
        tracing::info!(%url, "connection lost");
        self.schedule_reconnect(url);
    }

    fn handler(&self) -> Arc<HostHandler> {
        Arc::new(HostHandler::new(self.downgrade()))
    }

    /// Wrap an accepted socket.
    pub(crate) fn attach<S>(&self, ws: WebSocketStream<S>) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = Connection::open(ws, self.handler(), self.settings().request_timeout);
        self.track(&conn);
        conn
    }

    fn track(&self, conn: &Connection) {
        self.inner.sockets.insert(conn.id(), conn.clone());
        // The reader may already have seen the socket close.
        if conn.is_closed() {
            self.inner.sockets.remove(&conn.id());
        }
    }
}

async fn accept_loop(listener: TcpListener, host: Weak<HostInner>, epoch: u64) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let host = host.clone();
        tokio::spawn(async move {
            let ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::debug!(%remote, error = %e, "websocket handshake failed");
                    return;
                }
            };
            let Some(host) = host.upgrade().map(Host::from_inner) else {
                return;
            };
            // The handshake may finish after the host was closed.
            if host.epoch() != epoch {
                tracing::debug!(%remote, "dropping socket accepted before close");
                return;
            }
            let conn = host.attach(ws);
            tracing::debug!(conn = conn.id(), %remote, "accepted connection");
        });
    }
}
