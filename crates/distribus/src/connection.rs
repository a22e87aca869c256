//! Request/response channel over a WebSocket.
//!
//! A [`Connection`] owns two tasks: a writer draining an unbounded queue into
//! the socket sink, and a reader decoding envelopes. Outgoing requests are
//! correlated with their responses through a pending table keyed by a fresh
//! uuid; inbound requests and notifications go to a [`RequestHandler`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use distribus_core::{BusError, Envelope, EnvelopeKind};

/// Default time a request waits for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receives inbound requests and notifications of a connection.
///
/// `on_request` is called inline on the connection's reader task, so any
/// work done before the returned future is first polled happens in frame
/// order. The future is then driven on its own task; for notifications its
/// output is discarded.
pub trait RequestHandler: Send + Sync + 'static {
    fn on_request(&self, conn: &Connection, message: Value)
        -> BoxFuture<'static, Result<Value, BusError>>;

    /// Called once when the socket has closed, for whatever reason.
    fn on_close(&self, _conn: &Connection) {}
}

/// Handler for sockets nobody listens on: every request fails.
pub struct Unhandled;

impl RequestHandler for Unhandled {
    fn on_request(&self, _: &Connection, _: Value) -> BoxFuture<'static, Result<Value, BusError>> {
        future::ready(Err(BusError::NoHandler)).boxed()
    }
}

type Pending = DashMap<String, oneshot::Sender<Result<Value, BusError>>>;

enum Outbound {
    Frame(String, Option<oneshot::Sender<()>>),
    Close,
}

struct Inner {
    id: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Pending,
    closed: AtomicBool,
    request_timeout: Duration,
    remote_url: RwLock<Option<String>>,
}

/// Cheap, cloneable handle to one socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_url", &self.remote_url())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Dial `url` and wrap the resulting socket.
    ///
    /// The TCP connect and WebSocket handshake together must finish within
    /// `request_timeout`, otherwise this fails with [`BusError::Timeout`].
    pub async fn connect(
        url: &str,
        handler: Arc<dyn RequestHandler>,
        request_timeout: Duration,
    ) -> Result<Self, BusError> {
        let (ws, _) = tokio::time::timeout(request_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| {
                tracing::debug!(%url, "websocket handshake timed out");
                BusError::Timeout
            })?
            .map_err(|e| BusError::Transport(format!("failed to connect to {url}: {e}")))?;
        Ok(Self::open(ws, handler, request_timeout))
    }

    /// Wrap an already open socket and start its reader and writer tasks.
    pub fn open<S>(
        ws: WebSocketStream<S>,
        handler: Arc<dyn RequestHandler>,
        request_timeout: Duration,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        let conn = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                outbound: tx,
                pending: DashMap::new(),
                closed: AtomicBool::new(false),
                request_timeout,
                remote_url: RwLock::new(None),
            }),
        };

        let id = conn.id();
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outbound::Frame(text, ack) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            tracing::debug!(conn = id, error = %e, "socket write failed");
                            break;
                        }
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader.handle_frame(&text, &handler),
                    Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                        Ok(text) => reader.handle_frame(text, &handler),
                        Err(_) => tracing::debug!(conn = reader.id(), "dropping non-utf8 frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(conn = reader.id(), error = %e, "socket read failed");
                        break;
                    }
                }
            }
            reader.shutdown();
            handler.on_close(&reader);
        });

        conn
    }

    /// Process-unique id of this connection, used in logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// True if both handles refer to the same socket.
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Url of the host on the other side, once known from a greeting or join.
    pub fn remote_url(&self) -> Option<String> {
        self.inner
            .remote_url
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_remote_url(&self, url: impl Into<String>) {
        *self
            .inner
            .remote_url
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(url.into());
    }

    /// Send a request and wait for the correlated response.
    pub async fn request(&self, message: Value) -> Result<Value, BusError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: &id,
        };
        if self.is_closed() {
            return Err(BusError::ConnectionClosed);
        }

        let frame = Envelope::request(id.as_str(), message).encode()?;
        self.push(Outbound::Frame(frame, None))?;

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::ConnectionClosed),
            Err(_) => {
                tracing::debug!(conn = self.id(), request = %id, "request timed out");
                Err(BusError::Timeout)
            }
        }
    }

    /// Send a notification. Resolves once the frame has been written.
    pub async fn notify(&self, message: Value) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::ConnectionClosed);
        }
        let frame = Envelope::notification(message).encode()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.push(Outbound::Frame(frame, Some(ack_tx)))?;
        ack_rx.await.map_err(|_| BusError::ConnectionClosed)
    }

    /// Close the socket. The handler's `on_close` fires once the reader ends.
    pub fn close(&self) {
        let _ = self.inner.outbound.send(Outbound::Close);
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    fn push(&self, out: Outbound) -> Result<(), BusError> {
        self.inner
            .outbound
            .send(out)
            .map_err(|_| BusError::ConnectionClosed)
    }

    fn handle_frame(&self, text: &str, handler: &Arc<dyn RequestHandler>) {
        let envelope = match Envelope::decode(text) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(conn = self.id(), error = %e, "dropping undecodable frame");
                return;
            }
        };

        if let Some(id) = &envelope.id {
            if let Some((_, tx)) = self.inner.pending.remove(id) {
                let result = envelope.into_result().map_err(BusError::from_remote);
                let _ = tx.send(result);
                return;
            }
        }

        match envelope.kind() {
            EnvelopeKind::Response => {
                tracing::trace!(conn = self.id(), id = ?envelope.id, "dropping late response");
            }
            EnvelopeKind::Request => {
                let id = envelope.id.unwrap_or_default();
                let work = self.dispatch(handler, envelope.message);
                let conn = self.clone();
                tokio::spawn(async move {
                    let result = work.await.map_err(|e| e.to_string());
                    let frame = match Envelope::response(id, result).encode() {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(conn = conn.id(), error = %e, "failed to encode response");
                            return;
                        }
                    };
                    if conn.push(Outbound::Frame(frame, None)).is_err() {
                        tracing::debug!(conn = conn.id(), "connection closed before response");
                    }
                });
            }
            EnvelopeKind::Notification => {
                let work = self.dispatch(handler, envelope.message);
                tokio::spawn(async move {
                    let _ = work.await;
                });
            }
        }
    }

    /// Run the handler, turning panics into error responses.
    fn dispatch(
        &self,
        handler: &Arc<dyn RequestHandler>,
        message: Value,
    ) -> BoxFuture<'static, Result<Value, BusError>> {
        let started =
            std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_request(self, message)));
        match started {
            Ok(work) => AssertUnwindSafe(work)
                .catch_unwind()
                .map(|r| r.unwrap_or_else(|_| Err(handler_panicked())))
                .boxed(),
            Err(_) => future::ready(Err(handler_panicked())).boxed(),
        }
    }

    fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the senders fails every outstanding request.
        self.inner.pending.clear();
        let _ = self.inner.outbound.send(Outbound::Close);
    }
}

fn handler_panicked() -> BusError {
    BusError::Remote("request handler panicked".to_string())
}

/// Removes a pending entry when its request future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}
