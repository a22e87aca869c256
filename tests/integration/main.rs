//! distribus integration test harness.
//!
//! Every test builds its own hosts on 127.0.0.1 with OS-assigned ports, so
//! tests share no state and run in parallel:
//!
//!   cargo test --test integration

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use distribus::{BusError, Connection, Host, HostOptions, RequestHandler};

mod pubsub;
mod recovery;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const LOCALHOST: &str = "127.0.0.1";

/// Default ceiling for anything a test waits on.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Short timings so reconnect tests finish in well under a second.
pub fn fast_options() -> HostOptions {
    HostOptions {
        reconnect_delay: Some(Duration::from_millis(100)),
        reconnect_timeout: Some(Duration::from_secs(5)),
        request_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    }
}

/// A host listening on an OS-assigned localhost port.
pub async fn spawn_host() -> Result<Host> {
    spawn_host_with(fast_options()).await
}

pub async fn spawn_host_with(options: HostOptions) -> Result<Host> {
    let host = Host::new();
    host.config(options)?;
    host.listen(LOCALHOST, 0).await.context("listen failed")?;
    Ok(host)
}

pub fn url(host: &Host) -> String {
    host.url().expect("host should be listening")
}

/// Poll `check` until it holds, failing after `SETTLE`.
pub async fn wait_for(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SETTLE;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Wait until every host is connected to every other one.
pub async fn wait_for_mesh(hosts: &[&Host]) -> Result<()> {
    for host in hosts {
        let mut expected: Vec<String> = hosts
            .iter()
            .map(|h| url(h))
            .filter(|u| *u != url(host))
            .collect();
        expected.sort();
        wait_for(&format!("mesh at {}", url(host)), || host.connections() == expected).await?;
    }
    Ok(())
}

/// Close every host, in order.
pub async fn close_all(hosts: &[&Host]) {
    for host in hosts {
        host.close().await;
    }
}

/// Run `fut` with the harness timeout.
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(SETTLE, fut)
        .await
        .with_context(|| format!("timed out: {what}"))
}

// ── Raw endpoints ─────────────────────────────────────────────────────────────

/// Connect a bare socket to `url`. Inbound requests on it are refused.
pub async fn raw_connect(url: &str) -> Result<Connection> {
    Ok(Connection::connect(url, Arc::new(distribus::Unhandled), SETTLE).await?)
}

/// How a [`StubHost`] deviates from its plain answers.
#[derive(Clone, Default)]
pub struct StubBehavior {
    /// Stall each WebSocket handshake this long after the TCP accept.
    pub handshake_delay: Duration,
    /// Fail every `send` with an error other than "peer not found".
    pub refuse_send: bool,
}

/// Answers a greeting like a host with no network id, a find with its own
/// url, and everything else with null.
pub struct Stub {
    url: String,
    behavior: StubBehavior,
    finds: Arc<AtomicUsize>,
}

impl RequestHandler for Stub {
    fn on_request(&self, _: &Connection, message: Value) -> BoxFuture<'static, Result<Value, BusError>> {
        match message["method"].as_str() {
            Some("greeting") => future::ready(Ok(json!({ "networkId": null }))).boxed(),
            Some("find") => {
                self.finds.fetch_add(1, Ordering::SeqCst);
                future::ready(Ok(json!(self.url))).boxed()
            }
            Some("send") if self.behavior.refuse_send => {
                future::ready(Err(BusError::Remote("mailbox full".into()))).boxed()
            }
            _ => future::ready(Ok(Value::Null)).boxed(),
        }
    }
}

/// Something that looks like a host at `url` but can disappear without a
/// goodbye.
pub struct StubHost {
    pub url: String,
    pub port: u16,
    finds: Arc<AtomicUsize>,
    dials: Arc<AtomicUsize>,
    task: JoinHandle<()>,
    accepted: mpsc::UnboundedReceiver<Connection>,
}

impl StubHost {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_on(0, StubBehavior::default()).await
    }

    pub async fn spawn_on(port: u16, behavior: StubBehavior) -> Result<Self> {
        let listener = TcpListener::bind((LOCALHOST, port)).await?;
        let port = listener.local_addr()?.port();
        let url = format!("ws://{LOCALHOST}:{port}");
        let finds = Arc::new(AtomicUsize::new(0));
        let dials = Arc::new(AtomicUsize::new(0));
        let (tx, accepted) = mpsc::unbounded_channel();
        let stub_url = url.clone();
        let stub_finds = finds.clone();
        let stub_dials = dials.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                stub_dials.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(behavior.handshake_delay).await;
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let handler = Arc::new(Stub {
                    url: stub_url.clone(),
                    behavior: behavior.clone(),
                    finds: stub_finds.clone(),
                });
                if tx.send(Connection::open(ws, handler, SETTLE)).is_err() {
                    break;
                }
            }
        });
        Ok(Self {
            url,
            port,
            finds,
            dials,
            task,
            accepted,
        })
    }

    /// Number of `find` requests answered so far.
    pub fn find_requests(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    /// Number of TCP connections accepted so far, handshaken or not.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Stop listening and drop every accepted socket.
    pub async fn vanish(mut self) {
        self.task.abort();
        let _ = self.task.await;
        while let Ok(conn) = self.accepted.try_recv() {
            conn.close();
        }
    }
}
