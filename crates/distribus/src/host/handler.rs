//! Routes inbound requests of every host connection to the owning host.

use std::sync::Weak;

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{json, Value};

use distribus_core::{BusError, Request};

use super::{Host, HostInner};
use crate::connection::{Connection, RequestHandler};

/// Installed on every socket a host opens or accepts.
///
/// Holds the host weakly: sockets never keep a closed host alive.
pub(crate) struct HostHandler {
    host: Weak<HostInner>,
}

impl HostHandler {
    pub(crate) fn new(host: Weak<HostInner>) -> Self {
        Self { host }
    }

    fn host(&self) -> Option<Host> {
        self.host.upgrade().map(Host::from_inner)
    }
}

impl RequestHandler for HostHandler {
    fn on_request(&self, conn: &Connection, message: Value) -> BoxFuture<'static, Result<Value, BusError>> {
        let Some(host) = self.host() else {
            return future::ready(Err(BusError::Detached)).boxed();
        };
        let request = match Request::from_payload(message) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(conn = conn.id(), error = %e, "rejecting request");
                return future::ready(Err(e)).boxed();
            }
        };
        tracing::trace!(conn = conn.id(), method = request.method(), "request");

        // Everything except greeting and join completes synchronously here,
        // in frame order.
        match request {
            Request::Greeting(greeting) => {
                let conn = conn.clone();
                async move { host.on_greeting(&conn, greeting).await }.boxed()
            }
            Request::Join { url } => async move {
                host.join(&url).await?;
                Ok(Value::Null)
            }
            .boxed(),
            Request::Goodbye => {
                host.on_goodbye(conn);
                future::ready(Ok(json!("goodbye"))).boxed()
            }
            Request::Hosts { urls } => {
                for url in urls {
                    let host = host.clone();
                    tokio::spawn(async move {
                        if let Err(e) = host.join(&url).await {
                            tracing::debug!(%url, error = %e, "join from host list failed");
                        }
                    });
                }
                future::ready(Ok(json!(host.connections()))).boxed()
            }
            Request::Find { id } => {
                let url = host.get(&id).and_then(|_| host.url());
                future::ready(Ok(url.map_or(Value::Null, Value::String))).boxed()
            }
            Request::Send { from, to, message } => {
                future::ready(host.deliver(&from, &to, &message).map(|()| Value::Null)).boxed()
            }
            Request::Publish { channel, message } => {
                host.fan_out(&channel, &message);
                future::ready(Ok(json!({ "result": null, "error": null }))).boxed()
            }
            Request::Ping(params) => {
                future::ready(Ok(json!({ "result": params, "error": null }))).boxed()
            }
        }
    }

    fn on_close(&self, conn: &Connection) {
        if let Some(host) = self.host() {
            host.connection_lost(conn);
        }
    }
}
