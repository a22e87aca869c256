use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Recovery — reconnecting after connections drop without a goodbye
// ══════════════════════════════════════════════════════════════════════════════

/// Both sides notice the drop and the link comes back on its own. Cached
/// addresses survive the outage.
#[tokio::test]
async fn test_dropped_connection_is_reestablished() -> Result<()> {
    let a = spawn_host().await?;
    let b = spawn_host().await?;
    a.join(&url(&b)).await?;

    let b_url = url(&b);
    let a_url = url(&a);
    b.create("peer2")?;
    assert_eq!(a.find("peer2").await?, Some(b_url.clone()));

    let old = a.connection(&b_url).context("a should be connected to b")?;
    old.close();

    wait_for("a to notice the drop", || a.connection(&b_url).map_or(true, |c| !c.same(&old))).await?;
    assert_eq!(a.addresses().get("peer2"), Some(&b_url));

    wait_for("a to reconnect to b", || {
        a.connection(&b_url).is_some_and(|c| !c.same(&old))
    })
    .await?;
    wait_for("b to see a again", || b.connections() == vec![a_url.clone()]).await?;
    wait_for("timers to settle", || {
        a.reconnecting().is_empty() && b.reconnecting().is_empty()
    })
    .await?;

    assert_eq!(a.addresses().get("peer2"), Some(&b_url));
    a.create("peer1")?.send("peer2", json!("still there?")).await?;

    close_all(&[&a, &b]).await;
    Ok(())
}

/// With a first delay longer than the timeout, nobody even tries.
#[tokio::test]
async fn test_no_reconnect_when_delay_exceeds_timeout() -> Result<()> {
    let slow = HostOptions {
        reconnect_delay: Some(Duration::from_millis(400)),
        reconnect_timeout: Some(Duration::from_millis(100)),
        ..fast_options()
    };
    let a = spawn_host_with(slow.clone()).await?;
    let b = spawn_host_with(slow).await?;
    a.join(&url(&b)).await?;
    b.create("peer2")?;
    a.find("peer2").await?;

    a.connection(&url(&b)).context("a should be connected to b")?.close();
    wait_for("a to schedule a reconnect", || !a.reconnecting().is_empty()).await?;
    assert!(a.connections().is_empty());

    wait_for("timers to clear", || {
        a.reconnecting().is_empty() && b.reconnecting().is_empty()
    })
    .await?;
    assert!(a.connections().is_empty());
    assert!(b.connections().is_empty());
    assert!(a.addresses().is_empty());

    close_all(&[&a, &b]).await;
    Ok(())
}

/// Attempts keep failing until something answers on the url again.
#[tokio::test]
async fn test_reconnect_retries_until_host_returns() -> Result<()> {
    let a = spawn_host().await?;
    let stub = StubHost::spawn().await?;
    let stub_url = stub.url.clone();
    let port = stub.port;

    a.join(&stub_url).await?;
    assert_eq!(a.connections(), vec![stub_url.clone()]);

    stub.vanish().await;
    wait_for("a to notice the drop", || a.reconnecting() == vec![stub_url.clone()]).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.connections().is_empty());

    let b = Host::new();
    b.config(fast_options())?;
    b.listen(LOCALHOST, port).await?;

    wait_for("a to reach the new host", || a.connections() == vec![stub_url.clone()]).await?;
    wait_for("b to register a", || b.connections() == vec![url(&a)]).await?;
    assert!(a.reconnecting().is_empty());

    close_all(&[&a, &b]).await;
    Ok(())
}

/// Past the reconnect timeout the url and its cached addresses are dropped.
#[tokio::test]
async fn test_reconnect_gives_up_after_timeout() -> Result<()> {
    let a = spawn_host_with(HostOptions {
        reconnect_delay: Some(Duration::from_millis(50)),
        reconnect_timeout: Some(Duration::from_millis(300)),
        ..fast_options()
    })
    .await?;
    let stub = StubHost::spawn().await?;
    let stub_url = stub.url.clone();

    a.join(&stub_url).await?;
    assert_eq!(a.find("ghost").await?, Some(stub_url.clone()));

    stub.vanish().await;
    wait_for("a to schedule a reconnect", || !a.reconnecting().is_empty()).await?;
    wait_for("a to give up", || a.reconnecting().is_empty()).await?;

    assert!(a.connections().is_empty());
    assert!(a.addresses().is_empty());

    a.close().await;
    Ok(())
}

/// Closing a host cancels its pending reconnects.
#[tokio::test]
async fn test_close_cancels_reconnects() -> Result<()> {
    let a = spawn_host().await?;
    let stub = StubHost::spawn().await?;
    a.join(&stub.url).await?;

    stub.vanish().await;
    wait_for("a to schedule a reconnect", || !a.reconnecting().is_empty()).await?;

    a.close().await;
    assert!(a.reconnecting().is_empty());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.connections().is_empty());
    Ok(())
}

/// A reconnect that is still dialing when the host closes must not register
/// the connection once the handshake completes.
#[tokio::test]
async fn test_close_during_reconnect_handshake() -> Result<()> {
    let a = spawn_host().await?;
    let stub = StubHost::spawn().await?;
    let stub_url = stub.url.clone();
    let port = stub.port;
    a.join(&stub_url).await?;

    stub.vanish().await;
    wait_for("a to schedule a reconnect", || !a.reconnecting().is_empty()).await?;

    let handshake_delay = Duration::from_millis(400);
    let slow = StubHost::spawn_on(
        port,
        StubBehavior {
            handshake_delay,
            ..Default::default()
        },
    )
    .await?;
    wait_for("a reconnect attempt to dial", || slow.dials() > 0).await?;

    a.close().await;
    assert!(a.connections().is_empty());

    tokio::time::sleep(handshake_delay * 2).await;
    assert!(a.connections().is_empty(), "joined after close: {:?}", a.connections());
    assert!(a.reconnecting().is_empty());
    assert_eq!(a.url(), None);

    slow.vanish().await;
    Ok(())
}
