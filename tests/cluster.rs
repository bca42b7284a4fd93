//! End-to-end cluster scenarios over localhost TCP, with every daemon
//! running in-process on ephemeral ports.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};
use viewkv::{KvClient, KvReplica, View, ViewAuthority, ViewKvError};

/// Handle to one spawned daemon; sending (or dropping) the termination
/// signal kills it, which releases its port and stops its heartbeats.
struct Daemon {
    term: watch::Sender<bool>,
}

impl Daemon {
    fn kill(&self) {
        let _ = self.term.send(true);
    }
}

async fn start_authority_at(
    bind_addr: SocketAddr,
) -> Result<(SocketAddr, Daemon), ViewKvError> {
    let mut authority = ViewAuthority::new_and_setup(bind_addr, None).await?;
    let addr = authority.local_addr();
    let (term, rx_term) = watch::channel(false);
    tokio::spawn(async move { authority.run(rx_term).await });
    Ok((addr, Daemon { term }))
}

async fn start_authority() -> Result<(SocketAddr, Daemon), ViewKvError> {
    start_authority_at("127.0.0.1:0".parse()?).await
}

async fn start_replica(
    authority: SocketAddr,
) -> Result<(String, Daemon), ViewKvError> {
    let mut replica =
        KvReplica::new_and_setup("127.0.0.1:0".parse()?, authority, None)
            .await?;
    let name = replica.name().to_string();
    let (term, rx_term) = watch::channel(false);
    tokio::spawn(async move { replica.run(rx_term).await });
    Ok((name, Daemon { term }))
}

/// Polls the authority until the view satisfies the predicate, failing the
/// test if it does not within the deadline.
async fn await_view(
    client: &mut KvClient,
    within: Duration,
    pred: impl Fn(&View) -> bool,
) -> Result<View, ViewKvError> {
    let deadline = Instant::now() + within;
    loop {
        let view = client.view().await?;
        if pred(&view) {
            return Ok(view);
        }
        if Instant::now() >= deadline {
            return Err(ViewKvError::msg(format!(
                "view predicate unmet within {:?}, last view {}",
                within, view
            )));
        }
        time::sleep(Duration::from_millis(100)).await;
    }
}

/// Polls a replica's diagnostics dump until it has learned the given role.
/// Writes relayed to a backup that does not yet consider itself one are
/// dropped by protocol, so tests settle roles before writing.
async fn await_role(
    client: &mut KvClient,
    server: &str,
    within: Duration,
    role: viewkv::Role,
) -> Result<(), ViewKvError> {
    let deadline = Instant::now() + within;
    loop {
        if let Ok(dump) = client.dump_of(server).await {
            if dump.role == role {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(ViewKvError::msg(format!(
                "'{}' did not learn role {:?} within {:?}",
                server, role, within
            )));
        }
        time::sleep(Duration::from_millis(100)).await;
    }
}

/// Polls a replica's diagnostics dump until its store equals the expected
/// contents.
async fn await_store(
    client: &mut KvClient,
    server: &str,
    within: Duration,
    expected: &HashMap<String, String>,
) -> Result<(), ViewKvError> {
    let deadline = Instant::now() + within;
    loop {
        if let Ok(dump) = client.dump_of(server).await {
            if &dump.store == expected {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(ViewKvError::msg(format!(
                "store of '{}' did not reach expected contents within {:?}",
                server, within
            )));
        }
        time::sleep(Duration::from_millis(100)).await;
    }
}

fn map_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

const WITHIN: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_trip_single_replica() -> Result<(), ViewKvError> {
    let (authority, _va) = start_authority().await?;
    let (r1, _r1d) = start_replica(authority).await?;
    let mut client = KvClient::new_and_setup(authority, None).await?;

    let view = await_view(&mut client, WITHIN, |v| v.primary_is(&r1)).await?;
    assert_eq!(view.number, 1);
    assert!(view.backup.is_none());

    assert_eq!(client.get("a").await?, None);
    client.put("a", "1").await?;
    assert_eq!(client.get("a").await?, Some("1".into()));
    client.put("a", "2").await?;
    assert_eq!(client.get("a").await?, Some("2".into()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_failover_chain() -> Result<(), ViewKvError> {
    let (authority, _va) = start_authority().await?;
    let mut client = KvClient::new_and_setup(authority, None).await?;

    // R1 alone becomes primary of view 1 and serves writes
    let (r1, r1d) = start_replica(authority).await?;
    let view = await_view(&mut client, WITHIN, |v| v.primary_is(&r1)).await?;
    assert_eq!(view.number, 1);
    client.put("a", "1").await?;
    assert_eq!(client.get("a").await?, Some("1".into()));

    // R2 joins as backup of view 2; its store catches up through the
    // transfer and subsequent forwarded writes
    let (r2, r2d) = start_replica(authority).await?;
    let view = await_view(&mut client, WITHIN, |v| v.backup_is(&r2)).await?;
    assert_eq!(view.number, 2);
    assert!(view.primary_is(&r1));
    await_role(&mut client, &r2, WITHIN, viewkv::Role::Backup).await?;
    client.put("b", "2").await?;
    await_store(
        &mut client,
        &r2,
        WITHIN,
        &map_of(&[("a", "1"), ("b", "2")]),
    )
    .await?;

    // killing R1 promotes R2, with no data lost
    r1d.kill();
    let view = await_view(&mut client, WITHIN, |v| v.primary_is(&r2)).await?;
    assert_eq!(view.number, 3);
    assert!(view.backup.is_none());
    assert_eq!(client.get("a").await?, Some("1".into()));
    assert_eq!(client.get("b").await?, Some("2".into()));

    // R3 joins as backup of view 4 and receives the full store
    let (r3, _r3d) = start_replica(authority).await?;
    let view = await_view(&mut client, WITHIN, |v| v.backup_is(&r3)).await?;
    assert_eq!(view.number, 4);
    assert!(view.primary_is(&r2));
    await_store(
        &mut client,
        &r3,
        WITHIN,
        &map_of(&[("a", "1"), ("b", "2")]),
    )
    .await?;

    // killing R2 promotes R3, still with no data lost
    r2d.kill();
    let view = await_view(&mut client, WITHIN, |v| v.primary_is(&r3)).await?;
    assert_eq!(view.number, 5);
    assert_eq!(client.get("a").await?, Some("1".into()));
    assert_eq!(client.get("b").await?, Some("2".into()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replica_starts_before_authority() -> Result<(), ViewKvError> {
    // reserve an address for the authority without holding it
    let probe = TcpListener::bind("127.0.0.1:0").await?;
    let authority = probe.local_addr()?;
    drop(probe);

    // the replica comes up first and keeps dialing
    let (r1, _r1d) = start_replica(authority).await?;
    time::sleep(Duration::from_secs(1)).await;

    let (_, _va) = start_authority_at(authority).await?;
    let mut client = KvClient::new_and_setup(authority, None).await?;
    await_view(&mut client, Duration::from_secs(10), |v| v.primary_is(&r1))
        .await?;
    client.put("k", "v").await?;
    assert_eq!(client.get("k").await?, Some("v".into()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sole_replica_death_leaves_service_unavailable(
) -> Result<(), ViewKvError> {
    let (authority, _va) = start_authority().await?;
    let (r1, r1d) = start_replica(authority).await?;

    let mut client =
        KvClient::new_and_setup(authority, Some("op_timeout_ms = 2000"))
            .await?;
    await_view(&mut client, WITHIN, |v| v.primary_is(&r1)).await?;
    client.put("a", "1").await?;

    // with the only replica gone the authority stays up but no operation
    // can complete
    r1d.kill();
    let view = await_view(&mut client, WITHIN, |v| v.primary.is_none()).await?;
    assert_eq!(view.number, 2);
    assert!(client.get("a").await.is_err());

    // a fresh replica takes over as primary of the next view, with an
    // empty store since nothing survived
    let (r2, _r2d) = start_replica(authority).await?;
    let view = await_view(&mut client, WITHIN, |v| v.primary_is(&r2)).await?;
    assert_eq!(view.number, 3);
    assert_eq!(client.get("a").await?, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dump_reflects_roles() -> Result<(), ViewKvError> {
    let (authority, _va) = start_authority().await?;
    let mut client = KvClient::new_and_setup(authority, None).await?;

    let (r1, _r1d) = start_replica(authority).await?;
    await_view(&mut client, WITHIN, |v| v.primary_is(&r1)).await?;
    let (r2, _r2d) = start_replica(authority).await?;
    await_view(&mut client, WITHIN, |v| v.backup_is(&r2)).await?;
    await_role(&mut client, &r2, WITHIN, viewkv::Role::Backup).await?;

    client.put("x", "y").await?;
    await_store(&mut client, &r2, WITHIN, &map_of(&[("x", "y")])).await?;

    let dump = client.dump().await?;
    assert_eq!(dump.role, viewkv::Role::Primary);
    assert!(dump.view.primary_is(&r1));
    let dump = client.dump_of(&r2).await?;
    assert_eq!(dump.role, viewkv::Role::Backup);
    Ok(())
}
