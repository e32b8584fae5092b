use crate::*;

use epsp_node::{NodeError, SigningKey, StoredIdentity};
use epsp_core::RegionCounts;

fn codes(session: &[String]) -> Vec<String> {
    session.iter().map(|l| l.chars().take(3).collect()).collect()
}

async fn first_session_closed(dir: &FakeDirectory) -> Result<Vec<String>> {
    wait_for(Duration::from_secs(5), "first directory session to close", || {
        dir.sessions()
            .first()
            .is_some_and(|s| s.last().is_some_and(|l| l.starts_with("119")))
    })
    .await?;
    Ok(dir.sessions()[0].clone())
}

#[tokio::test]
async fn fresh_node_registers_and_persists() -> Result<()> {
    let dir = FakeDirectory::start("250,3;270,4").await;
    let store = Arc::new(MemoryStore::new());
    let n = spawn_node(node_config(vec![dir.addr.clone()], 1), store.clone());

    let session = first_session_closed(&dir).await?;
    assert_eq!(
        codes(&session),
        ["131", "113", "114", "115", "116", "117", "127", "118", "119"]
    );

    let id = n.peer_id();
    assert_eq!(id, "1001");
    assert!(session[2].starts_with(&format!("114 1 {id}:")), "{}", session[2]);
    assert!(session[4].starts_with(&format!("116 1 {id}:")), "{}", session[4]);
    // Reachable, so the configured target is registered.
    assert!(session[4].ends_with(":250:0:1"), "{}", session[4]);

    let registered = dir.registered();
    assert_eq!(registered.len(), 1);
    assert!(registered[0].ends_with(&format!(",{id}")));

    let snapshot = n.node.snapshot();
    assert!(snapshot.registered);
    assert!(snapshot.reachable);
    assert_eq!(snapshot.swarm_size, 7);
    assert!(snapshot.clock_skew_ms.is_some());
    assert!(snapshot.key_expiry.is_some());

    n.stop().await?;
    let saved = store.load()?.expect("identity saved");
    assert_eq!(saved.peer_id, "1001");
    assert_eq!(saved.key.as_ref().map(|k| k.secret.as_str()), Some("c2VjcmV0"));
    assert_eq!(saved.region_counts.total(), 7);
    Ok(())
}

#[tokio::test]
async fn restored_identity_echoes_instead_of_registering() -> Result<()> {
    let dir = FakeDirectory::start("250,5").await;
    let expiry = format_time(&(Utc::now() + TimeDelta::hours(6)).with_timezone(&protocol_zone()));
    let key = SigningKey::from_reply(&format!("c2Vj:cHVi:{expiry}:c2ln")).unwrap();
    let store = Arc::new(MemoryStore::with(StoredIdentity {
        peer_id: "4242".into(),
        key: Some(key),
        reachable: true,
        region_counts: RegionCounts::parse("250,5"),
        peers: Vec::new(),
    }));
    let n = spawn_node(node_config(vec![dir.addr.clone()], 1), store);

    let session = first_session_closed(&dir).await?;
    // Key is fresh, so no key request; no temporary ID, no port check.
    assert_eq!(codes(&session), ["131", "123", "115", "119"]);
    assert_eq!(session[1], "123 1 4242:0");
    assert_eq!(session[2], "115 1 4242");
    assert!(dir.registered().is_empty());
    assert_eq!(n.peer_id(), "4242");

    n.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unreachable_directories_stop_the_node() -> Result<()> {
    // Two ports nothing listens on.
    let mut servers = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        servers.push(listener.local_addr()?.to_string());
    }

    let inbox = Arc::new(Inbox::default());
    let node = Node::new(
        node_config(servers, 1),
        Arc::new(MemoryStore::new()),
        inbox.clone(),
    )?;

    let outcome = tokio::time::timeout(Duration::from_secs(10), node.run(CancellationToken::new()))
        .await
        .expect("node kept running without any directory");
    assert!(matches!(outcome, Err(NodeError::DirectoryUnavailable)));

    // The relay channel is consumed by the first run.
    let again = node.run(CancellationToken::new()).await;
    assert!(matches!(again, Err(NodeError::AlreadyRunning)));
    Ok(())
}

#[tokio::test]
async fn empty_server_list_is_rejected() {
    let result = Node::new(
        node_config(Vec::new(), 1),
        Arc::new(MemoryStore::new()),
        Arc::new(Inbox::default()),
    );
    assert!(matches!(result, Err(NodeError::NoServers)));
}
