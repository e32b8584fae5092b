use crate::*;

async fn join(dir: &FakeDirectory, registered: usize) -> Result<TestNode> {
    let node = spawn_node(node_config(vec![dir.addr.clone()], 0), Arc::new(MemoryStore::new()));
    wait_for(Duration::from_secs(5), "registration", || {
        dir.registered().len() == registered
    })
    .await?;
    Ok(node)
}

/// Three nodes in a triangle: B dials A, C dials A and B.
///
/// Nodes run with a zero inbound target so no directory cycle after the
/// first asks for more peers.
async fn triangle(region_counts: &str) -> Result<(FakeDirectory, TestNode, TestNode, TestNode)> {
    let dir = FakeDirectory::start(region_counts).await;
    let a = join(&dir, 1).await?;
    let b = join(&dir, 2).await?;
    let c = join(&dir, 3).await?;

    let (ida, idb, idc) = (a.peer_id(), b.peer_id(), c.peer_id());
    wait_for(Duration::from_secs(5), "triangle links", || {
        a.linked_ids() == ids(&[&idb, &idc])
            && b.linked_ids() == ids(&[&ida, &idc])
            && c.linked_ids() == ids(&[&ida, &idb])
    })
    .await?;
    Ok((dir, a, b, c))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn signed_report_reaches_every_node_once() -> Result<()> {
    let (_dir, a, b, c) = triangle("250,3").await?;

    let sent = a.node.publish(&server_signed("551", "QUAKE,5-,0,1,Somewhere,10km,4.5,0"));
    assert_eq!(sent, 2);

    // Four writes in total: A to B and C, then one relay each from B and C.
    // B and C each keep exactly one; the other two are duplicates wherever
    // they land (A already marked the report seen when publishing).
    let duplicates = |a: &TestNode, b: &TestNode, c: &TestNode| {
        a.payload_counts().1 + b.payload_counts().1 + c.payload_counts().1
    };
    wait_for(Duration::from_secs(5), "flood to settle", || {
        b.payload_counts().0 == 1 && c.payload_counts().0 == 1 && duplicates(&a, &b, &c) == 2
    })
    .await?;
    settle().await;

    assert_eq!(a.payload_counts().0, 0);
    assert_eq!(b.payload_counts().0, 1);
    assert_eq!(c.payload_counts().0, 1);
    assert_eq!(duplicates(&a, &b, &c), 2);

    for node in [&b, &c] {
        let got = node.inbox.with_code("551");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].fields[2], "QUAKE,5-,0,1,Somewhere,10km,4.5,0");
    }
    assert!(a.inbox.messages().is_empty());

    for node in [a, b, c] {
        node.stop().await?;
    }
    Ok(())
}

#[tokio::test]
async fn frames_at_the_hop_limit_are_delivered_but_not_relayed() -> Result<()> {
    let (_dir, a, b, c) = triangle("250,1").await?;

    let frame = server_signed("551", "far travelled").with_hop(1);
    assert_eq!(a.node.publish(&frame), 2);

    wait_for(Duration::from_secs(5), "delivery", || {
        b.inbox.with_code("551").len() == 1 && c.inbox.with_code("551").len() == 1
    })
    .await?;
    settle().await;

    assert_eq!(b.payload_counts(), (1, 0));
    assert_eq!(c.payload_counts(), (1, 0));
    assert_eq!(b.inbox.with_code("551")[0].hops, 1);

    for node in [a, b, c] {
        node.stop().await?;
    }
    Ok(())
}

#[tokio::test]
async fn forged_report_is_dropped_everywhere() -> Result<()> {
    let (_dir, a, b, c) = triangle("250,3").await?;

    // Signed, but not by the server anchor.
    let expiry = format_time(&(Utc::now() + TimeDelta::days(1)));
    let signature = crypto::sign_data(&keys().peer_anchor, &expiry, "fake quake").unwrap();
    let forged = Frame::new("551", 0).with_payload(format!("{signature}:{expiry}:fake quake"));
    assert_eq!(a.node.publish(&forged), 2);

    wait_for(Duration::from_secs(5), "forged frame to arrive", || {
        b.payload_counts().0 == 1 && c.payload_counts().0 == 1
    })
    .await?;
    settle().await;

    assert!(b.inbox.messages().is_empty());
    assert!(c.inbox.messages().is_empty());
    assert_eq!(b.payload_counts(), (1, 0));
    assert_eq!(c.payload_counts(), (1, 0));

    for node in [a, b, c] {
        node.stop().await?;
    }
    Ok(())
}

#[tokio::test]
async fn outbound_peers_are_saved_on_shutdown() -> Result<()> {
    let (dir, a, b, c) = triangle("250,3").await?;
    let (ida, idb) = (a.peer_id(), b.peer_id());
    let store = c.store.clone();

    for node in [a, b, c] {
        node.stop().await?;
    }

    let saved = store.load()?.expect("identity saved");
    let saved_ids: BTreeSet<String> = saved
        .peers
        .iter()
        .filter_map(|t| t.rsplit(',').next())
        .map(str::to_string)
        .collect();
    assert_eq!(saved_ids, ids(&[&ida, &idb]));
    assert!(saved.peers.iter().all(|t| t.starts_with("127.0.0.1,")));
    assert_eq!(dir.registered().len(), 3);
    Ok(())
}
