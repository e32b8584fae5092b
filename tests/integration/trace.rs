use crate::*;

/// A chain where C only knows B: A ← B ← C. Probes from A reach C through
/// B, and C's reply must travel back along the same path.
async fn chain() -> Result<(FakeDirectory, TestNode, TestNode, TestNode)> {
    let dir = FakeDirectory::start("250,3").await;
    let a = spawn_node(node_config(vec![dir.addr.clone()], 0), Arc::new(MemoryStore::new()));
    wait_for(Duration::from_secs(5), "A registered", || dir.registered().len() == 1).await?;
    let b = spawn_node(node_config(vec![dir.addr.clone()], 0), Arc::new(MemoryStore::new()));
    wait_for(Duration::from_secs(5), "B registered", || dir.registered().len() == 2).await?;

    // C restarts as an already registered node whose only saved peer is B.
    // With a zero inbound target it never asks the directory for more.
    let b_triple = dir
        .registered()
        .into_iter()
        .find(|t| t.ends_with(&format!(",{}", b.peer_id())))
        .expect("B registered");
    let c_store = Arc::new(MemoryStore::with(epsp_node::StoredIdentity {
        peer_id: "9999".into(),
        peers: vec![b_triple],
        ..Default::default()
    }));
    let c = spawn_node(node_config(vec![dir.addr.clone()], 0), c_store);

    let (ida, idb, idc) = (a.peer_id(), b.peer_id(), c.peer_id());
    wait_for(Duration::from_secs(5), "chain links", || {
        a.linked_ids() == ids(&[&idb])
            && b.linked_ids() == ids(&[&ida, &idc])
            && c.linked_ids() == ids(&[&idb])
    })
    .await?;
    Ok((dir, a, b, c))
}

#[tokio::test]
async fn trace_probe_collects_replies_from_the_whole_chain() -> Result<()> {
    let (_dir, a, b, c) = chain().await?;
    let (ida, idb, idc) = (a.peer_id(), b.peer_id(), c.peer_id());

    let probe = Frame::new("615", 0).with_payload(format!("{ida}:nonce-1"));
    assert_eq!(a.node.publish(&probe), 1);

    wait_for(Duration::from_secs(5), "trace replies", || {
        a.inbox.with_code("635").len() == 2
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let replies = a.inbox.with_code("635");
    assert_eq!(replies.len(), 2, "each node answers once: {replies:?}");

    let from_b = replies.iter().find(|m| m.fields[2] == idb).expect("B replied");
    assert_eq!(from_b.fields[..2], [ida.clone(), "nonce-1".to_string()]);
    assert_eq!(ids(&from_b.fields[3].split(',').collect::<Vec<_>>()), ids(&[&ida, &idc]));
    assert_eq!(from_b.fields[4], "0");

    let from_c = replies.iter().find(|m| m.fields[2] == idc).expect("C replied");
    assert_eq!(from_c.fields[3], idb);
    assert_eq!(from_c.fields[4], "1");

    // Nobody else treats trace traffic as application data.
    assert!(b.inbox.messages().is_empty());
    assert!(c.inbox.messages().is_empty());

    for node in [a, b, c] {
        node.stop().await?;
    }
    Ok(())
}
