use cairn_core::wire::StoreRequest;
use cairn_core::{Chunk, Message};

use crate::*;

/// A stored chunk is pushed to connected neighbours.
#[tokio::test]
async fn store_pushes_to_neighbours() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let c = TestNode::new(3);
    connect(&a, &b).await;
    connect(&a, &c).await;

    let chunk = Chunk::leaf(b"spread me");
    a.store.store(chunk.clone()).unwrap();

    wait_for("neighbours to receive the chunk", || {
        b.store.local().contains(&chunk.key) && c.store.local().contains(&chunk.key)
    })
    .await
    .unwrap();
}

/// A pushed chunk is never sent back to the node it came from.
#[tokio::test]
async fn pushed_chunk_is_not_echoed() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    connect(&a, &b).await;

    let chunk = Chunk::leaf(b"one way");
    a.store.store(chunk.clone()).unwrap();
    wait_for("b to receive the chunk", || b.store.local().contains(&chunk.key))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(b.store.stats().snapshot().store_out, 0);
    assert_eq!(a.store.stats().snapshot().store_in, 0);
}

/// A broadcast started with no peers reaches a peer that connects later.
#[tokio::test]
async fn late_peer_receives_broadcast() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);

    let chunk = Chunk::leaf(b"stored alone");
    a.store.store(chunk.clone()).unwrap();
    connect(&a, &b).await;

    wait_for("late peer to receive the chunk", || b.store.local().contains(&chunk.key))
        .await
        .unwrap();
}

/// A chunk whose data does not hash to its key is dropped.
#[tokio::test]
async fn forged_chunk_is_rejected() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let (at_a, _) = connect(&a, &b).await;

    let key = cairn_core::crypto::content_key(b"genuine");
    at_a.handle_message(Message::Store(StoreRequest {
        key: key.clone(),
        data: bytes::Bytes::from_static(b"forged"),
        request_id: None,
        metadata: None,
    }))
    .unwrap();

    assert!(!a.store.local().contains(&key));
    assert_eq!(a.store.stats().snapshot().rejected, 1);
}
