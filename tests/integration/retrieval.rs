use cairn_core::Chunk;
use cairn_store::StoreError;

use crate::*;

/// A chunk held by a direct neighbour comes back in one hop.
#[tokio::test]
async fn retrieve_from_neighbour() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let chunk = Chunk::leaf(b"held by b");
    b.store.local().put(&chunk).unwrap();

    connect(&a, &b).await;

    let got = a.store.retrieve(chunk.key.clone()).await.unwrap();
    assert_eq!(got, chunk);
    assert!(a.store.local().contains(&chunk.key), "retrieved chunk is kept locally");
    assert_eq!(a.store.pending_len(), 0);
}

/// a - b - c: b forwards the miss to c and keeps a copy on the way back.
#[tokio::test]
async fn retrieve_across_chain() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let c = TestNode::new(3);
    let chunk = Chunk::leaf(b"two hops away");
    c.store.local().put(&chunk).unwrap();

    connect(&b, &c).await;
    connect(&a, &b).await;

    let got = a.store.retrieve(chunk.key.clone()).await.unwrap();
    assert_eq!(got.data, chunk.data);
    assert!(b.store.local().contains(&chunk.key), "intermediate node caches the chunk");
    assert_eq!(b.store.pending_len(), 0);
}

/// Nobody has it: the caller times out and both nodes drop their state.
#[tokio::test]
async fn miss_times_out_and_cleans_up() {
    let a = TestNode::with(1, NETWORK_ID, quick_config());
    let b = TestNode::with(2, NETWORK_ID, quick_config());
    connect(&a, &b).await;

    let key = cairn_core::crypto::content_key(b"nobody has this");
    let err = a.store.retrieve(key.clone()).await.unwrap_err();
    assert!(matches!(err, StoreError::RetrievalTimeout { .. }));
    assert_eq!(a.store.pending_len(), 0);
    assert_eq!(a.store.stats().snapshot().timeouts, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    b.store.sweep_expired();
    assert_eq!(b.store.pending_len(), 0, "forwarded search expires on the far side");
}

/// Two concurrent lookups of one key cause one search and one transfer.
#[tokio::test]
async fn concurrent_retrieves_share_one_search() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let c = TestNode::new(3);
    let chunk = Chunk::leaf(b"wanted twice");
    c.store.local().put(&chunk).unwrap();

    connect(&b, &c).await;
    connect(&a, &b).await;

    let first = a.store.retrieve(chunk.key.clone());
    let second = a.store.retrieve(chunk.key.clone());
    assert_eq!(a.store.pending_len(), 1);

    let (x, y) = futures::join!(first, second);
    assert_eq!(x.unwrap(), chunk);
    assert_eq!(y.unwrap(), chunk);

    assert_eq!(c.store.stats().snapshot().store_out, 1);
    assert_eq!(b.store.stats().snapshot().store_out, 1);
}

/// A search started before any peer is connected picks up the first one.
#[tokio::test]
async fn search_waits_for_first_peer() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let chunk = Chunk::leaf(b"arrives later");
    b.store.local().put(&chunk).unwrap();

    let pending = a.store.retrieve(chunk.key.clone());
    link(&a, &b);

    assert_eq!(pending.await.unwrap(), chunk);
}
