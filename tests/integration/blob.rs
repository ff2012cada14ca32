use crate::*;

/// A multi-chunk blob held two hops away is reassembled chunk by chunk.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blob_fetched_across_chain() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let c = TestNode::with(
        3,
        NETWORK_ID,
        DistributionConfig {
            broadcast_window_ms: 0,
            ..Default::default()
        },
    );

    let data = payload(5000, 9);
    let root = c.store.store_blob(&data[..]).unwrap();

    connect(&b, &c).await;
    connect(&a, &b).await;

    let got = cairn_store::fetch::fetch_blob(a.store.clone(), root).await.unwrap();
    assert_eq!(got, data);
}

/// A blob stored while connected is readable from the neighbour alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stored_blob_reaches_neighbour() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    connect(&a, &b).await;

    let data = payload(900, 4);
    let root = a.store.store_blob(&data[..]).unwrap();
    wait_for("root to arrive", || b.store.local().contains(&root))
        .await
        .unwrap();

    let got = cairn_store::fetch::fetch_blob(b.store.clone(), root).await.unwrap();
    assert_eq!(got, data);
}
