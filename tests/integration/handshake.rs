use cairn_core::wire::RetrieveRequest;
use cairn_core::{Chunk, Message};
use cairn_store::Handshake;

use crate::*;

/// Nodes on different networks never register each other.
#[tokio::test]
async fn network_mismatch_closes_both_sides() {
    let a = TestNode::with(1, 1, Default::default());
    let b = TestNode::with(2, 2, Default::default());
    let (at_a, at_b) = link(&a, &b);

    wait_for("both sessions to close", || at_a.is_closed() && at_b.is_closed())
        .await
        .unwrap();
    assert_eq!(a.table.connected(), 0);
    assert_eq!(b.table.connected(), 0);
}

/// Messages sent before the handshake are held and flushed after it.
#[tokio::test]
async fn messages_wait_for_handshake() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let chunk = Chunk::leaf(b"asked early");
    b.store.local().put(&chunk).unwrap();

    let (at_a, _) = link(&a, &b);
    assert_ne!(at_a.handshake(), Handshake::Done);
    at_a.send(Message::Retrieve(RetrieveRequest::new(chunk.key.clone())))
        .unwrap();

    wait_for("queued retrieve to be answered", || a.store.local().contains(&chunk.key))
        .await
        .unwrap();
}

/// The post-handshake wildcard lookup teaches a node about its
/// neighbour's neighbours.
#[tokio::test]
async fn peers_learned_through_neighbour() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let c = TestNode::new(3);
    connect(&b, &c).await;
    connect(&a, &b).await;

    wait_for("a to learn about c", || a.table.known() == 2).await.unwrap();
    let ids: Vec<u8> = a.table.unconnected_records().iter().map(|p| p.node_id[0]).collect();
    assert_eq!(ids, vec![3]);
}

/// Closing one end tears down the other and empties both routing tables.
#[tokio::test]
async fn close_unregisters_both_sides() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let (at_a, at_b) = connect(&a, &b).await;
    assert_eq!(a.table.connected(), 1);

    at_a.close();
    wait_for("far side to close", || at_b.is_closed()).await.unwrap();
    assert_eq!(a.table.connected(), 0);
    assert_eq!(b.table.connected(), 0);
}
