use cairn_core::Chunk;
use cairn_store::transport;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::*;

/// Two nodes over loopback TCP: handshake, lookup, shutdown.
#[tokio::test]
async fn retrieve_over_loopback() {
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    let chunk = Chunk::leaf(b"over the socket");
    b.store.local().put(&chunk).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(transport::serve(listener, b.store.clone(), shutdown_rx));

    transport::dial(&a.store, addr).await.unwrap();
    wait_for("tcp handshake", || a.table.connected() == 1 && b.table.connected() == 1)
        .await
        .unwrap();

    let got = a.store.retrieve(chunk.key.clone()).await.unwrap();
    assert_eq!(got, chunk);

    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn dial_refused_is_an_error() {
    let a = TestNode::new(1);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    assert!(transport::dial(&a.store, addr).await.is_err());
}
