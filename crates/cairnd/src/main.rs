//! cairnd: the Cairn chunk store daemon.
//!
//! ```text
//! cairnd [run]        join the overlay and serve chunks
//! cairnd put <file>   split a file into the local store, print its root key
//! cairnd cat <root>   reassemble a blob to stdout, asking peers for missing chunks
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use cairn_core::config::CairnConfig;
use cairn_core::{ContentKey, PeerAddress, TreeChunker};
use cairn_store::router::PeerRouter;
use cairn_store::{transport, FsDatabase, LocalStore, NetworkStore, NodeIdentity, PeerTable};

/// How many learned-but-unconnected peers to dial per maintenance tick.
const DIAL_PER_TICK: usize = 2;

/// How long `cat` waits for bootstrap handshakes before searching.
const CAT_SETTLE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Load config
    if let Err(e) = CairnConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CairnConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CairnConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => run(config).await,
        Some("put") => match args.get(1) {
            Some(path) => put(config, path).await,
            None => bail!("usage: cairnd put <file>"),
        },
        Some("cat") => match args.get(1) {
            Some(root) => cat(config, root).await,
            None => bail!("usage: cairnd cat <root>"),
        },
        Some(other) => bail!("unknown command {other:?}; expected run, put or cat"),
    }
}

// ── Node assembly ────────────────────────────────────────────────────────────

struct Node {
    store: Arc<NetworkStore>,
    table: Arc<PeerTable>,
    listener: TcpListener,
}

async fn build_node(config: &CairnConfig) -> Result<Node> {
    let node_id = config.node_id()?;
    let ip: Ipv4Addr = config
        .network
        .listen_addr
        .parse()
        .with_context(|| format!("bad listen_addr {:?}", config.network.listen_addr))?;

    let listener = TcpListener::bind((ip, config.network.port))
        .await
        .with_context(|| format!("failed to bind {ip}:{}", config.network.port))?;
    let port = listener.local_addr()?.port();

    let db = FsDatabase::open(&config.store.storage_path)?;
    tracing::info!(
        path = %config.store.storage_path.display(),
        chunks = db.count(),
        "chunk database opened"
    );
    let local = LocalStore::new(config.store.memory_budget_bytes, Arc::new(db));
    let chunker = TreeChunker::new(config.chunker.chunk_size)?;

    let table = Arc::new(PeerTable::new(node_id.clone()));
    let router: Arc<dyn PeerRouter> = table.clone();
    let identity = NodeIdentity {
        address: PeerAddress::new(ip, port, node_id),
        network_id: config.network.network_id,
    };
    tracing::info!(
        node = %identity.address.short_id(),
        %port,
        network_id = identity.network_id,
        "node identity"
    );

    let store = NetworkStore::new(local, router, identity, chunker, config.distribution.clone());
    Ok(Node { store, table, listener })
}

async fn dial_bootstrap(store: &Arc<NetworkStore>, bootstrap: &[String]) {
    for entry in bootstrap {
        let addr: SocketAddr = match entry.parse() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(peer = %entry, error = %e, "bad bootstrap address, skipped");
                continue;
            }
        };
        if let Err(e) = transport::dial(store, addr).await {
            tracing::warn!(%addr, error = %e, "bootstrap dial failed");
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

async fn run(config: CairnConfig) -> Result<()> {
    tracing::info!("cairnd starting");
    let Node { store, table, listener } = build_node(&config).await?;

    // ── Shutdown channel ─────────────────────────────────────────────────────

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(());
            }
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let listener_task = tokio::spawn(transport::serve(
        listener,
        store.clone(),
        shutdown_tx.subscribe(),
    ));

    dial_bootstrap(&store, &config.network.bootstrap).await;

    let maintenance_task = {
        let store = store.clone();
        let table = table.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                store.sweep_expired();
                store.stats().log();
                tracing::info!(
                    connected = table.connected(),
                    known = table.known(),
                    pending = store.pending_len(),
                    "peer table snapshot"
                );
                for peer in table.unconnected_records().into_iter().take(DIAL_PER_TICK) {
                    if let Err(e) = transport::dial(&store, peer.socket_addr().into()).await {
                        tracing::debug!(peer = %peer, error = %e, "dial failed");
                    }
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = listener_task        => tracing::error!("listener exited: {:?}", r),
        r = maintenance_task     => tracing::error!("maintenance task exited: {:?}", r),
    }

    Ok(())
}

async fn put(config: CairnConfig, path: &str) -> Result<()> {
    let db = FsDatabase::open(&config.store.storage_path)?;
    let local = LocalStore::new(config.store.memory_budget_bytes, Arc::new(db));
    let chunker = TreeChunker::new(config.chunker.chunk_size)?;

    let file = std::fs::File::open(path).with_context(|| format!("failed to open {path}"))?;
    let mut sink = |chunk: cairn_core::Chunk| -> Result<(), cairn_core::ChunkerError> {
        local
            .put(&chunk)
            .map_err(|e| cairn_core::ChunkerError::Sink {
                key: chunk.key.clone(),
                source: Box::new(e),
            })
    };
    let root = chunker.split(std::io::BufReader::new(file), &mut sink)?;

    tracing::info!(%path, root = %root.short(), "file stored");
    println!("{root}");
    Ok(())
}

async fn cat(mut config: CairnConfig, root: &str) -> Result<()> {
    let root = ContentKey::from_hex(root).context("root must be a hex content key")?;
    // A running daemon may hold the configured port.
    config.network.port = 0;
    let Node { store, listener, .. } = build_node(&config).await?;
    drop(listener);

    // The root may be local while its children are not.
    if !config.network.bootstrap.is_empty() {
        dial_bootstrap(&store, &config.network.bootstrap).await;
        tokio::time::sleep(CAT_SETTLE).await;
    }

    let data = cairn_store::fetch::fetch_blob(store.clone(), root).await?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&data).await?;
    stdout.flush().await?;
    Ok(())
}
