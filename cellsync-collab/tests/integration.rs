//! End-to-end synchronization tests.
//!
//! In-memory pairs exercise the channel deterministically; the relay tests
//! start a real server and connect real WebSocket transports.

use cellsync_collab::{
    ChannelConfig, MemoryTransport, RelayServer, ServerConfig, SyncChannel, Transport,
    WebSocketTransport,
};
use cellsync_core::{DocumentConfig, Origin, ReplicatedDocument};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

fn document(await_initial_sync: bool, name: &str) -> ReplicatedDocument {
    ReplicatedDocument::new(DocumentConfig {
        display_name: name.to_string(),
        await_initial_sync,
        ..DocumentConfig::default()
    })
}

/// Pump every channel until `done` holds or five seconds pass.
async fn settle<T: Transport>(channels: &mut [SyncChannel<T>], done: impl Fn(&[SyncChannel<T>]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        for channel in channels.iter_mut() {
            channel.collect().unwrap();
            channel.flush();
            channel.process_pending();
        }
        if done(channels) {
            return;
        }
        assert!(Instant::now() < deadline, "replicas did not settle");
        sleep(Duration::from_millis(10)).await;
    }
}

fn converged<T: Transport>(channels: &[SyncChannel<T>]) -> bool {
    let first = channels[0].document().to_json().unwrap();
    channels
        .iter()
        .all(|c| !c.document().has_outbound() && c.queued_len() == 0 && c.document().to_json().unwrap() == first)
}

// =============================================================================
// In-memory pairs
// =============================================================================

fn memory_pair(a: &ReplicatedDocument, b: &ReplicatedDocument) -> Vec<SyncChannel<MemoryTransport>> {
    let ((ta, inbound_a), (tb, inbound_b)) = MemoryTransport::pair();
    vec![
        SyncChannel::new(a.clone(), ta, inbound_a, ChannelConfig::for_document("nb")).unwrap(),
        SyncChannel::new(b.clone(), tb, inbound_b, ChannelConfig::for_document("nb")).unwrap(),
    ]
}

#[tokio::test]
async fn test_concurrent_inserts_at_same_index_converge() {
    let a = document(false, "Alice");
    let b = document(false, "Bob");
    let mut channels = memory_pair(&a, &b);

    a.view("nb").create_list::<String>("cells").unwrap().push("seed".into()).unwrap();
    settle(&mut channels, converged).await;

    let cells_a = a.view("nb").create_list::<String>("cells").unwrap();
    let cells_b = b.view("nb").create_list::<String>("cells").unwrap();
    cells_a.insert(0, "c1".into()).unwrap();
    cells_b.insert(0, "c2".into()).unwrap();
    settle(&mut channels, converged).await;

    let order = cells_a.to_vec().unwrap();
    assert_eq!(order, cells_b.to_vec().unwrap());
    assert_eq!(order.len(), 3);
    assert_eq!(order[2], "seed");
}

#[tokio::test]
async fn test_peers_learn_each_other() {
    let a = document(false, "Ada Lovelace");
    let b = document(false, "Grace Hopper");
    let mut channels = memory_pair(&a, &b);
    settle(&mut channels, |c| {
        c[0].document().registry().contains(&b.actor()) && c[1].document().registry().contains(&a.actor())
    })
    .await;

    let bob_seen_by_a = a.registry().get(&b.actor()).unwrap();
    assert_eq!(bob_seen_by_a.display_name, "Grace Hopper");
    assert_eq!(bob_seen_by_a.short_name, "GH");
}

#[tokio::test]
async fn test_edits_while_offline_arrive_in_order() {
    let a = document(false, "Alice");
    let b = document(false, "Bob");
    let mut channels = memory_pair(&a, &b);
    settle(&mut channels, converged).await;

    channels[0].transport().set_ready(false);
    let source = a.view("nb").create_string("source").unwrap();
    source.set_text("abc").unwrap();
    source.insert(3, "def").unwrap();
    source.remove(0, 1).unwrap();
    channels[0].collect().unwrap();
    assert_eq!(channels[0].flush(), 0);
    assert_eq!(channels[0].queued_len(), 3);

    channels[0].transport().set_ready(true);
    settle(&mut channels, converged).await;
    assert_eq!(b.view("nb").create_string("source").unwrap().text().unwrap(), "bcdef");
}

#[tokio::test]
async fn test_late_joiner_gets_state_before_local_edits() {
    let a = document(false, "Alice");
    a.view("nb").create_map::<i64>("meta").unwrap().set("version", 1).unwrap();
    // Nothing was connected yet; the outbox still holds the change.
    let b = document(true, "Bob");
    let meta_b = b.view("nb").create_map::<i64>("meta").unwrap();
    meta_b.set("reviewed", 1).unwrap();
    assert!(!b.has_outbound());

    let mut channels = memory_pair(&a, &b);
    settle(&mut channels, converged).await;

    assert!(b.is_initialized());
    assert_eq!(a.to_json().unwrap(), json!({"nb": {"meta": {"version": 1, "reviewed": 1}}}));
}

#[tokio::test]
async fn test_run_loop_stops_when_inbound_closes() {
    let doc = document(false, "Solo");
    let (transport, mut sent) = MemoryTransport::new();
    let (to_channel, inbound) = tokio::sync::mpsc::unbounded_channel();
    let mut channel = SyncChannel::new(doc.clone(), transport, inbound, ChannelConfig::for_document("nb")).unwrap();

    doc.view("nb").create_value::<String>("title").unwrap().set("draft".into()).unwrap();
    drop(to_channel);
    tokio::time::timeout(Duration::from_secs(2), channel.run())
        .await
        .expect("run loop should finish")
        .unwrap();

    // Join, state request and the one delta.
    let mut frames = 0;
    while sent.try_recv().is_ok() {
        frames += 1;
    }
    assert_eq!(frames, 3);
}

// =============================================================================
// Relay over WebSocket
// =============================================================================

async fn start_relay() -> (Arc<RelayServer>, String) {
    start_relay_with(ServerConfig {
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    })
    .await
}

async fn start_relay_with(config: ServerConfig) -> (Arc<RelayServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RelayServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        ..config
    }));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://{addr}"))
}

async fn connect(url: &str, doc: &ReplicatedDocument) -> SyncChannel<WebSocketTransport> {
    let (transport, inbound) = WebSocketTransport::connect_document(url, doc.actor(), "nb/main")
        .await
        .unwrap();
    SyncChannel::new(doc.clone(), transport, inbound, ChannelConfig::for_document("nb/main")).unwrap()
}

#[tokio::test]
async fn test_relay_syncs_late_joiner_and_concurrent_edits() {
    let (server, url) = start_relay().await;

    let a = document(true, "Alice");
    let cells_a = a.view("nb").create_list::<String>("cells").unwrap();
    cells_a.push("c0".into()).unwrap();
    let mut channels = vec![connect(&url, &a).await];
    settle(&mut channels, |c| c[0].document().is_initialized() && converged(c)).await;
    assert_eq!(cells_a.len().unwrap(), 1);

    let b = document(true, "Bob");
    channels.push(connect(&url, &b).await);
    settle(&mut channels, |c| converged(c) && c[1].document().is_initialized()).await;
    let cells_b = b.view("nb").create_list::<String>("cells").unwrap();
    assert_eq!(cells_b.to_vec().unwrap(), vec!["c0".to_string()]);

    cells_a.insert(0, "from-a".into()).unwrap();
    cells_b.insert(0, "from-b".into()).unwrap();
    settle(&mut channels, |c| {
        let tree = c[0].document().to_json().unwrap();
        converged(c) && tree["nb"]["cells"].as_array().map_or(0, |cells| cells.len()) == 3
    })
    .await;
    assert_eq!(cells_a.to_vec().unwrap(), cells_b.to_vec().unwrap());

    // Both learn each other through the relay.
    settle(&mut channels, |_| a.registry().contains(&b.actor()) && b.registry().contains(&a.actor())).await;
    assert_eq!(server.peers("nb/main").await.unwrap().len(), 2);

    // The room replica holds everything that was relayed.
    let snapshot = server.snapshot("nb/main").await.unwrap();
    let fresh = document(false, "Observer");
    fresh.merge_update(&snapshot, Origin::Snapshot).unwrap();
    assert_eq!(fresh.to_json().unwrap(), a.to_json().unwrap());
}

async fn wait_for_rooms(server: &RelayServer, count: usize, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.room_count().await != count {
        assert!(Instant::now() < deadline, "{what}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_relay_keeps_replica_of_empty_room() {
    let (server, url) = start_relay().await;
    let a = document(false, "Alice");
    a.view("nb").create_string("source").unwrap().set_text("x = 1").unwrap();
    let mut channels = vec![connect(&url, &a).await];
    settle(&mut channels, converged).await;
    wait_for_rooms(&server, 1, "room was never created").await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.snapshot("nb/main").await.is_some_and(|s| s.len() > 8) {
        assert!(Instant::now() < deadline, "edit never reached the room");
        sleep(Duration::from_millis(10)).await;
    }

    drop(channels);
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.peers("nb/main").await.is_some_and(|peers| !peers.is_empty()) {
        assert!(Instant::now() < deadline, "member never left");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.room_count().await, 1);
    assert_eq!(server.stats().await.active_rooms, 1);

    // A peer reconnecting later still finds the edits.
    let b = document(true, "Bob");
    let mut channels = vec![connect(&url, &b).await];
    settle(&mut channels, |c| c[0].document().is_initialized() && converged(c)).await;
    assert_eq!(b.view("nb").create_string("source").unwrap().text().unwrap(), "x = 1");
}

#[tokio::test]
async fn test_relay_evicts_rooms_after_recovery_timeout() {
    let (server, url) = start_relay_with(ServerConfig {
        room_recovery_timeout_ms: Some(50),
        ..ServerConfig::default()
    })
    .await;
    let a = document(false, "Alice");
    let mut channels = vec![connect(&url, &a).await];
    settle(&mut channels, converged).await;
    wait_for_rooms(&server, 1, "room was never created").await;

    drop(channels);
    wait_for_rooms(&server, 0, "room was never evicted").await;
    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_rooms, 0);
    assert!(server.snapshot("nb/main").await.is_none());
}

#[tokio::test]
async fn test_lagging_member_catches_up() {
    let (server, url) = start_relay_with(ServerConfig {
        broadcast_capacity: 1,
        ..ServerConfig::default()
    })
    .await;
    let a = document(true, "Alice");
    let b = document(true, "Bob");
    let mut channels = vec![connect(&url, &a).await, connect(&url, &b).await];
    settle(&mut channels, |c| c.iter().all(|c| c.document().is_initialized()) && converged(c)).await;

    // One change-set per push: far more frames than the fan-out buffers.
    let cells = a.view("nb").create_list::<i64>("cells").unwrap();
    for i in 0..200 {
        cells.push(i).unwrap();
    }
    let cells_b = b.view("nb").create_list::<i64>("cells").unwrap();
    settle(&mut channels, |c| converged(c) && cells_b.len().unwrap() == 200).await;
    assert_eq!(cells_b.to_vec().unwrap(), (0..200).collect::<Vec<i64>>());

    let stats = server.stats().await;
    assert!(stats.lagged_frames == 0 || stats.resyncs > 0);
}

#[tokio::test]
async fn test_relay_counts_malformed_frames() {
    use futures_util::SinkExt;
    use tokio_tungstenite::tungstenite::Message;

    let (server, url) = start_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/x/nb")).await.unwrap();
    ws.send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef].into())).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.stats().await.malformed_frames != 1 {
        assert!(Instant::now() < deadline, "malformed frame was not counted");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.room_count().await, 0);
    assert!(server.snapshot("nb").await.is_none());
}
