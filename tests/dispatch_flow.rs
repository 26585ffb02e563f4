mod common;

use common::*;
use meshping::bot::replies::Command;
use meshping::bot::{BotServer, Disposition};
use meshping::config::Config;
use meshping::meshtastic::{MeshEvent, NodeId, NodeRecord, Payload};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    server: BotServer,
    connector: Arc<MockConnector>,
    notifier: Arc<RecordingNotifier>,
    _dir: tempfile::TempDir,
}

async fn harness(config: Config) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let directory = temp_directory(&dir).await;
    let connector = Arc::new(MockConnector::with_nodes(vec![node(
        ALICE,
        "Alice Base",
        "ALC",
    )]));
    let notifier = Arc::new(RecordingNotifier::default());
    let server = BotServer::assemble(config, connector.clone(), directory, notifier.clone());
    server
        .supervisor()
        .connect_and_wait(Duration::from_secs(2))
        .await
        .expect("mock radio connects");
    Harness {
        server,
        connector,
        notifier,
        _dir: dir,
    }
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.bot.chunk_gap_ms = 1;
    config
}

#[tokio::test]
async fn channel_ping_gets_a_pong() {
    let h = harness(fast_config()).await;
    let d = h.server.dispatcher();

    assert_eq!(
        d.handle(&channel_text(ALICE, "  PING ")),
        Disposition::Replied(Command::Ping(1))
    );
    let link = h.connector.latest().unwrap();
    assert!(eventually(Duration::from_secs(1), || !link.sent_to(ALICE).is_empty()).await);
    let pong = &link.sent_to(ALICE)[0];
    assert!(pong.starts_with("pong ("), "{}", pong);
    assert!(pong.ends_with("RSSI: -95 SNR: 7.5 Hops: 1/3"), "{}", pong);
    assert!(h.notifier.contains("Incoming from Alice Base via Channel: 'ping'"));
}

#[tokio::test]
async fn ping_n_sends_several_pongs() {
    let h = harness(fast_config()).await;
    let d = h.server.dispatcher();
    assert_eq!(
        d.handle(&direct_text(BOB, "ping 3")),
        Disposition::Replied(Command::Ping(3))
    );
    let link = h.connector.latest().unwrap();
    assert!(eventually(Duration::from_secs(1), || link.sent_to(BOB).len() == 3).await);
    assert!(link.sent_to(BOB).iter().all(|t| t.starts_with("pong (")));
}

#[tokio::test]
async fn cooldown_blocks_second_reply() {
    let h = harness(fast_config()).await;
    let d = h.server.dispatcher();
    assert!(matches!(
        d.handle(&channel_text(ALICE, "hello")),
        Disposition::Replied(_)
    ));
    assert_eq!(
        d.handle(&channel_text(ALICE, "test")),
        Disposition::RateLimited
    );
    // Another sender is unaffected.
    assert!(matches!(
        d.handle(&channel_text(BOB, "ping")),
        Disposition::Replied(_)
    ));
    assert!(h.notifier.contains("Rate-limited reply to Alice Base"));
}

#[tokio::test]
async fn help_only_answers_direct_messages() {
    let h = harness(fast_config()).await;
    let d = h.server.dispatcher();
    assert_eq!(d.handle(&channel_text(BOB, "help")), Disposition::Ignored);
    assert_eq!(
        d.handle(&direct_text(BOB, "/help")),
        Disposition::Replied(Command::Help)
    );
    let link = h.connector.latest().unwrap();
    assert!(eventually(Duration::from_secs(2), || link.sent_to(BOB).len() >= 2).await);
    let chunks = link.sent_to(BOB);
    assert!(chunks[0].starts_with("Meshtastic Pingbot Help:"));
    assert!(chunks.iter().all(|c| c.len() <= 200));
}

#[tokio::test]
async fn traceroute_request_is_queued() {
    let h = harness(fast_config()).await;
    let d = h.server.dispatcher();
    assert_eq!(
        d.handle(&channel_text(BOB, "traceroute")),
        Disposition::Replied(Command::Traceroute)
    );
    let link = h.connector.latest().unwrap();
    assert!(eventually(Duration::from_secs(1), || !link.sent_to(BOB).is_empty()).await);
    assert_eq!(
        link.sent_to(BOB)[0],
        "Traceroute queued: position 1, ETA ~30s"
    );
    assert_eq!(h.server.traces().outstanding(BOB), 1);
}

#[tokio::test]
async fn traceroute_cap_is_reported() {
    let mut config = fast_config();
    config.bot.reply_cooldown_secs = 0;
    config.traceroute.max_queue_per_user = 1;
    let h = harness(config).await;
    let d = h.server.dispatcher();
    d.handle(&direct_text(CAROL, "traceroute"));
    d.handle(&direct_text(CAROL, "traceroute"));
    let link = h.connector.latest().unwrap();
    assert!(eventually(Duration::from_secs(1), || link.sent_to(CAROL).len() == 2).await);
    assert!(link
        .sent_to(CAROL)
        .contains(&"Traceroute failed: queue full (max 1 per user)".to_string()));
}

#[tokio::test]
async fn ignores_own_and_oversized_packets() {
    let h = harness(fast_config()).await;
    let d = h.server.dispatcher();
    assert_eq!(d.handle(&channel_text(BOT, "ping")), Disposition::OwnPacket);
    let long = format!("ping {}", "x".repeat(250));
    assert_eq!(d.handle(&channel_text(ALICE, &long)), Disposition::Ignored);
    assert_eq!(
        d.handle(&channel_text(ALICE, "good morning")),
        Disposition::Ignored
    );
}

#[tokio::test]
async fn node_info_updates_directory() {
    let h = harness(fast_config()).await;
    let d = h.server.dispatcher();
    let info = NodeRecord {
        id: Some(CAROL),
        long_name: Some("Carol Hilltop".into()),
        short_name: Some("CRL".into()),
        ..Default::default()
    };
    assert_eq!(
        d.handle(&packet(CAROL, NodeId::BROADCAST, Payload::NodeInfo(info))),
        Disposition::DirectoryUpdated
    );
    assert_eq!(h.server.directory().lookup(CAROL), "Carol Hilltop");
    let peer = h.server.directory().get(CAROL).unwrap();
    assert_eq!(peer.rssi, Some(-95));
    assert!(h
        .notifier
        .contains(&format!("Updated node info for Carol Hilltop ({})", CAROL)));
}

#[tokio::test]
async fn trace_responses_reach_the_orchestrator() {
    let h = harness(fast_config()).await;
    let d = h.server.dispatcher();
    let reply = packet(
        BOB,
        BOT,
        Payload::Traceroute(meshping::meshtastic::proto::RouteDiscovery::default()),
    );
    assert_eq!(
        d.handle(&reply),
        Disposition::TraceResponse { matched: false }
    );
}

#[tokio::test]
async fn server_loop_handles_events_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.storage.peer_db = dir.path().join("peers.json").display().to_string();
    config.supervisor.backoff_floor_secs = 1;
    let connector = Arc::new(MockConnector::with_nodes(vec![node(BOB, "Bob Mobile", "BOB")]));
    let mut server = BotServer::with_connector(config, connector.clone())
        .await
        .unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let radio = connector.clone();
    let driver = tokio::spawn(async move {
        assert!(eventually(Duration::from_secs(2), || radio.latest().is_some()).await);
        // Give bootstrap a moment to finish before the radio starts talking.
        tokio::time::sleep(Duration::from_millis(50)).await;
        radio.inject(MeshEvent::Packet(channel_text(ALICE, "ping")));
        let link = radio.latest().unwrap();
        let answered =
            eventually(Duration::from_secs(2), || !link.sent_to(ALICE).is_empty()).await;
        let _ = stop_tx.send(());
        answered
    });

    server
        .run_until(async {
            let _ = stop_rx.await;
        })
        .await
        .unwrap();
    assert!(driver.await.unwrap());
    assert!(connector.latest().unwrap().is_closed());
    assert!(dir.path().join("peers.json").exists());
}

#[tokio::test]
async fn server_keeps_running_when_first_connect_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let directory = temp_directory(&dir).await;
    let mut config = fast_config();
    config.supervisor.connect_timeout_secs = 1;
    config.supervisor.backoff_floor_secs = 1;
    config.supervisor.backoff_max_secs = 1;
    let connector = Arc::new(MockConnector::new());
    connector.fail_next_opens(2);
    let notifier = Arc::new(RecordingNotifier::default());
    let mut server =
        BotServer::assemble(config, connector.clone(), directory, notifier.clone());

    let radio = connector.clone();
    let driver = tokio::spawn(async move {
        // The third attempt succeeds well after the one second startup wait.
        let connected =
            eventually(Duration::from_secs(5), || radio.latest().is_some()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        radio.inject(MeshEvent::Packet(channel_text(ALICE, "ping")));
        let link = radio.latest();
        let answered = match link {
            Some(link) => {
                eventually(Duration::from_secs(2), || !link.sent_to(ALICE).is_empty()).await
            }
            None => false,
        };
        (connected, answered)
    });

    let started = std::time::Instant::now();
    server
        .run_until(async {
            tokio::time::sleep(Duration::from_secs(4)).await;
        })
        .await
        .unwrap();
    let (connected, answered) = driver.await.unwrap();
    assert!(connected);
    assert!(answered);
    assert!(notifier.contains("Radio not connected yet"));
    assert!(connector.open_count() >= 3);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn stop_during_first_connect_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let directory = temp_directory(&dir).await;
    let config = fast_config();
    let connector = Arc::new(MockConnector::new());
    connector.fail_next_opens(usize::MAX);
    let notifier = Arc::new(RecordingNotifier::default());
    let mut server =
        BotServer::assemble(config, connector.clone(), directory, notifier.clone());

    let started = std::time::Instant::now();
    server
        .run_until(tokio::time::sleep(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(connector.latest().is_none());
    assert!(notifier.contains("Pingbot shutting down"));
    assert!(!notifier.contains("Radio not connected yet"));
}

#[tokio::test]
async fn chunks_are_spaced_by_the_gap() {
    let mut config = fast_config();
    config.bot.chunk_gap_ms = 200;
    let h = harness(config).await;
    let gap = Duration::from_millis(200);
    let chunks: Vec<String> = ["one", "two", "three"].iter().map(|s| s.to_string()).collect();

    assert!(h.server.delivery().send_sequence(&chunks, ALICE).await);
    let returned = std::time::Instant::now();

    let link = h.connector.latest().unwrap();
    assert_eq!(link.sent_to(ALICE), chunks);
    let times = link.text_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= gap, "gap was {:?}", pair[1] - pair[0]);
    }
    // No pause after the final chunk.
    assert!(returned - times[2] < gap / 2);
}
