//! End-to-end transfer scenarios over the loopback transport: the full
//! offer/accept/chunk/complete flow plus the failure paths (unreachable
//! peers, open timeouts, mid-transfer drops, cancellation).

use async_trait::async_trait;
use bytes::Bytes;
use linkdrop::core::connection::memory::MemorySignaling;
use linkdrop::core::connection::transport::{ChannelHandle, Signaling};
use linkdrop::core::protocol::{encode_chunk, encode_control};
use linkdrop::{
    ConnectionEvent, ConnectionManager, ConnectionState, ControlMessage, Error, FileMetadata,
    FileState, OutgoingFile, PeerId, Result, SendOutcome, TransferConfig, TransferEngine,
    TransferEvent,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opt-in tracing for debugging: `RUST_LOG=linkdrop=debug cargo test`.
fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> TransferConfig {
    TransferConfig {
        retry_base_delay: Duration::from_millis(10),
        connect_timeout: Duration::from_millis(100),
        backpressure_poll: Duration::from_millis(5),
        chunk_pacing: Duration::ZERO,
        pause_poll: Duration::from_millis(5),
        progress_throttle: Duration::from_millis(10),
        ..TransferConfig::default()
    }
}

/// Patterned payload so reassembly mistakes show up as content mismatches,
/// not just length mismatches.
fn patterned(len: usize) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<u8>>(),
    )
}

struct Session {
    conn: ConnectionManager,
    engine: TransferEngine,
}

async fn session(signaling: Arc<dyn Signaling>, config: TransferConfig) -> Session {
    init_logs();
    let conn = ConnectionManager::new(signaling, config.clone());
    let engine = TransferEngine::new(conn.clone(), config);
    Session { conn, engine }
}

/// Receiver registered and listening, sender connected to it.
async fn connected_sessions(
    signaling: Arc<MemorySignaling>,
    config: TransferConfig,
) -> (Session, Session) {
    let receiver = session(Arc::clone(&signaling) as _, config.clone()).await;
    let code = receiver.conn.initialize().await.unwrap();

    let sender = session(signaling as _, config).await;
    sender.conn.connect(code).await.unwrap();
    // Let the passive side attach its half.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (sender, receiver)
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
) -> TransferEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn multi_file_transfer_reaches_exactly_one_hundred_percent() {
    let (sender, receiver) = connected_sessions(MemorySignaling::new(), fast_config()).await;
    receiver.engine.set_auto_accept(true);
    let mut events = receiver.engine.subscribe().await;

    let big = patterned(3 * 1024 * 1024);
    let small = patterned(512 * 1024);
    let files = vec![
        OutgoingFile::new("video.mp4", "video/mp4", big.clone()),
        OutgoingFile::new("cover.png", "image/png", small.clone()),
    ];
    let ids: Vec<Uuid> = files.iter().map(|f| f.metadata.id).collect();

    let outcome = sender.engine.send_files(files).await.unwrap();
    assert_eq!(outcome, SendOutcome::Completed);
    assert_eq!(sender.conn.state().await, ConnectionState::Completed);

    let mut payloads = std::collections::HashMap::new();
    loop {
        match next_event(&mut events).await {
            TransferEvent::FileReceived { metadata, payload } => {
                payloads.insert(metadata.id, payload);
            }
            TransferEvent::TransferComplete => break,
            _ => {}
        }
    }
    assert_eq!(&payloads[&ids[0]][..], &big[..]);
    assert_eq!(&payloads[&ids[1]][..], &small[..]);

    // Both sides settle at exactly 100%, never above.
    for side in [&sender, &receiver] {
        let snap = side.engine.progress_snapshot().await;
        assert_eq!(snap.aggregate.completed_files, 2);
        assert!((snap.aggregate.percentage - 100.0).abs() < f64::EPSILON);
        for fp in &snap.files {
            assert_eq!(fp.state, FileState::Completed);
            assert_eq!(fp.percentage, 100.0);
            assert_eq!(fp.bytes_transferred, fp.total_bytes);
        }
    }
    assert_eq!(receiver.conn.state().await, ConnectionState::Completed);
}

#[tokio::test]
async fn progress_events_carry_monotonic_aggregate() {
    let (sender, receiver) = connected_sessions(MemorySignaling::new(), fast_config()).await;
    receiver.engine.set_auto_accept(true);
    let mut events = sender.engine.subscribe().await;

    let file = OutgoingFile::new("data.bin", "application/octet-stream", patterned(1024 * 1024));
    sender.engine.send_files(vec![file]).await.unwrap();

    let mut last_pct = 0.0;
    loop {
        match next_event(&mut events).await {
            TransferEvent::Progress(snap) => {
                assert!(
                    snap.aggregate.percentage + f64::EPSILON >= last_pct,
                    "aggregate regressed: {} -> {}",
                    last_pct,
                    snap.aggregate.percentage
                );
                assert!(snap.aggregate.percentage <= 100.0);
                last_pct = snap.aggregate.percentage;
            }
            TransferEvent::TransferComplete => break,
            _ => {}
        }
    }
    assert!((last_pct - 100.0).abs() < f64::EPSILON);
}

// ── Offer negotiation ────────────────────────────────────────────────────────

#[tokio::test]
async fn explicit_accept_flow() {
    let (sender, receiver) = connected_sessions(MemorySignaling::new(), fast_config()).await;
    let mut recv_events = receiver.engine.subscribe().await;

    let engine = receiver.engine.clone();
    tokio::spawn(async move {
        loop {
            if let TransferEvent::OfferReceived { files, total_size } =
                next_event(&mut recv_events).await
            {
                assert_eq!(files.len(), 1);
                assert_eq!(total_size, 4096);
                engine.accept_offer().await.unwrap();
                break;
            }
        }
    });

    let file = OutgoingFile::new("doc.pdf", "application/pdf", patterned(4096));
    let outcome = sender.engine.send_files(vec![file]).await.unwrap();
    assert_eq!(outcome, SendOutcome::Completed);
}

#[tokio::test]
async fn rejection_reaches_sender_with_reason() {
    let (sender, receiver) = connected_sessions(MemorySignaling::new(), fast_config()).await;
    let mut recv_events = receiver.engine.subscribe().await;
    let mut send_events = sender.engine.subscribe().await;

    let engine = receiver.engine.clone();
    tokio::spawn(async move {
        loop {
            if let TransferEvent::OfferReceived { .. } = next_event(&mut recv_events).await {
                engine.reject_offer(Some("disk full".into())).await.unwrap();
                break;
            }
        }
    });

    let file = OutgoingFile::new("big.iso", "application/octet-stream", patterned(8192));
    let outcome = sender.engine.send_files(vec![file]).await.unwrap();
    assert_eq!(
        outcome,
        SendOutcome::Rejected {
            reason: Some("disk full".into())
        }
    );

    loop {
        if let TransferEvent::OfferAnswered { accepted, reason } =
            next_event(&mut send_events).await
        {
            assert!(!accepted);
            assert_eq!(reason.as_deref(), Some("disk full"));
            break;
        }
    }
}

// ── Connection failures ──────────────────────────────────────────────────────

#[tokio::test]
async fn unreachable_peer_exhausts_exactly_the_retry_budget() {
    let signaling = MemorySignaling::new();
    let sender = session(Arc::clone(&signaling) as _, fast_config()).await;
    let mut events = sender.conn.subscribe().await;

    let err = sender.conn.connect(PeerId::generate()).await.unwrap_err();
    assert!(matches!(err, Error::Connection { attempts: 3, .. }), "{err}");
    assert_eq!(signaling.connect_attempts(), 3);
    assert_eq!(sender.conn.state().await, ConnectionState::Error);

    // Two scheduled retries, then the terminal failure.
    let mut reconnecting = 0;
    let mut failed = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await
    {
        match event {
            ConnectionEvent::Reconnecting { attempt, .. } => {
                reconnecting += 1;
                assert!(attempt < 3);
            }
            ConnectionEvent::Failed(_) => failed = true,
            _ => {}
        }
    }
    assert_eq!(reconnecting, 2);
    assert!(failed);

    // Terminal means terminal: no background dialing afterwards.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(signaling.connect_attempts(), 3);
}

/// Signaling whose `connect` never resolves, to exercise the open timeout.
struct NeverSignaling;

#[async_trait]
impl Signaling for NeverSignaling {
    async fn register(&self, _id: &PeerId) -> Result<mpsc::UnboundedReceiver<ChannelHandle>> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(rx)
    }

    async fn connect(&self, _id: &PeerId) -> Result<ChannelHandle> {
        std::future::pending().await
    }

    async fn release(&self, _id: &PeerId) {}
}

#[tokio::test]
async fn hung_handshake_times_out_per_attempt() {
    let sender = session(Arc::new(NeverSignaling), fast_config()).await;

    let start = std::time::Instant::now();
    let err = sender.conn.connect(PeerId::generate()).await.unwrap_err();
    assert!(matches!(err, Error::Connection { attempts: 3, .. }), "{err}");
    // Three 100ms timeouts plus two short backoffs.
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(sender.conn.state().await, ConnectionState::Error);
}

#[tokio::test]
async fn identifier_conflict_is_recovered_transparently() {
    let signaling = MemorySignaling::new();
    signaling.inject_conflicts(1);
    let receiver = session(Arc::clone(&signaling) as _, fast_config()).await;

    let code = receiver.conn.initialize().await.unwrap();
    assert_eq!(receiver.conn.state().await, ConnectionState::Waiting);

    // The regenerated identifier is fully usable.
    let sender = session(signaling as _, fast_config()).await;
    sender.conn.connect(code).await.unwrap();
    assert_eq!(sender.conn.state().await, ConnectionState::Connected);
}

// ── Mid-transfer drop & restart ──────────────────────────────────────────────

/// Wraps the loopback registry and fails the next N dials, so a reconnect
/// takes at least one backoff window instead of resolving instantly.
struct FlakySignaling {
    inner: Arc<MemorySignaling>,
    failures_left: AtomicU32,
}

#[async_trait]
impl Signaling for FlakySignaling {
    async fn register(&self, id: &PeerId) -> Result<mpsc::UnboundedReceiver<ChannelHandle>> {
        self.inner.register(id).await
    }

    async fn connect(&self, id: &PeerId) -> Result<ChannelHandle> {
        if self
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Connection {
                message: "simulated dial failure".into(),
                attempts: 1,
            });
        }
        self.inner.connect(id).await
    }

    async fn release(&self, id: &PeerId) {
        self.inner.release(id).await;
    }
}

#[tokio::test]
async fn dropped_connection_restarts_the_current_file_and_completes() {
    let memory = MemorySignaling::new();
    let flaky = Arc::new(FlakySignaling {
        inner: Arc::clone(&memory),
        failures_left: AtomicU32::new(0),
    });

    // Slow the sender down so the drop lands mid-file.
    let slow = TransferConfig {
        chunk_pacing: Duration::from_millis(5),
        initial_chunk_size: 16 * 1024,
        max_chunk_size: 16 * 1024,
        min_chunk_size: 16 * 1024,
        ..fast_config()
    };

    let receiver = session(Arc::clone(&memory) as _, slow.clone()).await;
    let code = receiver.conn.initialize().await.unwrap();
    receiver.engine.set_auto_accept(true);
    let mut recv_events = receiver.engine.subscribe().await;

    let sender = session(Arc::clone(&flaky) as _, slow.clone()).await;
    sender.conn.connect(code).await.unwrap();
    let mut conn_events = sender.conn.subscribe().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let payload = patterned(2 * 1024 * 1024);
    let file = OutgoingFile::new("archive.zip", "application/zip", payload.clone());

    let engine = sender.engine.clone();
    let sending = tokio::spawn(async move { engine.send_files(vec![file]).await });

    // Mid-transfer: kill the link and make the first re-dial fail.
    tokio::time::sleep(Duration::from_millis(60)).await;
    flaky.failures_left.store(1, Ordering::Release);
    memory.sever_all();

    let outcome = tokio::time::timeout(Duration::from_secs(10), sending)
        .await
        .expect("transfer hung")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, SendOutcome::Completed);

    // The manager reported the recovery.
    let mut saw_reconnecting = false;
    let mut saw_reconnected = false;
    while let Ok(event) = conn_events.try_recv() {
        match event {
            ConnectionEvent::Reconnecting { .. } => saw_reconnecting = true,
            ConnectionEvent::Reconnected => saw_reconnected = true,
            _ => {}
        }
    }
    assert!(saw_reconnecting);
    assert!(saw_reconnected);

    // The restarted file arrives byte-identical.
    loop {
        match next_event(&mut recv_events).await {
            TransferEvent::FileReceived { payload: got, .. } => {
                assert_eq!(&got[..], &payload[..]);
            }
            TransferEvent::TransferComplete => break,
            _ => {}
        }
    }
}

#[tokio::test]
async fn premature_transfer_complete_fails_outstanding_files() {
    let signaling = MemorySignaling::new();
    let receiver = session(Arc::clone(&signaling) as _, fast_config()).await;
    let code = receiver.conn.initialize().await.unwrap();
    receiver.engine.set_auto_accept(true);
    let mut events = receiver.engine.subscribe().await;

    // Drive the wire by hand from a bare channel: a misbehaving sender.
    let raw = signaling.connect(&code).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let meta = FileMetadata::new("cut-short.bin", 4, "application/octet-stream");
    let offer = ControlMessage::FileOffer {
        files: vec![meta.clone()],
        total_size: 4,
    };
    raw.channel
        .send(encode_control(&offer).unwrap())
        .await
        .unwrap();
    // Half the file, then completion with the file unfinished. Ordered
    // transport: nothing else can ever arrive for it.
    raw.channel
        .send(encode_chunk(meta.id, 0, b"ab"))
        .await
        .unwrap();
    raw.channel
        .send(encode_control(&ControlMessage::TransferComplete).unwrap())
        .await
        .unwrap();

    loop {
        match next_event(&mut events).await {
            TransferEvent::FileFailed { file_id, .. } => {
                assert_eq!(file_id, meta.id);
                break;
            }
            TransferEvent::TransferComplete => {
                panic!("completion emitted with an unfinished file")
            }
            _ => {}
        }
    }
    let snap = receiver.engine.progress_snapshot().await;
    assert!(snap.files.iter().all(|fp| fp.state == FileState::Failed));
}

#[tokio::test]
async fn sender_unblocks_when_peer_dies_before_answering() {
    let (sender, receiver) = connected_sessions(MemorySignaling::new(), fast_config()).await;
    let mut recv_events = receiver.engine.subscribe().await;

    let file = OutgoingFile::new(
        "pending.bin",
        "application/octet-stream",
        patterned(64 * 1024),
    );
    let engine = sender.engine.clone();
    let sending = tokio::spawn(async move { engine.send_files(vec![file]).await });

    // The offer lands, then the peer goes away without ever answering.
    loop {
        if let TransferEvent::OfferReceived { .. } = next_event(&mut recv_events).await {
            break;
        }
    }
    receiver.conn.destroy().await;

    let err = tokio::time::timeout(Duration::from_secs(5), sending)
        .await
        .expect("send_files stayed blocked after the connection died")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Connection { .. }), "{err}");
    assert_eq!(sender.conn.state().await, ConnectionState::Error);

    let snap = sender.engine.progress_snapshot().await;
    assert!(!snap.files.is_empty());
    assert!(snap.files.iter().all(|fp| fp.state == FileState::Failed));
}

#[tokio::test]
async fn failed_file_surfaces_first_error_and_suppresses_completion() {
    let slow = TransferConfig {
        chunk_pacing: Duration::from_millis(5),
        initial_chunk_size: 16 * 1024,
        max_chunk_size: 16 * 1024,
        min_chunk_size: 16 * 1024,
        ..fast_config()
    };
    let (sender, receiver) = connected_sessions(MemorySignaling::new(), slow).await;
    receiver.engine.set_auto_accept(true);
    let mut send_events = sender.engine.subscribe().await;

    let file = OutgoingFile::new(
        "doomed.bin",
        "application/octet-stream",
        patterned(1024 * 1024),
    );
    let engine = sender.engine.clone();
    let sending = tokio::spawn(async move { engine.send_files(vec![file]).await });

    // Kill the peer for good mid-file: the registration disappears with
    // it, so the reconnect budget runs out and the file fails.
    tokio::time::sleep(Duration::from_millis(50)).await;
    receiver.conn.destroy().await;

    let err = tokio::time::timeout(Duration::from_secs(10), sending)
        .await
        .expect("send task hung")
        .unwrap()
        .unwrap_err();
    // The per-file failure comes back, not a later connection error from
    // a completion message that should never have been attempted.
    assert!(matches!(err, Error::Transfer { .. }), "{err}");

    while let Ok(event) = send_events.try_recv() {
        assert!(
            !matches!(event, TransferEvent::TransferComplete),
            "completion declared for a failed transfer"
        );
    }
    let snap = sender.engine.progress_snapshot().await;
    assert!(snap.files.iter().all(|fp| fp.state == FileState::Failed));
}

// ── Pause / resume / cancel ──────────────────────────────────────────────────

#[tokio::test]
async fn paused_file_stops_sending_until_resumed() {
    let slow = TransferConfig {
        chunk_pacing: Duration::from_millis(5),
        initial_chunk_size: 16 * 1024,
        max_chunk_size: 16 * 1024,
        min_chunk_size: 16 * 1024,
        ..fast_config()
    };
    let (sender, receiver) = connected_sessions(MemorySignaling::new(), slow).await;
    receiver.engine.set_auto_accept(true);

    let file = OutgoingFile::new("movie.mkv", "video/x-matroska", patterned(1024 * 1024));
    let file_id = file.metadata.id;

    let engine = sender.engine.clone();
    let sending = tokio::spawn(async move { engine.send_files(vec![file]).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    sender.engine.pause_transfer(file_id).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let before = sender.engine.progress_snapshot().await.aggregate.transferred_bytes;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let after = sender.engine.progress_snapshot().await.aggregate.transferred_bytes;
    assert_eq!(before, after, "bytes moved while paused");
    assert!(after < 1024 * 1024, "file finished before the pause landed");

    sender.engine.resume_transfer(file_id).await;
    let outcome = tokio::time::timeout(Duration::from_secs(10), sending)
        .await
        .expect("transfer hung")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, SendOutcome::Completed);
}

#[tokio::test]
async fn cancel_all_aborts_both_sides() {
    let slow = TransferConfig {
        chunk_pacing: Duration::from_millis(5),
        initial_chunk_size: 16 * 1024,
        max_chunk_size: 16 * 1024,
        min_chunk_size: 16 * 1024,
        ..fast_config()
    };
    let (sender, receiver) = connected_sessions(MemorySignaling::new(), slow).await;
    receiver.engine.set_auto_accept(true);
    let mut recv_events = receiver.engine.subscribe().await;

    let file = OutgoingFile::new("backup.tar", "application/x-tar", patterned(2 * 1024 * 1024));
    let engine = sender.engine.clone();
    let sending = tokio::spawn(async move { engine.send_files(vec![file]).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    sender.engine.cancel_all().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), sending)
        .await
        .expect("send task hung")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, SendOutcome::Cancelled);

    // Receiver observes the cancellation and fails its in-flight file.
    loop {
        if let TransferEvent::Cancelled = next_event(&mut recv_events).await {
            break;
        }
    }
    let snap = receiver.engine.progress_snapshot().await;
    assert!(snap
        .files
        .iter()
        .all(|fp| fp.state == FileState::Failed || fp.state == FileState::Completed));
}

#[tokio::test]
async fn session_is_reusable_after_reset() {
    let (sender, receiver) = connected_sessions(MemorySignaling::new(), fast_config()).await;
    receiver.engine.set_auto_accept(true);
    let mut events = receiver.engine.subscribe().await;

    let first = OutgoingFile::new("a.txt", "text/plain", patterned(1000));
    assert_eq!(
        sender.engine.send_files(vec![first]).await.unwrap(),
        SendOutcome::Completed
    );
    loop {
        if let TransferEvent::TransferComplete = next_event(&mut events).await {
            break;
        }
    }

    sender.engine.reset().await;
    assert!(sender.engine.progress_snapshot().await.files.is_empty());
}
