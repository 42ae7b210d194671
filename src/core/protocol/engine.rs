//! Transfer engine: offer/accept negotiation, chunked sending with
//! adaptive sizing, receive-side reassembly, progress reporting.
//!
//! One engine per session, layered on a [`ConnectionManager`]. The engine
//! is the single consumer of the manager's inbound frame stream; the
//! embedding application only sees [`TransferEvent`]s and the public
//! operations below.
//!
//! File payloads are held in memory end to end ([`bytes::Bytes`] on both
//! sides), matching the offered-size bookkeeping in the wire protocol.

use crate::core::config::TransferConfig;
use crate::core::connection::{ConnectionManager, ConnectionState};
use crate::core::pipeline::chunk::{next_chunk_size, ChunkBounds, FileAssembly};
use crate::core::pipeline::progress::{
    aggregate, AggregateProgress, FileProgress, FileState, ProgressThrottle,
};
use crate::core::pipeline::throughput::ThroughputCalculator;
use crate::core::protocol::{self, ChunkFrame, ControlMessage, FileMetadata, Frame};
use crate::error::{Error, Result};
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Public surface ───────────────────────────────────────────────────────────

/// One file queued for sending: its descriptor plus the full payload.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl OutgoingFile {
    /// Build an outgoing file; size is taken from the payload so the
    /// offer can never disagree with what gets sent.
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            metadata: FileMetadata::new(name, data.len() as u64, mime_type),
            data,
        }
    }
}

/// How a [`TransferEngine::send_files`] call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every file was sent and acknowledged with a transfer-complete.
    Completed,
    /// The receiver declined the offer; nothing was sent.
    Rejected { reason: Option<String> },
    /// The session was cancelled mid-negotiation or mid-transfer.
    Cancelled,
}

/// Per-file plus session-wide progress, cloned out of the engine's
/// internal state at flush time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub files: Vec<FileProgress>,
    pub aggregate: AggregateProgress,
}

/// Notifications delivered to [`TransferEngine::subscribe`]rs.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A peer offered files; answer with
    /// [`accept_offer`](TransferEngine::accept_offer) or
    /// [`reject_offer`](TransferEngine::reject_offer).
    OfferReceived {
        files: Vec<FileMetadata>,
        total_size: u64,
    },
    /// The remote answered our offer.
    OfferAnswered {
        accepted: bool,
        reason: Option<String>,
    },
    /// Throttled progress flush.
    Progress(ProgressSnapshot),
    /// A file was fully received and reassembled.
    FileReceived {
        metadata: FileMetadata,
        payload: Bytes,
    },
    /// A file failed terminally (gap at completion, connection lost).
    FileFailed { file_id: Uuid, message: String },
    /// Every offered file arrived intact.
    TransferComplete,
    /// The session was cancelled; all in-flight state was discarded.
    Cancelled,
}

/// The remote's answer to a pending offer.
enum OfferAnswer {
    Accepted,
    Rejected(Option<String>),
}

/// In-flight receive state for one file.
struct ReceivingFile {
    assembly: FileAssembly,
    calc: ThroughputCalculator,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Drives file transfers over an established connection.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    conn: ConnectionManager,
    config: TransferConfig,
    progress: RwLock<HashMap<Uuid, FileProgress>>,
    throttle: StdMutex<ProgressThrottle>,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<TransferEvent>>>,
    paused: RwLock<HashSet<Uuid>>,
    /// Cancellation scope of the current transfer; replaced wholesale on
    /// cancel/reset so the next transfer starts with a fresh token.
    cancel: RwLock<SignalOfStop>,
    /// Resolver for the offer we sent and are awaiting an answer to.
    pending_answer: StdMutex<Option<oneshot::Sender<OfferAnswer>>>,
    /// Offer received from the peer, not yet answered.
    incoming_offer: RwLock<Option<Vec<FileMetadata>>>,
    /// Receive buffers keyed by file id.
    assemblies: RwLock<HashMap<Uuid, ReceivingFile>>,
    /// Metadata of every file the accepted inbound offer announced.
    expected: RwLock<HashMap<Uuid, FileMetadata>>,
    /// Files fully received this session.
    completed: RwLock<HashSet<Uuid>>,
    auto_accept: AtomicBool,
}

impl TransferEngine {
    /// Build the engine and start consuming the manager's frame stream.
    pub fn new(conn: ConnectionManager, config: TransferConfig) -> Self {
        let engine = Self {
            inner: Arc::new(EngineInner {
                throttle: StdMutex::new(ProgressThrottle::new(config.progress_throttle)),
                conn: conn.clone(),
                config,
                progress: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(Vec::new()),
                paused: RwLock::new(HashSet::new()),
                cancel: RwLock::new(SignalOfStop::new()),
                pending_answer: StdMutex::new(None),
                incoming_offer: RwLock::new(None),
                assemblies: RwLock::new(HashMap::new()),
                expected: RwLock::new(HashMap::new()),
                completed: RwLock::new(HashSet::new()),
                auto_accept: AtomicBool::new(false),
            }),
        };

        if let Some(frames) = conn.take_frames() {
            let recv = engine.clone();
            tokio::spawn(async move { recv.recv_loop(frames).await });
        } else {
            warn!(event = "engine_no_frames", "Frame stream already taken, receive side disabled");
        }
        engine
    }

    /// Subscribe to transfer events.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.write().await.push(tx);
        rx
    }

    /// Accept inbound offers without an explicit
    /// [`accept_offer`](Self::accept_offer) call.
    pub fn set_auto_accept(&self, enabled: bool) {
        self.inner.auto_accept.store(enabled, Ordering::Release);
    }

    /// Current progress of every file in the session.
    pub async fn progress_snapshot(&self) -> ProgressSnapshot {
        let progress = self.inner.progress.read().await;
        let files: Vec<FileProgress> = progress.values().cloned().collect();
        let aggregate = aggregate(files.iter());
        ProgressSnapshot { files, aggregate }
    }

    // ── Sending ───────────────────────────────────────────────────────────

    /// Offer `files` to the connected peer and, once accepted, send them
    /// sequentially with adaptive chunking.
    ///
    /// A single file failing mid-send does not abort its siblings; the
    /// first such error is returned after the rest were attempted.
    /// Connection loss beyond the retry budget aborts everything left.
    pub async fn send_files(&self, files: Vec<OutgoingFile>) -> Result<SendOutcome> {
        if files.is_empty() {
            return Err(Error::Protocol("offer contains no files".into()));
        }

        let metas: Vec<FileMetadata> = files.iter().map(|f| f.metadata.clone()).collect();
        let total_size: u64 = metas.iter().map(|m| m.size).sum();
        {
            let mut progress = self.inner.progress.write().await;
            for meta in &metas {
                progress.insert(meta.id, FileProgress::queued(meta));
            }
        }

        let (tx, rx) = oneshot::channel();
        *self
            .inner
            .pending_answer
            .lock()
            .expect("pending answer lock poisoned") = Some(tx);

        info!(event = "offer_sent", files = metas.len(), total_size, "Offering files");
        self.inner
            .conn
            .send(&ControlMessage::FileOffer {
                files: metas.clone(),
                total_size,
            })
            .await?;

        let cancel = self.inner.cancel.read().await.clone();
        let mut rx = rx;
        let answer = loop {
            let wait = tokio::time::timeout(self.inner.config.backpressure_poll, &mut rx);
            match cancel.select(wait).await {
                None | Some(Ok(Err(_))) => return Ok(SendOutcome::Cancelled),
                Some(Ok(Ok(answer))) => break answer,
                Some(Err(_elapsed)) => {
                    // The answer can only arrive over a live session; once
                    // the manager gives up, waiting longer is pointless.
                    let state = self.inner.conn.state().await;
                    if state.is_terminal() || state == ConnectionState::Idle {
                        self.inner
                            .pending_answer
                            .lock()
                            .expect("pending answer lock poisoned")
                            .take();
                        for meta in &metas {
                            self.fail_file(
                                meta.id,
                                "connection lost before the offer was answered".into(),
                            )
                            .await;
                        }
                        return Err(Error::connection(
                            "connection lost before the offer was answered",
                        ));
                    }
                }
            }
        };
        if let OfferAnswer::Rejected(reason) = answer {
            info!(event = "offer_rejected", ?reason, "Receiver declined the offer");
            let mut progress = self.inner.progress.write().await;
            for meta in &metas {
                progress.remove(&meta.id);
            }
            return Ok(SendOutcome::Rejected { reason });
        }

        info!(event = "offer_accepted", "Receiver accepted, starting transfer");
        self.inner.conn.mark_transferring().await;

        let mut first_failure: Option<Error> = None;
        for (pos, file) in files.iter().enumerate() {
            match self.send_one_file(file, &cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Ok(SendOutcome::Cancelled),
                Err(e @ Error::Transfer { .. }) => {
                    // This file is lost; siblings still get their turn.
                    self.fail_file(file.metadata.id, e.to_string()).await;
                    first_failure.get_or_insert(e);
                }
                Err(e) => {
                    // Connection-level failure: nothing further can be sent.
                    for remaining in &files[pos..] {
                        self.fail_file(remaining.metadata.id, e.to_string()).await;
                    }
                    first_failure.get_or_insert(e);
                    break;
                }
            }
        }

        match first_failure {
            // Completion is only declared when every file made it; a
            // partial session must not tell the peer "all files sent".
            None => {
                self.inner.conn.send(&ControlMessage::TransferComplete).await?;
                self.inner.conn.mark_completed().await;
                self.emit(TransferEvent::TransferComplete).await;
                info!(event = "transfer_complete", files = files.len(), "All files sent");
                Ok(SendOutcome::Completed)
            }
            Some(e) => Err(e),
        }
    }

    /// Send one file as a sequence of adaptively sized chunk frames,
    /// restarting it from zero if the connection drops and recovers.
    async fn send_one_file(&self, file: &OutgoingFile, cancel: &SignalOfStop) -> Result<()> {
        let meta = &file.metadata;
        let bounds = ChunkBounds {
            min: self.inner.config.min_chunk_size,
            max: self.inner.config.max_chunk_size,
        };

        self.set_file_state(meta.id, FileState::Sending).await;
        debug!(event = "file_send_start", file_id = %meta.id, name = %meta.name, size = meta.size);

        let mut calc = ThroughputCalculator::default();
        calc.record(0);
        let mut chunk_size = self.inner.config.initial_chunk_size;
        let mut offset: u64 = 0;
        let mut index: u32 = 0;

        loop {
            if cancel.cancelled() {
                return Err(Error::Cancelled);
            }
            while self.inner.paused.read().await.contains(&meta.id) {
                if !cancel.sleep(self.inner.config.pause_poll).await {
                    return Err(Error::Cancelled);
                }
            }

            let end = (offset + chunk_size as u64).min(meta.size);
            let payload = file.data.slice(offset as usize..end as usize);
            let frame = protocol::encode_chunk(meta.id, index, &payload);

            match self.inner.conn.send_binary(frame).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    debug!(event = "chunk_send_failed", file_id = %meta.id, index, error = %e);
                    self.await_reconnect(meta.id, cancel).await?;
                    // The receiver's partial buffer is void; start over.
                    let _ = self
                        .inner
                        .conn
                        .send(&ControlMessage::FileRestart { file_id: meta.id })
                        .await;
                    info!(event = "file_restarted", file_id = %meta.id, "Resending from the first chunk");
                    calc.reset();
                    calc.record(0);
                    chunk_size = self.inner.config.initial_chunk_size;
                    offset = 0;
                    index = 0;
                    let mut fresh = FileProgress::queued(meta);
                    fresh.set_state(FileState::Sending);
                    self.inner.progress.write().await.insert(meta.id, fresh);
                    continue;
                }
            }

            let sent = end - offset;
            offset = end;
            index += 1;
            calc.record(sent);
            chunk_size = next_chunk_size(chunk_size, calc.speed(), bounds);
            self.push_progress(meta.id, offset, &calc, meta.size).await;

            if offset >= meta.size {
                break;
            }
            if !cancel.sleep(self.inner.config.chunk_pacing).await {
                return Err(Error::Cancelled);
            }
        }

        self.inner
            .conn
            .send(&ControlMessage::FileComplete {
                file_id: meta.id,
                chunk_count: index,
                checksum: None,
            })
            .await
            .map_err(|e| Error::transfer(meta.id, e.to_string()))?;

        self.set_file_state(meta.id, FileState::Completed).await;
        info!(event = "file_sent", file_id = %meta.id, name = %meta.name, chunks = index);
        Ok(())
    }

    /// Wait for the manager to restore the channel after a drop.
    ///
    /// The manager's retry loop runs in the background; this just
    /// observes its outcome. Terminal states mean the file is lost.
    async fn await_reconnect(&self, file_id: Uuid, cancel: &SignalOfStop) -> Result<()> {
        loop {
            if cancel.cancelled() {
                return Err(Error::Cancelled);
            }
            let state = self.inner.conn.state().await;
            match state {
                ConnectionState::Connected | ConnectionState::Transferring
                    if self.inner.conn.is_channel_open().await =>
                {
                    return Ok(());
                }
                ConnectionState::Error | ConnectionState::Completed | ConnectionState::Idle => {
                    return Err(Error::transfer(
                        file_id,
                        format!("connection lost and not recovered (state {state:?})"),
                    ));
                }
                _ => {
                    if !cancel.sleep(self.inner.config.backpressure_poll).await {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }

    // ── Receiving ─────────────────────────────────────────────────────────

    async fn recv_loop(self, mut frames: mpsc::UnboundedReceiver<Frame>) {
        let sos = self.inner.conn.stop_signal();
        loop {
            let frame = tokio::select! {
                f = frames.recv() => f,
                _ = sos.wait() => None,
            };
            let Some(frame) = frame else { break };
            self.handle_frame(frame).await;
        }
        debug!(event = "recv_loop_stopped", "Frame stream ended");
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Control(msg) => self.handle_control(msg).await,
            Frame::Chunk(chunk) => self.handle_chunk(chunk).await,
        }
    }

    async fn handle_control(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::FileOffer { files, total_size } => {
                info!(event = "offer_received", files = files.len(), total_size);
                {
                    let mut expected = self.inner.expected.write().await;
                    let mut progress = self.inner.progress.write().await;
                    for meta in &files {
                        expected.insert(meta.id, meta.clone());
                        progress.insert(meta.id, FileProgress::queued(meta));
                    }
                }
                *self.inner.incoming_offer.write().await = Some(files.clone());
                self.emit(TransferEvent::OfferReceived { files, total_size })
                    .await;
                if self.inner.auto_accept.load(Ordering::Acquire) {
                    if let Err(e) = self.accept_offer().await {
                        warn!(event = "auto_accept_failed", error = %e);
                    }
                }
            }
            ControlMessage::FileAccept => {
                self.resolve_answer(OfferAnswer::Accepted).await;
                self.emit(TransferEvent::OfferAnswered {
                    accepted: true,
                    reason: None,
                })
                .await;
            }
            ControlMessage::FileReject { reason } => {
                self.resolve_answer(OfferAnswer::Rejected(reason.clone()))
                    .await;
                self.emit(TransferEvent::OfferAnswered {
                    accepted: false,
                    reason,
                })
                .await;
            }
            ControlMessage::FileRestart { file_id } => {
                let Some(meta) = self.inner.expected.read().await.get(&file_id).cloned() else {
                    warn!(event = "restart_unknown_file", %file_id, "Ignoring restart for unknown file");
                    return;
                };
                info!(event = "file_restart_received", %file_id, "Discarding partial buffer");
                self.inner.assemblies.write().await.insert(
                    file_id,
                    ReceivingFile {
                        assembly: FileAssembly::new(file_id, meta.size),
                        calc: ThroughputCalculator::default(),
                    },
                );
                let mut fresh = FileProgress::queued(&meta);
                fresh.set_state(FileState::Receiving);
                self.inner.progress.write().await.insert(file_id, fresh);
            }
            ControlMessage::FileComplete {
                file_id,
                chunk_count,
                ..
            } => self.finish_file(file_id, chunk_count).await,
            ControlMessage::TransferComplete => {
                let outstanding: Vec<Uuid> = {
                    let expected = self.inner.expected.read().await;
                    let completed = self.inner.completed.read().await;
                    expected
                        .keys()
                        .filter(|id| !completed.contains(*id))
                        .copied()
                        .collect()
                };
                let any_expected = !self.inner.expected.read().await.is_empty();
                if any_expected && outstanding.is_empty() {
                    info!(event = "transfer_complete", "All offered files received");
                    self.inner.conn.mark_completed().await;
                    self.emit(TransferEvent::TransferComplete).await;
                } else {
                    // The transport is ordered, so nothing can still
                    // arrive for these files: they are lost, not late.
                    warn!(
                        event = "premature_transfer_complete",
                        outstanding = outstanding.len(),
                        "Peer declared completion with files outstanding"
                    );
                    for file_id in outstanding {
                        self.inner.assemblies.write().await.remove(&file_id);
                        self.fail_file(
                            file_id,
                            "sender declared completion before the file finished".into(),
                        )
                        .await;
                    }
                }
            }
            ControlMessage::TransferCancel => {
                info!(event = "cancel_received", "Peer cancelled the session");
                self.clear_session().await;
            }
        }
    }

    async fn handle_chunk(&self, chunk: ChunkFrame) {
        let Some(meta) = self.inner.expected.read().await.get(&chunk.file_id).cloned() else {
            // Never fatal: a cancelled file's stragglers may still arrive.
            warn!(event = "chunk_unknown_file", file_id = %chunk.file_id, "Ignoring chunk for unknown file");
            return;
        };

        self.inner.conn.mark_transferring().await;

        let received = {
            let mut assemblies = self.inner.assemblies.write().await;
            let entry = assemblies
                .entry(chunk.file_id)
                .or_insert_with(|| ReceivingFile {
                    assembly: FileAssembly::new(chunk.file_id, meta.size),
                    calc: {
                        let mut c = ThroughputCalculator::default();
                        c.record(0);
                        c
                    },
                });
            let len = chunk.payload.len() as u64;
            if !entry.assembly.insert(chunk.index, chunk.payload) {
                None
            } else {
                entry.calc.record(len);
                Some((entry.assembly.received_bytes(), entry.calc.clone()))
            }
        };

        if let Some((bytes, calc)) = received {
            {
                let mut progress = self.inner.progress.write().await;
                if let Some(fp) = progress.get_mut(&chunk.file_id) {
                    if fp.state == FileState::Queued {
                        fp.set_state(FileState::Receiving);
                    }
                }
            }
            self.push_progress(chunk.file_id, bytes, &calc, meta.size)
                .await;
        }
    }

    /// Run the gap check and finalize a received file.
    async fn finish_file(&self, file_id: Uuid, chunk_count: u32) {
        let Some(meta) = self.inner.expected.read().await.get(&file_id).cloned() else {
            warn!(event = "complete_unknown_file", %file_id, "Ignoring completion for unknown file");
            return;
        };
        let Some(receiving) = self.inner.assemblies.write().await.remove(&file_id) else {
            self.fail_file(file_id, "file completed before any chunk arrived".into())
                .await;
            return;
        };

        match receiving.assembly.finalize(chunk_count) {
            Ok(payload) => {
                self.inner.completed.write().await.insert(file_id);
                self.set_file_state(file_id, FileState::Completed).await;
                info!(event = "file_received", %file_id, name = %meta.name, bytes = payload.len());
                self.emit(TransferEvent::FileReceived {
                    metadata: meta,
                    payload,
                })
                .await;
            }
            Err(e) => {
                warn!(event = "file_finalize_failed", %file_id, error = %e);
                self.fail_file(file_id, e.to_string()).await;
            }
        }
    }

    // ── Offer answers & session control ───────────────────────────────────

    /// Accept the pending inbound offer; chunks start flowing afterwards.
    pub async fn accept_offer(&self) -> Result<()> {
        let Some(files) = self.inner.incoming_offer.write().await.take() else {
            return Err(Error::Protocol("no pending offer to accept".into()));
        };
        info!(event = "offer_accept", files = files.len());
        self.inner.conn.send(&ControlMessage::FileAccept).await
    }

    /// Decline the pending inbound offer and drop its bookkeeping.
    pub async fn reject_offer(&self, reason: Option<String>) -> Result<()> {
        let Some(files) = self.inner.incoming_offer.write().await.take() else {
            return Err(Error::Protocol("no pending offer to reject".into()));
        };
        info!(event = "offer_reject", files = files.len(), ?reason);
        {
            let mut expected = self.inner.expected.write().await;
            let mut progress = self.inner.progress.write().await;
            for meta in &files {
                expected.remove(&meta.id);
                progress.remove(&meta.id);
            }
        }
        self.inner
            .conn
            .send(&ControlMessage::FileReject { reason })
            .await
    }

    /// Suspend the sending loop of one file. Chunks stop within one poll
    /// interval; the peer is not informed.
    pub async fn pause_transfer(&self, file_id: Uuid) {
        self.inner.paused.write().await.insert(file_id);
        debug!(event = "file_paused", %file_id);
    }

    /// Resume a paused file.
    pub async fn resume_transfer(&self, file_id: Uuid) {
        self.inner.paused.write().await.remove(&file_id);
        debug!(event = "file_resumed", %file_id);
    }

    /// Cancel the whole session: notify the peer (best effort), unblock
    /// every in-flight operation, and discard transfer state.
    pub async fn cancel_all(&self) {
        info!(event = "cancel_all", "Cancelling session");
        let _ = self.inner.conn.send(&ControlMessage::TransferCancel).await;
        self.clear_session().await;
    }

    /// Discard all per-transfer state so the session can be reused for a
    /// new offer. Keeps the connection itself.
    async fn clear_session(&self) {
        // Cancel in-flight sends first, then install a fresh scope.
        {
            let mut cancel = self.inner.cancel.write().await;
            cancel.cancel();
            *cancel = SignalOfStop::new();
        }
        self.inner
            .pending_answer
            .lock()
            .expect("pending answer lock poisoned")
            .take();
        self.inner.incoming_offer.write().await.take();
        self.inner.assemblies.write().await.clear();
        self.inner.paused.write().await.clear();

        let failed: Vec<Uuid> = {
            let progress = self.inner.progress.read().await;
            progress
                .values()
                .filter(|fp| !fp.state.is_terminal())
                .map(|fp| fp.file_id)
                .collect()
        };
        for file_id in failed {
            self.set_file_state(file_id, FileState::Failed).await;
        }
        self.emit(TransferEvent::Cancelled).await;
    }

    /// Full reset: clear transfer state and progress history.
    pub async fn reset(&self) {
        self.clear_session().await;
        self.inner.progress.write().await.clear();
        self.inner.expected.write().await.clear();
        self.inner.completed.write().await.clear();
        self.inner
            .throttle
            .lock()
            .expect("throttle lock poisoned")
            .clear();
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn resolve_answer(&self, answer: OfferAnswer) {
        let pending = self
            .inner
            .pending_answer
            .lock()
            .expect("pending answer lock poisoned")
            .take();
        match pending {
            Some(tx) => {
                let _ = tx.send(answer);
            }
            None => warn!(event = "unexpected_answer", "Offer answer with no offer pending"),
        }
    }

    /// Record a byte-count update for a file and flush through the
    /// throttle.
    async fn push_progress(
        &self,
        file_id: Uuid,
        bytes: u64,
        calc: &ThroughputCalculator,
        total: u64,
    ) {
        let updated = {
            let mut progress = self.inner.progress.write().await;
            let Some(fp) = progress.get_mut(&file_id) else {
                return;
            };
            fp.update(bytes, calc.speed(), calc.eta(total.saturating_sub(bytes)));
            fp.clone()
        };
        self.flush_progress(updated).await;
    }

    /// Move a file to `state` and flush. Terminal states bypass the
    /// throttle window.
    async fn set_file_state(&self, file_id: Uuid, state: FileState) {
        let updated = {
            let mut progress = self.inner.progress.write().await;
            let Some(fp) = progress.get_mut(&file_id) else {
                return;
            };
            fp.set_state(state);
            fp.clone()
        };
        self.flush_progress(updated).await;
    }

    async fn fail_file(&self, file_id: Uuid, message: String) {
        self.set_file_state(file_id, FileState::Failed).await;
        self.emit(TransferEvent::FileFailed { file_id, message })
            .await;
    }

    async fn flush_progress(&self, update: FileProgress) {
        let due = {
            let mut throttle = self.inner.throttle.lock().expect("throttle lock poisoned");
            !throttle.offer(update, Instant::now()).is_empty()
        };
        if due {
            let snapshot = self.progress_snapshot().await;
            self.emit(TransferEvent::Progress(snapshot)).await;
        }
    }

    async fn emit(&self, event: TransferEvent) {
        let mut subs = self.inner.subscribers.write().await;
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::MemorySignaling;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config() -> TransferConfig {
        TransferConfig {
            retry_base_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(200),
            backpressure_poll: Duration::from_millis(5),
            chunk_pacing: Duration::ZERO,
            pause_poll: Duration::from_millis(5),
            progress_throttle: Duration::from_millis(10),
            ..TransferConfig::default()
        }
    }

    async fn connected_pair() -> (TransferEngine, TransferEngine) {
        let signaling = MemorySignaling::new();
        let recv_conn =
            ConnectionManager::new(Arc::clone(&signaling) as _, fast_config());
        let send_conn = ConnectionManager::new(signaling, fast_config());

        let id = recv_conn.initialize().await.unwrap();
        let receiver = TransferEngine::new(recv_conn, fast_config());
        send_conn.connect(id).await.unwrap();
        let sender = TransferEngine::new(send_conn, fast_config());
        // Let the passive side attach its inbound channel.
        tokio::time::sleep(Duration::from_millis(20)).await;
        (sender, receiver)
    }

    #[tokio::test]
    async fn single_file_round_trip() {
        let (sender, receiver) = connected_pair().await;
        receiver.set_auto_accept(true);
        let mut events = receiver.subscribe().await;

        let payload: Vec<u8> = (0u8..=255).cycle().take(200_000).collect();
        let file = OutgoingFile::new("photo.jpg", "image/jpeg", Bytes::from(payload.clone()));
        let expected_id = file.metadata.id;

        let outcome = sender.send_files(vec![file]).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed);

        let mut received = None;
        let mut complete = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(2), events.recv()).await
        {
            match event {
                TransferEvent::FileReceived { metadata, payload } => {
                    assert_eq!(metadata.id, expected_id);
                    received = Some(payload);
                }
                TransferEvent::TransferComplete => {
                    complete = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(complete, "transfer never completed");
        assert_eq!(&received.unwrap()[..], &payload[..]);
    }

    #[tokio::test]
    async fn empty_file_still_transfers() {
        let (sender, receiver) = connected_pair().await;
        receiver.set_auto_accept(true);
        let mut events = receiver.subscribe().await;

        let file = OutgoingFile::new("empty.txt", "text/plain", Bytes::new());
        let outcome = sender.send_files(vec![file]).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed);

        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out")
                .expect("event stream ended");
            if let TransferEvent::FileReceived { payload, .. } = event {
                assert!(payload.is_empty());
                break;
            }
        }
    }

    #[tokio::test]
    async fn rejected_offer_sends_nothing() {
        let (sender, receiver) = connected_pair().await;
        let mut recv_events = receiver.subscribe().await;

        let answerer = tokio::spawn(async move {
            loop {
                match recv_events.recv().await {
                    Some(TransferEvent::OfferReceived { .. }) => {
                        receiver
                            .reject_offer(Some("no thanks".into()))
                            .await
                            .unwrap();
                        return receiver;
                    }
                    Some(_) => continue,
                    None => panic!("event stream ended before offer"),
                }
            }
        });

        let file = OutgoingFile::new("huge.bin", "application/octet-stream", Bytes::from(vec![0u8; 50_000]));
        let outcome = sender.send_files(vec![file]).await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Rejected {
                reason: Some("no thanks".into())
            }
        );

        let receiver = answerer.await.unwrap();
        // Receiver dropped its bookkeeping along with the offer.
        assert!(receiver.progress_snapshot().await.files.is_empty());
        assert!(sender.progress_snapshot().await.files.is_empty());
    }

    #[tokio::test]
    async fn offer_with_no_files_is_rejected_locally() {
        let (sender, _receiver) = connected_pair().await;
        let err = sender.send_files(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn accept_without_offer_fails() {
        let (sender, _receiver) = connected_pair().await;
        assert!(sender.accept_offer().await.is_err());
        assert!(sender.reject_offer(None).await.is_err());
    }
}
