//! Connection management: one peer link per session and its lifecycle.
//!
//! The [`ConnectionManager`] owns the signaling handshake, the open data
//! channel, the session state machine, and the retry policy. The transfer
//! engine never touches the transport directly; every frame goes through
//! [`send`](ConnectionManager::send) /
//! [`send_binary`](ConnectionManager::send_binary).
//!
//! # State machine
//!
//! ```text
//! Idle ──initialize()──► Connecting ──registered──► Waiting ──inbound──► Connected
//!   │                        │
//!   └────connect(remote)─────┴──channel open──► Connected ──chunks──► Transferring
//!
//! Transferring ──all files──► Completed
//! non-terminal ──failure──► Connecting (bounded retries) ──exhausted──► Error
//! Error/Completed ──reset()──► Idle (fresh identifier)
//! ```

pub mod identifier;
pub mod memory;
pub mod transport;

use crate::core::config::TransferConfig;
use crate::core::connection::identifier::PeerId;
use crate::core::connection::transport::{ChannelEvent, ChannelHandle, DataChannel, Signaling};
use crate::core::protocol::{self, ControlMessage, Frame};
use crate::error::{Error, Result, SignalingError};
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

// ── States & events ──────────────────────────────────────────────────────────

/// Lifecycle state of the session's connection. Exactly one per session,
/// owned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No identifier, no channel.
    Idle,
    /// Registering, dialing, or reconnecting.
    Connecting,
    /// Local identifier registered; ready to be connected to.
    Waiting,
    /// Data channel open, no chunk activity yet.
    Connected,
    /// Chunks are flowing.
    Transferring,
    /// All offered files delivered. Terminal; no automatic retry.
    Completed,
    /// Unrecoverable failure (retry budget exhausted, conflict repeat,
    /// passive-side drop). Terminal until an explicit reset.
    Error,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Completed | ConnectionState::Error)
    }
}

/// Notifications delivered to [`ConnectionManager::subscribe`]rs.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A retry is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// A dropped connection was re-established.
    Reconnected,
    /// Terminal failure, after retries were exhausted.
    Failed(String),
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Owns one peer-to-peer connection at a time and its lifecycle.
///
/// Cheap to clone; clones share the session. Constructed per transfer
/// context (there is no global instance) so multiple simulated
/// sessions can coexist in one process.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    signaling: Arc<dyn Signaling>,
    config: TransferConfig,
    state: RwLock<ConnectionState>,
    local_id: RwLock<Option<PeerId>>,
    remote_id: RwLock<Option<PeerId>>,
    channel: RwLock<Option<Arc<dyn DataChannel>>>,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
    /// Decoded inbound frames, consumed by the transfer engine. The
    /// sender half lives for the whole session so the stream survives
    /// reconnects.
    frame_tx: mpsc::UnboundedSender<Frame>,
    frame_rx: StdMutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    /// Guard: only one outbound attempt may be in flight.
    dialing: AtomicBool,
    /// Channel generation; bumped on attach/teardown so pumps spawned
    /// for a previous channel exit without side effects.
    epoch: AtomicU64,
    sos: SignalOfStop,
}

impl ConnectionManager {
    pub fn new(signaling: Arc<dyn Signaling>, config: TransferConfig) -> Self {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                signaling,
                config,
                state: RwLock::new(ConnectionState::Idle),
                local_id: RwLock::new(None),
                remote_id: RwLock::new(None),
                channel: RwLock::new(None),
                subscribers: RwLock::new(Vec::new()),
                frame_tx,
                frame_rx: StdMutex::new(Some(frame_rx)),
                dialing: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                sos: SignalOfStop::new(),
            }),
        }
    }

    // ── Observation ───────────────────────────────────────────────────────

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn local_id(&self) -> Option<PeerId> {
        self.inner.local_id.read().await.clone()
    }

    /// Subscribe to lifecycle events. Dropped receivers are pruned on
    /// the next emission; no explicit unsubscribe needed.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.write().await.push(tx);
        rx
    }

    /// Take the inbound frame stream. Yields `Some` exactly once; the
    /// transfer engine is the single consumer.
    pub fn take_frames(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.inner
            .frame_rx
            .lock()
            .expect("frame receiver lock poisoned")
            .take()
    }

    /// Whether a channel is attached and open right now.
    pub async fn is_channel_open(&self) -> bool {
        self.inner
            .channel
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.is_open())
    }

    pub(crate) fn stop_signal(&self) -> SignalOfStop {
        self.inner.sos.clone()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Claim a fresh local identifier and start listening for inbound
    /// connections.
    ///
    /// An identifier conflict is recovered once by regenerating, not
    /// counted against the connect-retry budget; a second conflict
    /// surfaces as a signaling error and moves the session to `Error`.
    pub async fn initialize(&self) -> Result<PeerId> {
        self.set_state(ConnectionState::Connecting).await;

        let mut regenerated = false;
        loop {
            let id = PeerId::generate();
            match self.inner.signaling.register(&id).await {
                Ok(inbound) => {
                    *self.inner.local_id.write().await = Some(id.clone());
                    self.spawn_accept_loop(inbound);
                    self.set_state(ConnectionState::Waiting).await;
                    info!(event = "session_registered", %id, "Local identifier registered");
                    return Ok(id);
                }
                Err(Error::Signaling(SignalingError::IdentifierTaken(taken)))
                    if !regenerated =>
                {
                    warn!(event = "identifier_conflict", id = %taken, "Identifier taken, regenerating once");
                    regenerated = true;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Error).await;
                    self.emit(ConnectionEvent::Failed(e.to_string())).await;
                    return Err(e);
                }
            }
        }
    }

    /// Dial a remote peer. Only one outbound attempt may be in flight
    /// per manager; the open handshake must finish within the configured
    /// timeout, and failures are retried with exponential backoff up to
    /// the budget.
    pub async fn connect(&self, remote: PeerId) -> Result<()> {
        if self.inner.dialing.swap(true, Ordering::AcqRel) {
            return Err(Error::connection("an outbound attempt is already in flight"));
        }
        *self.inner.remote_id.write().await = Some(remote.clone());
        self.set_state(ConnectionState::Connecting).await;
        let result = self.connect_with_retries(remote, false).await;
        self.inner.dialing.store(false, Ordering::Release);
        result
    }

    /// Dial with the bounded-backoff retry policy. `reconnect` marks a
    /// mid-session re-dial (emits `Reconnected` on success).
    async fn connect_with_retries(&self, remote: PeerId, reconnect: bool) -> Result<()> {
        let max = self.inner.config.max_connect_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max {
            if self.inner.sos.cancelled() {
                return Err(Error::Cancelled);
            }

            let dial = tokio::time::timeout(
                self.inner.config.connect_timeout,
                self.inner.signaling.connect(&remote),
            );
            match self.inner.sos.select(dial).await {
                None => return Err(Error::Cancelled),
                Some(Ok(Ok(handle))) => {
                    self.attach(handle).await;
                    if reconnect {
                        info!(event = "reconnected", %remote, attempt, "Connection re-established");
                        self.emit(ConnectionEvent::Reconnected).await;
                    } else {
                        info!(event = "connected", %remote, attempt, "Connection established");
                    }
                    return Ok(());
                }
                Some(Ok(Err(e))) => last_error = e.to_string(),
                Some(Err(_elapsed)) => {
                    last_error = format!(
                        "open handshake timed out after {:?}",
                        self.inner.config.connect_timeout
                    );
                }
            }

            if attempt < max {
                let delay = self.inner.config.retry_delay(attempt);
                warn!(
                    event = "connect_retry",
                    %remote, attempt, max, delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Connection attempt failed, backing off"
                );
                self.emit(ConnectionEvent::Reconnecting { attempt, delay })
                    .await;
                if !self.inner.sos.sleep(delay).await {
                    return Err(Error::Cancelled);
                }
            }
        }

        warn!(event = "connect_exhausted", %remote, attempts = max, error = %last_error, "Retry budget exhausted");
        self.set_state(ConnectionState::Error).await;
        self.emit(ConnectionEvent::Failed(last_error.clone())).await;
        Err(Error::Connection {
            message: last_error,
            attempts: max,
        })
    }

    /// Install an open channel and start pumping its events.
    ///
    /// Boxed: the reconnect path is recursive (the pump ends in
    /// `handle_channel_down`, which dials again and re-attaches), so one
    /// edge of the cycle must be type-erased.
    fn attach(&self, handle: ChannelHandle) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            *self.inner.channel.write().await = Some(Arc::clone(&handle.channel));
            self.set_state(ConnectionState::Connected).await;

            let manager = self.clone();
            let mut events = handle.events;
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        ev = events.recv() => ev,
                        _ = manager.inner.sos.wait() => None,
                    };
                    match event {
                        Some(ChannelEvent::Message(bytes)) => match protocol::decode(bytes) {
                            Ok(frame) => {
                                if manager.inner.frame_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                            // Malformed frames are logged and ignored, not
                            // fatal to the session.
                            Err(e) => warn!(event = "frame_decode_failed", error = %e, "Ignoring malformed frame"),
                        },
                        Some(ChannelEvent::Closed) | None => break,
                    }
                }
                manager.handle_channel_down(epoch).await;
            });
        })
    }

    /// Listen for inbound connections on the registered identifier.
    fn spawn_accept_loop(&self, mut inbound: mpsc::UnboundedReceiver<ChannelHandle>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let handle = tokio::select! {
                    h = inbound.recv() => h,
                    _ = manager.inner.sos.wait() => None,
                };
                let Some(handle) = handle else { break };

                if manager.is_channel_open().await {
                    warn!(event = "inbound_rejected", "Already connected, closing extra inbound channel");
                    handle.channel.close().await;
                    continue;
                }
                debug!(event = "inbound_accepted", "Inbound connection attached");
                manager.attach(handle).await;
            }
        });
    }

    /// React to a channel going down. Retries while the session is
    /// non-terminal and this side initiated the link; the passive side
    /// cannot re-dial and fails instead.
    async fn handle_channel_down(&self, epoch: u64) {
        if self.inner.epoch.load(Ordering::Acquire) != epoch {
            // A newer channel replaced this one; nothing to do.
            return;
        }
        self.inner.channel.write().await.take();

        let state = self.state().await;
        if state.is_terminal() || state == ConnectionState::Idle {
            return;
        }

        let remote = self.inner.remote_id.read().await.clone();
        match remote {
            Some(remote) => {
                warn!(event = "channel_lost", %remote, "Channel closed unexpectedly, retrying");
                self.set_state(ConnectionState::Connecting).await;
                let manager = self.clone();
                tokio::spawn(async move {
                    let _ = manager.connect_with_retries(remote, true).await;
                });
            }
            None => {
                // Passive side cannot re-dial. With a live registration it
                // goes back to listening; otherwise the session is dead.
                if self.inner.local_id.read().await.is_some() {
                    warn!(event = "channel_lost", "Channel closed by peer, listening again");
                    self.set_state(ConnectionState::Waiting).await;
                } else {
                    warn!(event = "channel_lost", "Channel closed and no remote to re-dial");
                    self.set_state(ConnectionState::Error).await;
                    self.emit(ConnectionEvent::Failed("connection closed by peer".into()))
                        .await;
                }
            }
        }
    }

    // ── Sending ───────────────────────────────────────────────────────────

    /// Deliver a structured control message. Reports failure (it never
    /// panics or blocks) when the channel is not open. Messages are
    /// delivered in send order by the transport contract.
    pub async fn send(&self, msg: &ControlMessage) -> Result<()> {
        let channel = self.open_channel().await?;
        channel.send(protocol::encode_control(msg)?).await
    }

    /// Send a raw chunk frame with backpressure: suspends (polling, and
    /// observing cancellation) while the outbound buffer sits above the
    /// high-water mark, and reports failure if the channel closes before
    /// it drains.
    pub async fn send_binary(&self, frame: Bytes) -> Result<()> {
        let channel = self.open_channel().await?;
        wait_for_buffer_space(
            channel.as_ref(),
            frame.len(),
            &self.inner.config,
            &self.inner.sos,
        )
        .await?;
        channel.send(frame).await
    }

    async fn open_channel(&self) -> Result<Arc<dyn DataChannel>> {
        let guard = self.inner.channel.read().await;
        match guard.as_ref() {
            Some(c) if c.is_open() => Ok(Arc::clone(c)),
            _ => Err(Error::connection("data channel is not open")),
        }
    }

    // ── Engine hooks ──────────────────────────────────────────────────────

    /// First chunk activity: `Connected` → `Transferring`.
    pub async fn mark_transferring(&self) {
        let mut state = self.inner.state.write().await;
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Transferring;
            drop(state);
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Transferring))
                .await;
        }
    }

    /// All files delivered: `Transferring`/`Connected` → `Completed`.
    /// No retry fires after this point.
    pub async fn mark_completed(&self) {
        let mut state = self.inner.state.write().await;
        if matches!(
            *state,
            ConnectionState::Transferring | ConnectionState::Connected
        ) {
            *state = ConnectionState::Completed;
            drop(state);
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Completed))
                .await;
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    /// Close the channel and release the identifier. Idempotent: a
    /// second call has no additional effect.
    pub async fn disconnect(&self) {
        // Invalidate pumps first so the close is not mistaken for a
        // network drop.
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);

        if let Some(channel) = self.inner.channel.write().await.take() {
            channel.close().await;
        }
        if let Some(id) = self.inner.local_id.write().await.take() {
            self.inner.signaling.release(&id).await;
        }
        self.inner.remote_id.write().await.take();

        if self.state().await != ConnectionState::Idle {
            self.set_state(ConnectionState::Idle).await;
            info!(event = "session_disconnected", "Session torn down");
        }
    }

    /// Tear down and reinitialize with a fresh identifier.
    pub async fn reset(&self) -> Result<PeerId> {
        self.disconnect().await;
        self.initialize().await
    }

    /// Final teardown: cancels every pending suspension and closes the
    /// session. The manager is unusable afterwards.
    pub async fn destroy(&self) {
        self.inner.sos.cancel();
        self.disconnect().await;
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.inner.state.write().await;
        if *state == next {
            return;
        }
        debug!(event = "state_change", from = ?*state, to = ?next);
        *state = next;
        drop(state);
        self.emit(ConnectionEvent::StateChanged(next)).await;
    }

    async fn emit(&self, event: ConnectionEvent) {
        let mut subs = self.inner.subscribers.write().await;
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Poll until the channel's outbound buffer has room for `frame_len`
/// more bytes. Fails, rather than blocking forever, when the channel
/// closes or the session is cancelled mid-wait.
pub(crate) async fn wait_for_buffer_space(
    channel: &dyn DataChannel,
    frame_len: usize,
    config: &TransferConfig,
    sos: &SignalOfStop,
) -> Result<()> {
    loop {
        if !channel.is_open() {
            return Err(Error::connection("channel closed during backpressure wait"));
        }
        if channel.buffered_amount().await + frame_len <= config.buffered_amount_high {
            return Ok(());
        }
        debug!(
            event = "backpressure",
            high_watermark = config.buffered_amount_high,
            "Outbound buffer above high-water mark, waiting"
        );
        if !sos.sleep(config.backpressure_poll).await {
            return Err(Error::Cancelled);
        }
    }
}
