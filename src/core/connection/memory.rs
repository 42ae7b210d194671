//! Loopback transport: in-process channels behind the transport traits.
//!
//! Serves the integration tests and single-process embedders. Besides the
//! plain happy path it can simulate the failure modes the engine must
//! handle: registration conflicts ([`MemorySignaling::inject_conflicts`]),
//! unreachable peers (dialing an unregistered identifier), outbound
//! buffer pressure ([`MemoryChannel::set_buffered_amount`]), and network
//! drops ([`MemorySignaling::sever_all`]).

use crate::core::connection::identifier::PeerId;
use crate::core::connection::transport::{ChannelEvent, ChannelHandle, DataChannel, Signaling};
use crate::error::{Error, Result, SignalingError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

// ── Link ─────────────────────────────────────────────────────────────────────

/// Shared state of one channel pair. Closing either half closes both.
struct LinkState {
    open: AtomicBool,
    to_left: mpsc::UnboundedSender<ChannelEvent>,
    to_right: mpsc::UnboundedSender<ChannelEvent>,
}

impl LinkState {
    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.to_left.send(ChannelEvent::Closed);
            let _ = self.to_right.send(ChannelEvent::Closed);
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

/// One half of a loopback channel.
pub struct MemoryChannel {
    link: Arc<LinkState>,
    side: Side,
    /// Simulated outbound buffer occupancy, set by tests to exercise
    /// backpressure.
    buffered: AtomicUsize,
}

impl MemoryChannel {
    fn peer_tx(&self) -> &mpsc::UnboundedSender<ChannelEvent> {
        match self.side {
            Side::Left => &self.link.to_right,
            Side::Right => &self.link.to_left,
        }
    }

    /// Pretend this many bytes sit unflushed in the outbound buffer.
    pub fn set_buffered_amount(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::Release);
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.link.open.load(Ordering::Acquire) {
            return Err(Error::connection("data channel is closed"));
        }
        self.peer_tx()
            .send(ChannelEvent::Message(frame))
            .map_err(|_| Error::connection("peer event queue is gone"))
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.link.close();
    }
}

/// Concrete half of a loopback pair, for tests that need direct access
/// to [`MemoryChannel`] knobs.
pub struct MemoryEndpoint {
    pub channel: Arc<MemoryChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl MemoryEndpoint {
    /// Erase the concrete type into a transport handle.
    pub fn into_handle(self) -> ChannelHandle {
        ChannelHandle {
            channel: self.channel,
            events: self.events,
        }
    }
}

/// Create a connected loopback pair.
pub fn memory_pair() -> (MemoryEndpoint, MemoryEndpoint, Arc<LinkClose>) {
    let (to_left, left_events) = mpsc::unbounded_channel();
    let (to_right, right_events) = mpsc::unbounded_channel();
    let link = Arc::new(LinkState {
        open: AtomicBool::new(true),
        to_left,
        to_right,
    });
    let left = MemoryEndpoint {
        channel: Arc::new(MemoryChannel {
            link: Arc::clone(&link),
            side: Side::Left,
            buffered: AtomicUsize::new(0),
        }),
        events: left_events,
    };
    let right = MemoryEndpoint {
        channel: Arc::new(MemoryChannel {
            link: Arc::clone(&link),
            side: Side::Right,
            buffered: AtomicUsize::new(0),
        }),
        events: right_events,
    };
    (left, right, Arc::new(LinkClose { link }))
}

/// Handle that force-closes a link from outside either channel half,
/// the "network died" switch.
pub struct LinkClose {
    link: Arc<LinkState>,
}

impl LinkClose {
    pub fn sever(&self) {
        self.link.close();
    }
}

// ── Signaling ────────────────────────────────────────────────────────────────

/// In-process identifier registry handing out loopback channel pairs.
#[derive(Default)]
pub struct MemorySignaling {
    registry: Mutex<HashMap<PeerId, mpsc::UnboundedSender<ChannelHandle>>>,
    links: Mutex<Vec<Weak<LinkState>>>,
    /// Number of upcoming `register` calls to fail with a conflict.
    forced_conflicts: AtomicU32,
    /// Total `connect` calls observed (all attempts, including retries).
    connect_attempts: AtomicU32,
}

impl MemorySignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` registrations fail as identifier conflicts.
    pub fn inject_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::Release);
    }

    /// Dial attempts seen so far; used to assert retry budgets.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::Acquire)
    }

    /// Force-close every channel ever handed out, simulating a network
    /// drop. Registrations stay intact so reconnects can succeed.
    pub fn sever_all(&self) {
        let mut links = self.links.lock().expect("registry lock poisoned");
        links.retain(|weak| {
            if let Some(link) = weak.upgrade() {
                link.close();
                true
            } else {
                false
            }
        });
    }

    fn track(&self, link: &Arc<MemoryChannel>) {
        self.links
            .lock()
            .expect("registry lock poisoned")
            .push(Arc::downgrade(&link.link));
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn register(&self, id: &PeerId) -> Result<mpsc::UnboundedReceiver<ChannelHandle>> {
        if self.forced_conflicts.load(Ordering::Acquire) > 0 {
            self.forced_conflicts.fetch_sub(1, Ordering::AcqRel);
            return Err(SignalingError::IdentifierTaken(id.clone()).into());
        }

        let mut registry = self.registry.lock().expect("registry lock poisoned");
        if registry.contains_key(id) {
            return Err(SignalingError::IdentifierTaken(id.clone()).into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        registry.insert(id.clone(), tx);
        Ok(rx)
    }

    async fn connect(&self, id: &PeerId) -> Result<ChannelHandle> {
        self.connect_attempts.fetch_add(1, Ordering::AcqRel);

        let listener = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry.get(id).cloned()
        };
        let Some(listener) = listener else {
            return Err(SignalingError::PeerUnreachable(id.clone()).into());
        };

        let (caller, callee, _close) = memory_pair();
        self.track(&caller.channel);
        listener
            .send(callee.into_handle())
            .map_err(|_| Error::from(SignalingError::PeerUnreachable(id.clone())))?;
        Ok(caller.into_handle())
    }

    async fn release(&self, id: &PeerId) {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .remove(id);
    }
}
