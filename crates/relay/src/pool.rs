use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::tunnel::Tunnel;

/// One parked-tunnel slot. The capacity of one is the exclusion
/// mechanism: whoever receives the tunnel is the only client attached to
/// it until it is put back or evicted.
struct Slot {
    sender: mpsc::Sender<Tunnel>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Tunnel>>>,
}

impl Slot {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(1);

        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

/// Idle tunnels indexed by match key.
///
/// The map itself is touched under a plain mutex (slot creation on first
/// registration, removal on eviction); parking and taking tunnels happen
/// on the slot channel outside the lock. The channel receiver sits
/// behind an async mutex because several client sessions may wait on the
/// same busy key at once, and tokio channels have a single consumer.
pub(crate) struct IdlePool {
    slots: Mutex<AHashMap<String, Slot>>,
    shutdown: CancellationToken,
}

impl IdlePool {
    pub(crate) fn new(shutdown: CancellationToken) -> Self {
        Self {
            slots: Mutex::new(AHashMap::new()),
            shutdown,
        }
    }

    /// Park a freshly registered tunnel, creating the slot on first
    /// registration for its key. A second registration while a tunnel is
    /// already parked loses: the new socket is closed and the put
    /// skipped, keeping at most one tunnel per key.
    pub(crate) fn register(&self, tunnel: Tunnel) {
        let sender = {
            let mut slots = self.slots.lock();
            slots
                .entry(tunnel.key().to_string())
                .or_insert_with(Slot::new)
                .sender
                .clone()
        };

        if let Err(TrySendError::Full(tunnel) | TrySendError::Closed(tunnel)) =
            sender.try_send(tunnel)
        {
            log::warn!(
                "duplicate tunnel registration lost: key={:?}, peer={}",
                tunnel.key(),
                tunnel.peer()
            );

            tunnel.close();
        }
    }

    /// Take the idle tunnel for a key, waiting for it to be put back if
    /// it is currently leased out. There is no queue bound and no
    /// deadline; only broker shutdown interrupts the wait. `None` means
    /// the key has no slot (no backend ever registered) or the broker is
    /// shutting down.
    pub(crate) async fn acquire(&self, key: &str) -> Option<Tunnel> {
        let receiver = self.slots.lock().get(key)?.receiver.clone();

        let mut receiver = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            receiver = receiver.lock() => receiver,
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            tunnel = receiver.recv() => tunnel,
        }
    }

    /// Put a tunnel back after a served request. The slot may have been
    /// evicted or refilled in the meantime; the tunnel is closed rather
    /// than leaked in that case.
    pub(crate) fn release(&self, tunnel: Tunnel) {
        // A tunnel that died during the lease must not be parked again,
        // even when its fault raced ahead of the close signal.
        if tunnel.is_closed() {
            self.evict(tunnel);
            return;
        }

        let sender = self
            .slots
            .lock()
            .get(tunnel.key())
            .map(|slot| slot.sender.clone());

        let Some(sender) = sender else {
            log::warn!("idle slot gone, closing tunnel: key={:?}", tunnel.key());
            tunnel.close();
            return;
        };

        if let Err(TrySendError::Full(tunnel) | TrySendError::Closed(tunnel)) =
            sender.try_send(tunnel)
        {
            log::warn!("idle slot occupied, closing tunnel: key={:?}", tunnel.key());
            tunnel.close();
        }
    }

    /// Drop the slot of a tunnel whose backend socket is gone. The next
    /// registration for the key starts from scratch.
    pub(crate) fn evict(&self, tunnel: Tunnel) {
        self.slots.lock().remove(tunnel.key());
        log::info!("tunnel evicted: key={:?}, peer={}", tunnel.key(), tunnel.peer());
        tunnel.close();
    }
}
