//! Internal event fan-out: the synchronous bus plus a broadcast stream.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use promptfleet_client::EventBus;

use crate::api::PoolEvent;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Fans every pool event out to the sync bus and the broadcast channel.
/// Muted during shutdown so no events escape after `shutdown()` begins.
pub(crate) struct EventSink {
    bus: EventBus<PoolEvent>,
    tx: broadcast::Sender<PoolEvent>,
    muted: AtomicBool,
}

impl EventSink {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            bus: EventBus::new(),
            tx,
            muted: AtomicBool::new(false),
        }
    }

    pub(crate) fn bus(&self) -> &EventBus<PoolEvent> {
        &self.bus
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        if self.muted.load(Ordering::SeqCst) {
            return;
        }
        self.bus.emit(&event);
        let _ = self.tx.send(event);
    }
}
