use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::selection::Selection;
use crate::status::ConnectionStatus;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StatusChanged {
        id: Uuid,
        status: ConnectionStatus,
    },
    Reconnected {
        id: Uuid,
    },
    ReconnectFailed {
        id: Uuid,
        error: String,
    },
    SelectionChanged(Selection),
    TabsChanged,
}

/// Fan-out channel for state observers.
///
/// Created once at startup and closed at shutdown; publishing after `close`
/// is a silent no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Arc<Mutex<Option<broadcast::Sender<SessionEvent>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Subscribing to a closed bus yields a receiver that is already closed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        if let Some(sender) = self.sender.lock().as_ref() {
            return sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(1);
        drop(sender);
        receiver
    }

    pub fn publish(&self, event: SessionEvent) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // no receivers is fine
            let _ = sender.send(event);
        }
    }

    pub fn close(&self) {
        self.sender.lock().take();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
