//! ---
//! ct_section: "02-messaging-ipc-data-model"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Message envelopes, exchanges and request dispatch."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{MessagingError, Result};

/// Opaque handle for one transport connection.
pub type ConnectionId = u64;

/// Connection-oriented byte transport used by the router.
pub trait Transport: Send + Sync {
    /// Deliver one encoded message to a connection.
    fn send(&self, connection: ConnectionId, frame: Bytes) -> Result<()>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Callbacks a transport drives for inbound traffic.
pub trait ConnectionHandler: Send + Sync {
    /// One complete frame arrived on `connection`.
    fn on_frame(&self, connection: ConnectionId, frame: &[u8]);
    /// `connection` closed; no further frames will arrive on it.
    fn on_disconnected(&self, connection: ConnectionId);
}

/// In-memory transport with one queue per open connection.
///
/// Used by tests and single-process integration: frames sent to a connection
/// are queued until drained.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    queues: Arc<Mutex<HashMap<ConnectionId, VecDeque<Bytes>>>>,
}

impl InMemoryTransport {
    /// Create a transport without open connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting frames for `connection`.
    pub fn open(&self, connection: ConnectionId) {
        self.queues.lock().entry(connection).or_default();
    }

    /// Stop accepting frames for `connection`, discarding anything queued.
    pub fn close(&self, connection: ConnectionId) {
        self.queues.lock().remove(&connection);
    }

    /// Pop the oldest frame queued for `connection`.
    pub fn recv(&self, connection: ConnectionId) -> Option<Bytes> {
        self.queues
            .lock()
            .get_mut(&connection)
            .and_then(VecDeque::pop_front)
    }

    /// Take every frame queued for `connection`.
    pub fn drain(&self, connection: ConnectionId) -> Vec<Bytes> {
        self.queues
            .lock()
            .get_mut(&connection)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, connection: ConnectionId, frame: Bytes) -> Result<()> {
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(&connection)
            .ok_or(MessagingError::ConnectionClosed(connection))?;
        queue.push_back(frame);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
