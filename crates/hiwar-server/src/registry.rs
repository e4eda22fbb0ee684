use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hiwar_core::ids::ConnectionId;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, TransportError};
use crate::frames::OutboundFrame;

pub const PING_INTERVAL: Duration = Duration::from_secs(25);
/// Upper bound on a single socket write or close.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write half of a client socket.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A live connection. Only the registry touches the sink.
struct ConnectionRecord {
    sink: Mutex<Box<dyn FrameSink>>,
    last_liveness: parking_lot::Mutex<Instant>,
    active: AtomicBool,
    keep_alive: CancellationToken,
}

impl ConnectionRecord {
    fn new(sink: Box<dyn FrameSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
            last_liveness: parking_lot::Mutex::new(Instant::now()),
            active: AtomicBool::new(true),
            keep_alive: CancellationToken::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Registry of open connections and the single path for writing to them.
pub struct SessionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionRecord>>>,
    ping_interval: Duration,
    write_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(PING_INTERVAL)
    }
}

impl SessionRegistry {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            ping_interval,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Take ownership of `sink` under `id` and start its keep-alive task.
    pub async fn register(
        self: &Arc<Self>,
        id: ConnectionId,
        sink: Box<dyn FrameSink>,
    ) -> Result<(), RegistryError> {
        let record = Arc::new(ConnectionRecord::new(sink));
        {
            let mut connections = self.connections.lock().await;
            if connections.contains_key(&id) {
                return Err(RegistryError::DuplicateConnection(id));
            }
            connections.insert(id.clone(), Arc::clone(&record));
        }

        tokio::spawn(keep_alive(
            Arc::clone(self),
            id.clone(),
            record.keep_alive.clone(),
        ));
        tracing::info!(connection_id = %id, "Connection registered");
        Ok(())
    }

    pub async fn record_liveness(&self, id: &ConnectionId) {
        let record = self.connections.lock().await.get(id).cloned();
        if let Some(record) = record {
            *record.last_liveness.lock() = Instant::now();
        }
    }

    pub async fn last_liveness(&self, id: &ConnectionId) -> Option<Instant> {
        let record = self.connections.lock().await.get(id).cloned();
        record.as_ref().map(|r| *r.last_liveness.lock())
    }

    /// Deliver `frame` to `id`. A transport failure or a write that outlives
    /// the write timeout deregisters the connection. A concurrent `deregister`
    /// aborts the write.
    pub async fn send(&self, id: &ConnectionId, frame: &OutboundFrame) -> bool {
        let record = self.connections.lock().await.get(id).cloned();
        let Some(record) = record else {
            return false;
        };

        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(connection_id = %id, error = %e, "Failed to encode frame");
                return false;
            }
        };

        let result = {
            let mut sink = record.sink.lock().await;
            if !record.is_active() {
                return false;
            }
            tokio::select! {
                _ = record.keep_alive.cancelled() => return false,
                written = tokio::time::timeout(self.write_timeout, sink.send_text(text)) => {
                    written.unwrap_or_else(|_| Err(TransportError::Send("write timed out".into())))
                }
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Send failed, dropping connection");
                self.deregister(id).await;
                false
            }
        }
    }

    /// Remove `id`, stop its keep-alive and close its socket. Idempotent.
    pub async fn deregister(&self, id: &ConnectionId) -> bool {
        let record = self.connections.lock().await.remove(id);
        let Some(record) = record else {
            return false;
        };

        record.active.store(false, Ordering::Release);
        record.keep_alive.cancel();

        // Cancelling first makes an in-flight send give up the sink.
        let mut sink = record.sink.lock().await;
        match tokio::time::timeout(self.write_timeout, sink.close()).await {
            Ok(Ok(())) => {}
            // Peer is usually already gone.
            Ok(Err(e)) => tracing::debug!(connection_id = %id, error = %e, "Close failed"),
            Err(_) => tracing::warn!(connection_id = %id, "Close timed out"),
        }
        drop(sink);

        tracing::info!(connection_id = %id, "Connection deregistered");
        true
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.lock().await.contains_key(id)
    }

    pub async fn count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Deregister every connection. Returns how many were open.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.lock().await.keys().cloned().collect();
        let mut closed = 0;
        for id in ids {
            if self.deregister(&id).await {
                closed += 1;
            }
        }
        closed
    }
}

async fn keep_alive(registry: Arc<SessionRegistry>, id: ConnectionId, cancel: CancellationToken) {
    let period = registry.ping_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !registry.send(&id, &OutboundFrame::ping()).await {
                    break;
                }
                tracing::trace!(connection_id = %id, "Sent ping");
            }
        }
    }
    tracing::debug!(connection_id = %id, "Keep-alive stopped");
}
