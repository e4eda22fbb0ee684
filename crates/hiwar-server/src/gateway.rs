use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use hiwar_core::ids::ConnectionId;
use hiwar_engine::Assistant;

use crate::error::{ProtocolError, TransportError};
use crate::frames::{InboundFrame, OutboundFrame, INVALID_FORMAT};
use crate::registry::{FrameSink, SessionRegistry};

pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// What the read half of a socket can yield.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundEvent {
    Text(String),
    Binary,
    /// Protocol-level pong.
    Pong,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a connection's read loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    /// No liveness signal within twice the read timeout.
    Stale,
    TransportFailure,
    /// Registration refused; nothing was served.
    Rejected,
}

fn transition(id: &ConnectionId, state: &mut ConnectionState, next: ConnectionState) {
    tracing::debug!(connection_id = %id, from = ?*state, to = ?next, "Connection state");
    *state = next;
}

/// Drives one connection: registration, the read loop, and teardown.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    assistant: Arc<Assistant>,
    read_timeout: Duration,
}

impl Gateway {
    pub fn new(registry: Arc<SessionRegistry>, assistant: Arc<Assistant>) -> Self {
        Self {
            registry,
            assistant,
            read_timeout: READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn assistant(&self) -> &Arc<Assistant> {
        &self.assistant
    }

    /// Serve `id` until the peer leaves, goes stale, or the transport fails.
    pub async fn serve<S>(&self, id: ConnectionId, sink: Box<dyn FrameSink>, mut inbound: S) -> CloseReason
    where
        S: Stream<Item = Result<InboundEvent, TransportError>> + Unpin + Send,
    {
        let mut state = ConnectionState::Connecting;
        if let Err(e) = self.registry.register(id.clone(), sink).await {
            tracing::warn!(connection_id = %id, error = %e, "Connection rejected");
            return CloseReason::Rejected;
        }
        transition(&id, &mut state, ConnectionState::Open);

        let reason = self.read_loop(&id, &mut inbound).await;

        transition(&id, &mut state, ConnectionState::Closing);
        self.registry.deregister(&id).await;
        self.assistant.store().forget(&id);
        transition(&id, &mut state, ConnectionState::Closed);

        tracing::info!(connection_id = %id, reason = ?reason, "Connection closed");
        reason
    }

    async fn read_loop<S>(&self, id: &ConnectionId, inbound: &mut S) -> CloseReason
    where
        S: Stream<Item = Result<InboundEvent, TransportError>> + Unpin + Send,
    {
        loop {
            let event = match tokio::time::timeout(self.read_timeout, inbound.next()).await {
                Ok(Some(Ok(event))) => event,
                Ok(Some(Err(e))) => {
                    tracing::warn!(connection_id = %id, error = %e, "Read failed");
                    return CloseReason::TransportFailure;
                }
                Ok(None) => return CloseReason::ClientClosed,
                Err(_) => match self.registry.last_liveness(id).await {
                    None => return CloseReason::TransportFailure,
                    Some(last) if last.elapsed() > self.read_timeout * 2 => {
                        tracing::info!(connection_id = %id, idle_secs = last.elapsed().as_secs(), "Connection stale");
                        return CloseReason::Stale;
                    }
                    Some(_) => continue,
                },
            };

            let delivered = match event {
                InboundEvent::Close => return CloseReason::ClientClosed,
                InboundEvent::Pong => {
                    self.registry.record_liveness(id).await;
                    true
                }
                InboundEvent::Binary => self.reject(id, ProtocolError::Binary).await,
                InboundEvent::Text(text) => self.handle_text(id, &text).await,
            };
            if !delivered {
                return CloseReason::TransportFailure;
            }
        }
    }

    /// Returns false once the connection can no longer be written to.
    async fn handle_text(&self, id: &ConnectionId, text: &str) -> bool {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::Pong) => {
                self.registry.record_liveness(id).await;
                true
            }
            Ok(InboundFrame::Connection { client_id }) => {
                tracing::debug!(connection_id = %id, advertised = ?client_id, "Client hello");
                true
            }
            Ok(InboundFrame::Message { message, .. }) => {
                if message.is_empty() {
                    return true;
                }
                tracing::info!(connection_id = %id, chars = message.chars().count(), "Message received");
                let reply = self.assistant.respond(id, &message).await;
                self.registry.send(id, &OutboundFrame::message(reply)).await
            }
            Err(e) => self.reject(id, e).await,
        }
    }

    async fn reject(&self, id: &ConnectionId, error: ProtocolError) -> bool {
        tracing::warn!(connection_id = %id, error = %error, "Rejected inbound frame");
        self.registry
            .send(id, &OutboundFrame::message(INVALID_FORMAT))
            .await
    }
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, WsMessage> {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        SinkExt::send(self, WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::close(self)
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }
}

/// Adapt the read half of an axum socket. Protocol pings are answered by axum.
pub fn inbound_events(stream: SplitStream<WebSocket>) -> BoxStream<'static, Result<InboundEvent, TransportError>> {
    stream
        .filter_map(|msg| async move {
            match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(InboundEvent::Text(text.to_string()))),
                Ok(WsMessage::Binary(_)) => Some(Ok(InboundEvent::Binary)),
                Ok(WsMessage::Pong(_)) => Some(Ok(InboundEvent::Pong)),
                Ok(WsMessage::Close(_)) => Some(Ok(InboundEvent::Close)),
                Ok(WsMessage::Ping(_)) => None,
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            }
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use hiwar_core::errors::CompletionError;
    use hiwar_engine::{APOLOGY, NOT_UNDERSTOOD};
    use hiwar_llm::{MockProvider, MockResponse};
    use hiwar_store::ConversationStore;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    type Inbound = mpsc::UnboundedSender<Result<InboundEvent, TransportError>>;

    struct Harness {
        gateway: Gateway,
        provider: Arc<MockProvider>,
        sink: RecordingSink,
        id: ConnectionId,
    }

    fn harness(responses: Vec<MockResponse>) -> Harness {
        let provider = Arc::new(MockProvider::new(responses));
        let assistant = Arc::new(Assistant::new(provider.clone(), Arc::new(ConversationStore::new())));
        let registry = Arc::new(SessionRegistry::default());
        Harness {
            gateway: Gateway::new(registry, assistant),
            provider,
            sink: RecordingSink::new(),
            id: ConnectionId::new(),
        }
    }

    impl Harness {
        fn spawn(&self) -> (Inbound, JoinHandle<CloseReason>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let gateway = self.gateway.clone();
            let id = self.id.clone();
            let sink = self.sink.boxed();
            let task = tokio::spawn(async move { gateway.serve(id, sink, UnboundedReceiverStream::new(rx)).await });
            (tx, task)
        }
    }

    fn text(frame: &str) -> Result<InboundEvent, TransportError> {
        Ok(InboundEvent::Text(frame.to_string()))
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn message_roundtrip() {
        let h = harness(vec![MockResponse::text("أهلاً بك")]);
        let (tx, task) = h.spawn();

        tx.send(text(r#"{"type":"message","clientId":"x","message":"مرحبا"}"#)).unwrap();
        eventually(|| !h.sink.messages().is_empty()).await;
        assert_eq!(h.sink.messages(), vec!["أهلاً بك".to_string()]);

        drop(tx);
        assert_eq!(task.await.unwrap(), CloseReason::ClientClosed);
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_open() {
        let h = harness(vec![MockResponse::text("تمام")]);
        let (tx, task) = h.spawn();

        tx.send(text("{not json")).unwrap();
        tx.send(text(r#"{"type":"message","message":"كيف الحال"}"#)).unwrap();
        eventually(|| h.sink.messages().len() == 2).await;
        assert_eq!(h.sink.messages(), vec![INVALID_FORMAT.to_string(), "تمام".to_string()]);

        tx.send(Ok(InboundEvent::Close)).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::ClientClosed);
    }

    #[tokio::test]
    async fn unknown_type_and_binary_are_rejected() {
        let h = harness(vec![]);
        let (tx, task) = h.spawn();

        tx.send(text(r#"{"type":"subscribe"}"#)).unwrap();
        tx.send(text(r#"{"message":"no type"}"#)).unwrap();
        tx.send(Ok(InboundEvent::Binary)).unwrap();
        eventually(|| h.sink.messages().len() == 3).await;
        assert!(h.sink.messages().iter().all(|m| m == INVALID_FORMAT));
        assert!(h.gateway.registry().contains(&h.id).await);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn upstream_failure_then_recovery() {
        let h = harness(vec![
            MockResponse::Error(CompletionError::ServerError {
                status: 502,
                body: "bad gateway".into(),
            }),
            MockResponse::text("الحمد لله"),
        ]);
        let (tx, task) = h.spawn();

        tx.send(text(r#"{"type":"message","message":"سؤال"}"#)).unwrap();
        tx.send(text(r#"{"type":"message","message":"سؤال آخر"}"#)).unwrap();
        eventually(|| h.sink.messages().len() == 2).await;
        assert_eq!(h.sink.messages(), vec![APOLOGY.to_string(), "الحمد لله".to_string()]);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn empty_message_is_ignored() {
        let h = harness(vec![MockResponse::text("نعم")]);
        let (tx, task) = h.spawn();

        tx.send(text(r#"{"type":"message","message":""}"#)).unwrap();
        tx.send(text(r#"{"type":"message","message":null}"#)).unwrap();
        tx.send(text(r#"{"type":"message","message":"   "}"#)).unwrap();
        tx.send(text(r#"{"type":"message","message":"هل تسمعني"}"#)).unwrap();
        eventually(|| h.sink.messages().len() == 2).await;

        assert_eq!(h.sink.messages(), vec![NOT_UNDERSTOOD.to_string(), "نعم".to_string()]);
        assert_eq!(h.provider.call_count(), 1);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let h = harness(vec![]);
        let existing = RecordingSink::new();
        h.gateway
            .registry()
            .register(h.id.clone(), existing.boxed())
            .await
            .unwrap();

        let (_tx, task) = h.spawn();
        assert_eq!(task.await.unwrap(), CloseReason::Rejected);
        assert!(h.gateway.registry().contains(&h.id).await);
        assert!(!existing.is_closed());
    }

    #[tokio::test]
    async fn read_error_tears_down() {
        let h = harness(vec![]);
        let (tx, task) = h.spawn();

        tx.send(Err(TransportError::Receive("reset by peer".into()))).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::TransportFailure);
        assert!(!h.gateway.registry().contains(&h.id).await);
        assert!(h.sink.is_closed());
    }

    #[tokio::test]
    async fn failed_reply_tears_down() {
        let h = harness(vec![MockResponse::text("هذا ردي")]);
        let (tx, task) = h.spawn();

        h.sink.set_failing(true);
        tx.send(text(r#"{"type":"message","message":"مرحبا"}"#)).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::TransportFailure);
        assert_eq!(h.gateway.registry().count().await, 0);
    }

    #[tokio::test]
    async fn history_is_forgotten_on_close() {
        let h = harness(vec![MockResponse::text("أهلاً بك")]);
        let (tx, task) = h.spawn();

        tx.send(text(r#"{"type":"message","message":"مرحبا"}"#)).unwrap();
        eventually(|| !h.sink.messages().is_empty()).await;
        assert_eq!(h.gateway.assistant().store().len(&h.id), 1);

        drop(tx);
        task.await.unwrap();
        assert_eq!(h.gateway.assistant().store().len(&h.id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_goes_stale() {
        let h = harness(vec![]);
        let start = Instant::now();
        let (_tx, task) = h.spawn();

        assert_eq!(task.await.unwrap(), CloseReason::Stale);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(90), "closed after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(91), "closed after {elapsed:?}");
        // Keep-alive kept probing until the end.
        assert_eq!(h.sink.pings(), 3);
        assert!(h.sink.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_postpones_staleness() {
        let h = harness(vec![]);
        let start = Instant::now();
        let (tx, task) = h.spawn();

        tokio::time::sleep(Duration::from_secs(50)).await;
        tx.send(text(r#"{"type":"pong"}"#)).unwrap();

        assert_eq!(task.await.unwrap(), CloseReason::Stale);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(140), "closed after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(141), "closed after {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_pong_counts_as_liveness() {
        let h = harness(vec![]);
        let start = Instant::now();
        let (tx, task) = h.spawn();

        tokio::time::sleep(Duration::from_secs(80)).await;
        tx.send(Ok(InboundEvent::Pong)).unwrap();

        assert_eq!(task.await.unwrap(), CloseReason::Stale);
        assert!(start.elapsed() >= Duration::from_secs(170));
    }
}
