use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::TransportError;
use crate::registry::FrameSink;

#[derive(Default)]
struct SinkState {
    sent: Vec<String>,
    send_attempts: usize,
    writes_after_close: usize,
    close_calls: usize,
    fail_sends: bool,
    fail_close: bool,
    stall_sends: bool,
    stall_close: bool,
}

/// In-memory sink that records every frame written to it.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn boxed(&self) -> Box<dyn FrameSink> {
        Box::new(self.clone())
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    pub(crate) fn set_close_failing(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    /// Writes never complete, like a peer that stopped reading.
    pub(crate) fn set_stalled(&self, stall: bool) {
        self.state.lock().stall_sends = stall;
    }

    pub(crate) fn set_close_stalled(&self, stall: bool) {
        self.state.lock().stall_close = stall;
    }

    pub(crate) fn send_attempts(&self) -> usize {
        self.state.lock().send_attempts
    }

    /// Frames that reached the sink after it was closed.
    pub(crate) fn writes_after_close(&self) -> usize {
        self.state.lock().writes_after_close
    }

    pub(crate) fn frames(&self) -> Vec<Value> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Text of every `message` frame, in order.
    pub(crate) fn messages(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter(|f| f["type"] == "message")
            .filter_map(|f| f["message"].as_str().map(str::to_owned))
            .collect()
    }

    pub(crate) fn pings(&self) -> usize {
        self.frames().iter().filter(|f| f["type"] == "ping").count()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let stall = {
            let mut state = self.state.lock();
            state.send_attempts += 1;
            state.stall_sends
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(TransportError::Send("broken pipe".into()));
        }
        if state.close_calls > 0 {
            state.writes_after_close += 1;
        }
        state.sent.push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let stall = {
            let mut state = self.state.lock();
            state.close_calls += 1;
            state.stall_close
        };
        if stall {
            std::future::pending::<()>().await;
        }

        if self.state.lock().fail_close {
            return Err(TransportError::Close("already closed".into()));
        }
        Ok(())
    }
}
