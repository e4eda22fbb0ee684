use hiwar_core::ids::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection already registered: {0}")]
    DuplicateConnection(ConnectionId),
}

/// Socket-level failures. Any of these ends the connection; there is no retry.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("close failed: {0}")]
    Close(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// An inbound frame that does not match the wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("frame has no type")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} frame: {reason}")]
    InvalidFields { kind: &'static str, reason: String },
    #[error("binary frames are not supported")]
    Binary,
}
