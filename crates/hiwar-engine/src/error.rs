use hiwar_core::errors::CompletionError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("upstream error: {0}")]
    Upstream(#[from] CompletionError),

    #[error("response rejected: {0:?}")]
    Validation(String),

    #[error("message too short to answer")]
    EmptyInput,
}
