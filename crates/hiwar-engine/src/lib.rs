pub mod assistant;
pub mod error;
pub mod validator;

pub use assistant::{Assistant, APOLOGY, NOT_UNDERSTOOD};
pub use error::EngineError;
