pub mod error;
pub mod frames;
pub mod gateway;
pub mod registry;
pub mod server;

#[cfg(test)]
mod testing;

pub use gateway::{CloseReason, Gateway};
pub use registry::{FrameSink, SessionRegistry};
pub use server::{start, ServerConfig, ServerHandle};
