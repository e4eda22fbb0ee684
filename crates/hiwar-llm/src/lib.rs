pub mod openai;

pub mod mock;

pub use mock::{MockProvider, MockResponse};
pub use openai::{OpenAiCompatProvider, ProviderConfig};
