use std::sync::Arc;

use hiwar_core::errors::CompletionError;
use hiwar_core::ids::ConnectionId;
use hiwar_core::provider::{CompletionOptions, CompletionProvider};
use hiwar_store::ConversationStore;
use tracing::instrument;

use crate::error::EngineError;
use crate::validator;

/// Reply when the upstream call fails or its output is rejected.
pub const APOLOGY: &str = "عذراً، حدث خطأ أثناء معالجة طلبك. الرجاء المحاولة مرة أخرى.";
/// Reply when the user message is too short to act on.
pub const NOT_UNDERSTOOD: &str = "عذراً، لم أتمكن من فهم رسالتك. هل يمكنك إعادة كتابتها؟";

const MIN_MESSAGE_CHARS: usize = 2;

/// The completion pipeline: history → provider → validation → history.
pub struct Assistant {
    provider: Arc<dyn CompletionProvider>,
    store: Arc<ConversationStore>,
    options: CompletionOptions,
}

impl Assistant {
    pub fn new(provider: Arc<dyn CompletionProvider>, store: Arc<ConversationStore>) -> Self {
        Self {
            provider,
            store,
            options: CompletionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Answer `message` for `user`. Never fails: errors become canned Arabic replies.
    pub async fn respond(&self, user: &ConnectionId, message: &str) -> String {
        match self.try_respond(user, message).await {
            Ok(reply) => reply,
            Err(EngineError::EmptyInput) => NOT_UNDERSTOOD.to_string(),
            Err(EngineError::Upstream(e)) => {
                tracing::error!(connection_id = %user, error = %e, kind = e.error_kind(), "Completion failed");
                APOLOGY.to_string()
            }
            Err(EngineError::Validation(text)) => {
                tracing::warn!(connection_id = %user, response = %text, "Generated invalid response");
                APOLOGY.to_string()
            }
        }
    }

    #[instrument(skip(self, user, message), fields(connection_id = %user))]
    pub async fn try_respond(&self, user: &ConnectionId, message: &str) -> Result<String, EngineError> {
        let message = message.trim();
        if message.chars().count() < MIN_MESSAGE_CHARS {
            return Err(EngineError::EmptyInput);
        }

        let context = self.store.context(user, message);

        // Run the upstream call on its own task so a slow provider cannot
        // hold up the caller's executor thread.
        let provider = Arc::clone(&self.provider);
        let options = self.options.clone();
        let raw = tokio::spawn(async move { provider.complete(&context, &options).await })
            .await
            .map_err(|e| CompletionError::TaskFailed(e.to_string()))??;

        let reply = validator::clean(&raw);
        if !validator::is_valid(&reply) {
            return Err(EngineError::Validation(raw));
        }

        self.store.append(user, message, &reply);
        Ok(reply)
    }
}
