use crate::error::Result;
use crate::types::{ChatRef, MessageRef};

/// Outbound side of the chat conversation
///
/// Implemented by the embedding application's bot client. Failures are reported as
/// [`crate::Error::Conversation`].
#[async_trait::async_trait]
pub trait ConversationSurface: Send + Sync {
    /// Post `text` in `chat`, optionally as a reply, and return the new message
    async fn send_message(
        &self,
        chat: &ChatRef,
        reply_to: Option<i32>,
        text: &str,
    ) -> Result<MessageRef>;

    /// Replace the text of a message the relay sent earlier
    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<()>;

    /// Delete a message (used by auto-delete)
    async fn delete_message(&self, message: &MessageRef) -> Result<()>;
}
