//! Business operations of the chat backend: conversation lifecycle, the
//! send/receive pipeline, read-state tracking, and group membership. Every
//! operation takes the [`ApiContext`] it broadcasts through explicitly; no
//! ambient state.

use std::sync::Arc;

use presence::PresenceRouter;
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};
use storage::{Storage, StoredChat, StoredParticipant};

pub mod chat_locks;
pub mod conversations;
pub mod membership;
pub mod pipeline;
pub mod read_state;
pub mod views;

pub use chat_locks::ChatLocks;
pub use conversations::{create_direct, create_group, hide, list_for_user, CreatedChat};
pub use membership::{add_members, leave, remove_member};
pub use pipeline::{list_messages, send_message};
pub use read_state::mark_read;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub presence: Arc<PresenceRouter>,
    pub chat_locks: ChatLocks,
}

impl ApiContext {
    pub fn new(storage: Storage, presence: Arc<PresenceRouter>) -> Self {
        Self {
            storage,
            presence,
            chat_locks: ChatLocks::default(),
        }
    }
}

use shared::domain::ChatId;

pub(crate) async fn require_chat(
    ctx: &ApiContext,
    chat_id: ChatId,
) -> Result<StoredChat, ApiError> {
    ctx.storage
        .chat_by_id(chat_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))
}

pub(crate) async fn require_participant(
    ctx: &ApiContext,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<(StoredChat, StoredParticipant), ApiError> {
    let chat = require_chat(ctx, chat_id).await?;
    let participant = ctx
        .storage
        .participant_status(chat_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Forbidden, "user is not a participant"))?;
    Ok((chat, participant))
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(%err, "durable store call failed");
    ApiError::new(ErrorCode::Internal, "storage failure")
}
