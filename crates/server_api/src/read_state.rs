use shared::{
    domain::{ChatId, UserId},
    error::ApiError,
    protocol::ServerEvent,
};

use crate::{internal, require_participant, ApiContext};

/// Marks every unread message from other senders as read by the user.
/// A commutative set-union: safe to repeat and safe under concurrent calls
/// from several devices of the same user, without the conversation lock.
/// Returns how many messages became read.
///
/// The read-state event goes to the reader's own personal group only, so
/// their other devices clear the badge; other participants are not notified.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
) -> Result<u64, ApiError> {
    require_participant(ctx, chat_id, user_id).await?;
    let updated = ctx
        .storage
        .mark_read(chat_id, user_id)
        .await
        .map_err(internal)?;
    ctx.presence
        .broadcast_user(user_id, &ServerEvent::ReadStateChanged { chat_id });
    Ok(updated)
}

#[cfg(test)]
#[path = "tests/read_state_tests.rs"]
mod tests;
