use shared::{
    domain::{ChatId, ChatKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChatSummary, ServerEvent},
};

use crate::{internal, require_participant, views, ApiContext};

/// Minimum number of participants besides the creator for a group chat.
const MIN_GROUP_OTHERS: usize = 1;

#[derive(Debug, Clone)]
pub struct CreatedChat {
    pub chat: ChatSummary,
    /// False when an existing direct conversation was returned instead of a
    /// new one being inserted.
    pub created: bool,
}

/// Idempotent direct-chat creation: at most one conversation exists per
/// unordered user pair, and re-creating returns it.
pub async fn create_direct(
    ctx: &ApiContext,
    requester: UserId,
    other: UserId,
) -> Result<CreatedChat, ApiError> {
    if other == requester {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "direct conversation requires another participant",
        ));
    }
    if ctx
        .storage
        .user_profile(other)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(ApiError::new(ErrorCode::NotFound, "user not found"));
    }

    if let Some(existing) = ctx
        .storage
        .find_direct_chat(requester, other)
        .await
        .map_err(internal)?
    {
        // Re-creation also resurfaces a chat the requester had hidden.
        ctx.storage
            .set_hidden(existing, requester, false)
            .await
            .map_err(internal)?;
        let chat = crate::require_chat(ctx, existing).await?;
        let summary = views::chat_summary_for(ctx, &chat, requester).await?;
        return Ok(CreatedChat {
            chat: summary,
            created: false,
        });
    }

    let (chat_id, inserted) = ctx
        .storage
        .create_direct_chat(requester, other)
        .await
        .map_err(internal)?;
    let chat = crate::require_chat(ctx, chat_id).await?;

    if !inserted {
        // Lost a concurrent creation of the same pair; treat it exactly like
        // the lookup hit above.
        ctx.storage
            .set_hidden(chat_id, requester, false)
            .await
            .map_err(internal)?;
        let summary = views::chat_summary_for(ctx, &chat, requester).await?;
        return Ok(CreatedChat {
            chat: summary,
            created: false,
        });
    }

    for participant in [requester, other] {
        let summary = views::chat_summary_for(ctx, &chat, participant).await?;
        ctx.presence.broadcast_user(
            participant,
            &ServerEvent::ConversationCreated { chat: summary },
        );
    }

    let summary = views::chat_summary_for(ctx, &chat, requester).await?;
    Ok(CreatedChat {
        chat: summary,
        created: true,
    })
}

pub async fn create_group(
    ctx: &ApiContext,
    creator: UserId,
    participant_ids: &[UserId],
    title: &str,
) -> Result<ChatSummary, ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "group conversation requires a title",
        ));
    }

    let mut others: Vec<UserId> = Vec::new();
    for id in participant_ids {
        if *id != creator && !others.contains(id) {
            others.push(*id);
        }
    }
    if others.len() < MIN_GROUP_OTHERS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "group conversation requires at least one other participant",
        ));
    }
    for id in &others {
        if ctx
            .storage
            .user_profile(*id)
            .await
            .map_err(internal)?
            .is_none()
        {
            return Err(ApiError::new(ErrorCode::NotFound, "user not found"));
        }
    }

    let chat_id = ctx
        .storage
        .create_group_chat(creator, &others, title)
        .await
        .map_err(internal)?;
    let chat = crate::require_chat(ctx, chat_id).await?;

    let mut everyone = vec![creator];
    everyone.extend(others);
    for participant in &everyone {
        let summary = views::chat_summary_for(ctx, &chat, *participant).await?;
        ctx.presence.broadcast_user(
            *participant,
            &ServerEvent::ConversationCreated { chat: summary },
        );
    }

    views::chat_summary_for(ctx, &chat, creator).await
}

/// Conversations visible to the user, most recent activity first.
pub async fn list_for_user(ctx: &ApiContext, user_id: UserId) -> Result<Vec<ChatSummary>, ApiError> {
    let chats = ctx
        .storage
        .list_chats_for_user(user_id)
        .await
        .map_err(internal)?;
    let mut summaries = Vec::with_capacity(chats.len());
    for chat in &chats {
        summaries.push(views::chat_summary_for(ctx, chat, user_id).await?);
    }
    Ok(summaries)
}

/// Soft-hides a direct conversation from the caller's own view. Idempotent.
/// The chat is deleted outright once no participant references it anymore.
pub async fn hide(ctx: &ApiContext, user_id: UserId, chat_id: ChatId) -> Result<(), ApiError> {
    let (chat, _) = require_participant(ctx, chat_id, user_id).await?;
    if chat.kind != ChatKind::Direct {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "only direct conversations can be hidden",
        ));
    }

    ctx.storage
        .set_hidden(chat_id, user_id, true)
        .await
        .map_err(internal)?;
    ctx.presence
        .broadcast_user(user_id, &ServerEvent::ConversationRemoved { chat_id });
    ctx.storage
        .delete_direct_if_abandoned(chat_id)
        .await
        .map_err(internal)?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
