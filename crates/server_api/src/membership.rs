//! Group membership changes: adding and removing participants, self-service
//! leave, admin promotion. Every change emits one synthetic system message
//! and fans the new membership out; the removed user gets a distinct
//! `ConversationRemoved` so their client retracts the conversation instead of
//! updating it.

use shared::{
    domain::{ChatId, ChatKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChatSummary, ServerEvent},
};
use storage::StoredMessage;
use tracing::warn;

use crate::{internal, require_chat, require_participant, views, ApiContext};

pub async fn add_members(
    ctx: &ApiContext,
    actor: UserId,
    chat_id: ChatId,
    new_ids: &[UserId],
) -> Result<ChatSummary, ApiError> {
    let guard = ctx.chat_locks.acquire(chat_id).await;
    let (chat, membership) = require_participant(ctx, chat_id, actor).await?;
    if chat.kind != ChatKind::Group {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "members can only be added to group conversations",
        ));
    }
    if !membership.is_admin {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only admins can add members",
        ));
    }

    let existing: Vec<UserId> = ctx
        .storage
        .participants_of(chat_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|p| p.user_id)
        .collect();
    let mut to_add: Vec<UserId> = Vec::new();
    for id in new_ids {
        if !existing.contains(id) && !to_add.contains(id) {
            to_add.push(*id);
        }
    }
    if to_add.is_empty() {
        drop(guard);
        return views::chat_summary_for(ctx, &chat, actor).await;
    }

    let mut added_names = Vec::with_capacity(to_add.len());
    for id in &to_add {
        match ctx.storage.user_profile(*id).await.map_err(internal)? {
            Some(profile) => added_names.push(profile.username),
            None => return Err(ApiError::new(ErrorCode::NotFound, "user not found")),
        }
    }

    for id in &to_add {
        ctx.storage
            .add_participant(chat_id, *id, false)
            .await
            .map_err(internal)?;
    }

    let body = format!(
        "{} added {}",
        display_name(ctx, actor).await?,
        added_names.join(", ")
    );
    let system = append_system(ctx, chat_id, actor, &body).await?;
    drop(guard);

    broadcast_system(ctx, chat_id, &system).await?;
    let chat = require_chat(ctx, chat_id).await?;
    views::broadcast_summaries(ctx, &chat).await?;

    views::chat_summary_for(ctx, &chat, actor).await
}

pub async fn remove_member(
    ctx: &ApiContext,
    actor: UserId,
    chat_id: ChatId,
    target: UserId,
) -> Result<(), ApiError> {
    let guard = ctx.chat_locks.acquire(chat_id).await;
    let (chat, membership) = require_participant(ctx, chat_id, actor).await?;
    if chat.kind != ChatKind::Group {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "members can only be removed from group conversations",
        ));
    }
    if !membership.is_admin {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only admins can remove members",
        ));
    }
    if ctx
        .storage
        .participant_status(chat_id, target)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            "target is not a participant",
        ));
    }

    let admins = ctx.storage.admin_ids(chat_id).await.map_err(internal)?;
    if admins == [target] {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            "cannot remove the only admin; transfer admin rights first",
        ));
    }

    ctx.storage
        .remove_participant(chat_id, target)
        .await
        .map_err(internal)?;
    let deleted = ctx
        .storage
        .delete_chat_if_empty(chat_id)
        .await
        .map_err(internal)?;

    let system = if deleted {
        None
    } else {
        let body = format!(
            "{} removed {}",
            display_name(ctx, actor).await?,
            display_name(ctx, target).await?
        );
        Some(append_system(ctx, chat_id, actor, &body).await?)
    };
    drop(guard);

    if let Some(system) = system {
        broadcast_system(ctx, chat_id, &system).await?;
        let chat = require_chat(ctx, chat_id).await?;
        views::broadcast_summaries(ctx, &chat).await?;
    }
    ctx.presence
        .broadcast_user(target, &ServerEvent::ConversationRemoved { chat_id });
    Ok(())
}

/// Self-service removal. Unlike [`remove_member`], leaving never fails on the
/// last-admin rule: admin rights auto-transfer to the earliest-joined
/// remaining participant, and the last participant leaving deletes the chat.
pub async fn leave(ctx: &ApiContext, actor: UserId, chat_id: ChatId) -> Result<(), ApiError> {
    let guard = ctx.chat_locks.acquire(chat_id).await;
    let (chat, membership) = require_participant(ctx, chat_id, actor).await?;

    if chat.kind == ChatKind::Direct {
        ctx.storage
            .set_hidden(chat_id, actor, true)
            .await
            .map_err(internal)?;
        ctx.storage
            .delete_direct_if_abandoned(chat_id)
            .await
            .map_err(internal)?;
        drop(guard);
        ctx.presence
            .broadcast_user(actor, &ServerEvent::ConversationRemoved { chat_id });
        return Ok(());
    }

    if membership.is_admin {
        let admins = ctx.storage.admin_ids(chat_id).await.map_err(internal)?;
        if admins == [actor] {
            if let Some(successor) = ctx
                .storage
                .earliest_joined_participant(chat_id, Some(actor))
                .await
                .map_err(internal)?
            {
                ctx.storage
                    .set_admin(chat_id, successor, true)
                    .await
                    .map_err(internal)?;
            }
        }
    }

    ctx.storage
        .remove_participant(chat_id, actor)
        .await
        .map_err(internal)?;
    let deleted = ctx
        .storage
        .delete_chat_if_empty(chat_id)
        .await
        .map_err(internal)?;

    let system = if deleted {
        None
    } else {
        let body = format!("{} left", display_name(ctx, actor).await?);
        Some(append_system(ctx, chat_id, actor, &body).await?)
    };
    drop(guard);

    if let Some(system) = system {
        broadcast_system(ctx, chat_id, &system).await?;
        let chat = require_chat(ctx, chat_id).await?;
        views::broadcast_summaries(ctx, &chat).await?;
    }
    ctx.presence
        .broadcast_user(actor, &ServerEvent::ConversationRemoved { chat_id });
    Ok(())
}

async fn display_name(ctx: &ApiContext, user_id: UserId) -> Result<String, ApiError> {
    Ok(ctx
        .storage
        .username_for_user(user_id)
        .await
        .map_err(internal)?
        .unwrap_or_else(|| format!("user {}", user_id.0)))
}

/// System messages ride the normal message path: persisted, summarized, and
/// therefore part of the history a reconnecting client re-fetches.
async fn append_system(
    ctx: &ApiContext,
    chat_id: ChatId,
    actor: UserId,
    body: &str,
) -> Result<StoredMessage, ApiError> {
    let stored = ctx
        .storage
        .insert_message(chat_id, actor, Some(body), None, true)
        .await
        .map_err(internal)?;
    if let Err(err) = ctx
        .storage
        .update_chat_summary(chat_id, stored.message_id)
        .await
    {
        warn!(chat_id = chat_id.0, %err, "summary update failed, repairing");
        ctx.storage
            .repair_chat_summary(chat_id)
            .await
            .map_err(internal)?;
    }
    Ok(stored)
}

async fn broadcast_system(
    ctx: &ApiContext,
    chat_id: ChatId,
    system: &StoredMessage,
) -> Result<(), ApiError> {
    let payload = views::message_payload(ctx, system).await?;
    ctx.presence
        .broadcast_chat(chat_id, &ServerEvent::MessageReceived { message: payload });
    Ok(())
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
