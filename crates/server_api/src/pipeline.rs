//! The send/receive path: authorize, persist, update the conversation
//! summary, fan out. Persistence and summary are serialized per conversation
//! through [`crate::ChatLocks`], which also gives the conversation group its
//! in-commit-order delivery guarantee.

use std::collections::HashMap;

use shared::{
    domain::{ChatId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MediaRef, MessagePayload, ServerEvent},
};
use tracing::warn;

use crate::{internal, require_chat, views, ApiContext};

pub async fn send_message(
    ctx: &ApiContext,
    requester: UserId,
    chat_id: ChatId,
    body: Option<&str>,
    media: Option<&MediaRef>,
) -> Result<MessagePayload, ApiError> {
    let body = body.map(str::trim).filter(|b| !b.is_empty());
    if body.is_none() && media.is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message requires a body or a media attachment",
        ));
    }

    // Authorization runs under the chat lock so it cannot race a concurrent
    // membership change against stale participant data.
    let guard = ctx.chat_locks.acquire(chat_id).await;
    require_chat(ctx, chat_id).await?;
    let is_participant = ctx
        .storage
        .participant_status(chat_id, requester)
        .await
        .map_err(internal)?
        .is_some();
    if !is_participant {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "sender is not a participant",
        ));
    }

    let stored = ctx
        .storage
        .insert_message(
            chat_id,
            requester,
            body,
            media.map(|m| (m.url.as_str(), m.kind)),
            false,
        )
        .await
        .map_err(internal)?;

    // The summary write is repaired once, idempotently, from the message
    // table before the failure is surfaced to the sender alone.
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
    ctx.storage.unhide_all(chat_id).await.map_err(internal)?;
    drop(guard);

    let payload = views::message_payload(ctx, &stored).await?;
    ctx.presence.broadcast_chat(
        chat_id,
        &ServerEvent::MessageReceived {
            message: payload.clone(),
        },
    );

    let chat = require_chat(ctx, chat_id).await?;
    views::broadcast_summaries(ctx, &chat).await?;

    Ok(payload)
}

/// Full ascending history of a conversation, readable by participants only.
pub async fn list_messages(
    ctx: &ApiContext,
    requester: UserId,
    chat_id: ChatId,
) -> Result<Vec<MessagePayload>, ApiError> {
    require_chat(ctx, chat_id).await?;
    if ctx
        .storage
        .participant_status(chat_id, requester)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a participant",
        ));
    }

    let messages = ctx
        .storage
        .list_chat_messages(chat_id)
        .await
        .map_err(internal)?;
    let reads = ctx.storage.reads_for_chat(chat_id).await.map_err(internal)?;
    let mut read_by: HashMap<_, Vec<UserId>> = HashMap::new();
    for (message_id, user_id) in reads {
        read_by.entry(message_id).or_default().push(user_id);
    }

    let mut username_cache: HashMap<UserId, Option<String>> = HashMap::new();
    let mut payloads = Vec::with_capacity(messages.len());
    for message in &messages {
        let sender_username = match username_cache.get(&message.sender_id) {
            Some(cached) => cached.clone(),
            None => {
                let resolved = ctx
                    .storage
                    .username_for_user(message.sender_id)
                    .await
                    .map_err(internal)?;
                username_cache.insert(message.sender_id, resolved.clone());
                resolved
            }
        };
        payloads.push(views::payload_with(
            message,
            sender_username,
            read_by.remove(&message.message_id).unwrap_or_default(),
        ));
    }

    Ok(payloads)
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
