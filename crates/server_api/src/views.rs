//! The single serialization boundary per entity. Every route and broadcast
//! that emits a conversation or message goes through these builders, so the
//! recipient/unread enrichment is computed in exactly one place.

use shared::{
    domain::{ChatKind, UserId},
    error::ApiError,
    protocol::{ChatSummary, MediaRef, MessagePayload, RecipientSummary, ServerEvent},
};
use storage::{StoredChat, StoredMessage};

use crate::{internal, ApiContext};

pub fn payload_with(
    message: &StoredMessage,
    sender_username: Option<String>,
    read_by: Vec<UserId>,
) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        chat_id: message.chat_id,
        sender_id: message.sender_id,
        sender_username,
        body: message.body.clone(),
        media: match (&message.media_url, message.media_kind) {
            (Some(url), Some(kind)) => Some(MediaRef {
                url: url.clone(),
                kind,
            }),
            _ => None,
        },
        is_system: message.is_system,
        read_by,
        sent_at: message.created_at,
    }
}

pub async fn message_payload(
    ctx: &ApiContext,
    message: &StoredMessage,
) -> Result<MessagePayload, ApiError> {
    let sender_username = ctx
        .storage
        .username_for_user(message.sender_id)
        .await
        .map_err(internal)?;
    let read_by = ctx
        .storage
        .read_by_for_message(message.message_id)
        .await
        .map_err(internal)?;
    Ok(payload_with(message, sender_username, read_by))
}

/// Builds the viewer-specific projection of a conversation: the computed
/// recipient for direct chats and a cheap 0/1 unread indicator derived from
/// the last message only. Exact counts stay in the read-state path.
pub async fn chat_summary_for(
    ctx: &ApiContext,
    chat: &StoredChat,
    viewer: UserId,
) -> Result<ChatSummary, ApiError> {
    let participants = ctx
        .storage
        .participants_of(chat.chat_id)
        .await
        .map_err(internal)?;
    let participant_ids: Vec<UserId> = participants.iter().map(|p| p.user_id).collect();
    let admin_ids: Vec<UserId> = participants
        .iter()
        .filter(|p| p.is_admin)
        .map(|p| p.user_id)
        .collect();

    let recipient = if chat.kind == ChatKind::Direct {
        let other = participant_ids.iter().copied().find(|id| *id != viewer);
        match other {
            Some(other) => ctx
                .storage
                .user_profile(other)
                .await
                .map_err(internal)?
                .map(|profile| RecipientSummary {
                    user_id: profile.user_id,
                    username: profile.username,
                    display_image: profile.display_image,
                }),
            None => None,
        }
    } else {
        None
    };

    let last_message = match chat.last_message_id {
        Some(message_id) => ctx
            .storage
            .message_by_id(message_id)
            .await
            .map_err(internal)?,
        None => None,
    };

    let unread = match &last_message {
        Some(message) if message.sender_id != viewer => {
            let seen = ctx
                .storage
                .is_message_read(message.message_id, viewer)
                .await
                .map_err(internal)?;
            u32::from(!seen)
        }
        _ => 0,
    };

    let last_message = match last_message {
        Some(message) => Some(message_payload(ctx, &message).await?),
        None => None,
    };

    Ok(ChatSummary {
        chat_id: chat.chat_id,
        kind: chat.kind,
        title: chat.title.clone(),
        participant_ids,
        admin_ids,
        recipient,
        last_message,
        unread,
        updated_at: chat.updated_at,
    })
}

/// Fans an updated per-viewer summary out to every participant's personal
/// group. Duplicate delivery to a client that also sits in the conversation
/// group is tolerated; summaries are idempotent overwrites.
pub(crate) async fn broadcast_summaries(
    ctx: &ApiContext,
    chat: &StoredChat,
) -> Result<(), ApiError> {
    let participants = ctx
        .storage
        .participants_of(chat.chat_id)
        .await
        .map_err(internal)?;
    for participant in participants {
        let summary = chat_summary_for(ctx, chat, participant.user_id).await?;
        ctx.presence.broadcast_user(
            participant.user_id,
            &ServerEvent::ConversationUpdated { chat: summary },
        );
    }
    Ok(())
}
