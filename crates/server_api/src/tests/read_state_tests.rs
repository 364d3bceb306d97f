use std::sync::Arc;

use super::*;
use presence::PresenceRouter;
use shared::error::ErrorCode;
use storage::Storage;
use tokio::sync::mpsc;

async fn setup() -> (ApiContext, UserId, UserId, ChatId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ctx = ApiContext::new(storage, Arc::new(PresenceRouter::new()));
    let alice = ctx.storage.create_user("alice").await.expect("alice");
    let bob = ctx.storage.create_user("bob").await.expect("bob");
    let (chat, _) = ctx
        .storage
        .create_direct_chat(alice, bob)
        .await
        .expect("chat");
    (ctx, alice, bob, chat)
}

#[tokio::test]
async fn mark_read_is_idempotent() {
    let (ctx, alice, bob, chat) = setup().await;
    ctx.storage
        .insert_message(chat, alice, Some("one"), None, false)
        .await
        .expect("one");
    ctx.storage
        .insert_message(chat, alice, Some("two"), None, false)
        .await
        .expect("two");

    assert_eq!(mark_read(&ctx, bob, chat).await.expect("first"), 2);
    assert_eq!(mark_read(&ctx, bob, chat).await.expect("second"), 0);
}

#[tokio::test]
async fn mark_read_requires_participation() {
    let (ctx, _, _, chat) = setup().await;
    let mallory = ctx.storage.create_user("mallory").await.expect("user");
    let err = mark_read(&ctx, mallory, chat).await.expect_err("outsider");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = mark_read(&ctx, mallory, ChatId(404))
        .await
        .expect_err("missing chat");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn read_event_reaches_only_the_readers_own_devices() {
    let (ctx, alice, bob, chat) = setup().await;
    ctx.storage
        .insert_message(chat, alice, Some("ping"), None, false)
        .await
        .expect("message");

    let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
    ctx.presence.register(bob, bob_tx);
    let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
    ctx.presence.register(alice, alice_tx);

    mark_read(&ctx, bob, chat).await.expect("mark read");

    let event = bob_rx.recv().await.expect("event");
    assert!(matches!(event, ServerEvent::ReadStateChanged { chat_id } if chat_id == chat));
    // No cross-user read receipts in this design.
    assert!(alice_rx.try_recv().is_err());
}
