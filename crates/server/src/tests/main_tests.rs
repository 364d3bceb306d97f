use super::*;
use axum::{body, body::Body, http::Request};
use tower::ServiceExt;

async fn test_app() -> Router {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let api = ApiContext::new(storage, Arc::new(PresenceRouter::new()));
    let verifier = TokenVerifier::new("test-secret", 60);
    build_router(Arc::new(AppState { api, verifier }))
}

async fn login_as(app: &Router, username: &str) -> LoginResponse {
    let request = Request::post("/login")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "username": username }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(bytes.as_ref(), b"ok");
}

#[tokio::test]
async fn conversation_routes_require_a_bearer_token() {
    let app = test_app().await;

    let bare = Request::get("/conversations")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(bare).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = Request::get("/conversations")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(forged).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn direct_conversation_creation_is_idempotent_over_http() {
    let app = test_app().await;
    let alice = login_as(&app, "alice").await;
    let bob = login_as(&app, "bob").await;

    let create = |token: String, recipient: i64| {
        Request::post("/conversations")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(
                serde_json::json!({ "kind": "direct", "recipient_id": recipient }).to_string(),
            ))
            .expect("request")
    };

    let first = app
        .clone()
        .oneshot(create(alice.token.clone(), bob.user_id))
        .await
        .expect("response");
    assert_eq!(first.status(), StatusCode::CREATED);
    let created: ChatSummary = json_body(first).await;

    // Re-creating from the other side lands on the same conversation.
    let second = app
        .clone()
        .oneshot(create(bob.token.clone(), alice.user_id))
        .await
        .expect("response");
    assert_eq!(second.status(), StatusCode::OK);
    let existing: ChatSummary = json_body(second).await;
    assert_eq!(existing.chat_id, created.chat_id);
    assert_eq!(
        existing.recipient.expect("recipient").user_id,
        UserId(alice.user_id)
    );

    let list = Request::get("/conversations")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(list).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let chats: Vec<ChatSummary> = json_body(response).await;
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].chat_id, created.chat_id);
}

#[tokio::test]
async fn message_flow_send_list_and_mark_read() {
    let app = test_app().await;
    let alice = login_as(&app, "alice").await;
    let bob = login_as(&app, "bob").await;

    let create = Request::post("/conversations")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(
            serde_json::json!({ "kind": "direct", "recipient_id": bob.user_id }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(create).await.expect("response");
    let chat: ChatSummary = json_body(response).await;
    let chat_id = chat.chat_id.0;

    let send = Request::post(format!("/conversations/{chat_id}/messages"))
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(
            serde_json::json!({ "body": "hello bob" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(send).await.expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let message: MessagePayload = json_body(response).await;
    assert_eq!(message.body.as_deref(), Some("hello bob"));
    assert_eq!(message.sender_id, UserId(alice.user_id));

    let list = Request::get(format!("/conversations/{chat_id}/messages"))
        .header("authorization", format!("Bearer {}", bob.token))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(list).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let messages: Vec<MessagePayload> = json_body(response).await;
    assert_eq!(messages.len(), 1);

    // The sender already counts as a reader; bob's first mark flips one row.
    let mark = |token: String| {
        Request::post(format!("/conversations/{chat_id}/read"))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request")
    };
    let response = app
        .clone()
        .oneshot(mark(bob.token.clone()))
        .await
        .expect("response");
    let marked: MarkReadResponse = json_body(response).await;
    assert_eq!(marked.updated_count, 1);

    let response = app.oneshot(mark(alice.token.clone())).await.expect("response");
    let marked: MarkReadResponse = json_body(response).await;
    assert_eq!(marked.updated_count, 0);
}

#[tokio::test]
async fn empty_message_and_unknown_chat_map_to_http_errors() {
    let app = test_app().await;
    let alice = login_as(&app, "alice").await;
    let bob = login_as(&app, "bob").await;

    let create = Request::post("/conversations")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(
            serde_json::json!({ "kind": "direct", "recipient_id": bob.user_id }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(create).await.expect("response");
    let chat: ChatSummary = json_body(response).await;

    let empty = Request::post(format!("/conversations/{}/messages", chat.chat_id.0))
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(serde_json::json!({ "body": "   " }).to_string()))
        .expect("request");
    let response = app.clone().oneshot(empty).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let missing = Request::get("/conversations/9999/messages")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(missing).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn group_membership_routes_enforce_admin_rules() {
    let app = test_app().await;
    let alice = login_as(&app, "alice").await;
    let bob = login_as(&app, "bob").await;
    let carol = login_as(&app, "carol").await;

    let create = Request::post("/conversations")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(
            serde_json::json!({
                "kind": "group",
                "title": "trio",
                "participant_ids": [bob.user_id],
            })
            .to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(create).await.expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let chat: ChatSummary = json_body(response).await;
    let chat_id = chat.chat_id.0;
    assert_eq!(chat.admin_ids, vec![UserId(alice.user_id)]);

    // Non-admins cannot grow the group.
    let outsider_add = Request::post(format!("/conversations/{chat_id}/members"))
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", bob.token))
        .body(Body::from(
            serde_json::json!({ "user_ids": [carol.user_id] }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(outsider_add).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let admin_add = Request::post(format!("/conversations/{chat_id}/members"))
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(
            serde_json::json!({ "user_ids": [carol.user_id] }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(admin_add).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let updated: ChatSummary = json_body(response).await;
    assert_eq!(updated.participant_ids.len(), 3);

    // The only admin cannot be removed, even by themselves.
    let remove_sole_admin = Request::delete(format!(
        "/conversations/{chat_id}/members/{}",
        alice.user_id
    ))
    .header("authorization", format!("Bearer {}", alice.token))
    .body(Body::empty())
    .expect("request");
    let response = app
        .clone()
        .oneshot(remove_sole_admin)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let remove_bob = Request::delete(format!("/conversations/{chat_id}/members/{}", bob.user_id))
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(remove_bob).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let bob_list = Request::get(format!("/conversations/{chat_id}/messages"))
        .header("authorization", format!("Bearer {}", bob.token))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(bob_list).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn leave_and_hide_return_no_content() {
    let app = test_app().await;
    let alice = login_as(&app, "alice").await;
    let bob = login_as(&app, "bob").await;

    let create = Request::post("/conversations")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(
            serde_json::json!({ "kind": "direct", "recipient_id": bob.user_id }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(create).await.expect("response");
    let chat: ChatSummary = json_body(response).await;
    let chat_id = chat.chat_id.0;

    let hide = Request::put(format!("/conversations/{chat_id}/hide"))
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(hide).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let list = Request::get("/conversations")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(list).await.expect("response");
    let chats: Vec<ChatSummary> = json_body(response).await;
    assert!(chats.is_empty());

    let leave = Request::post(format!("/conversations/{chat_id}/leave"))
        .header("authorization", format!("Bearer {}", bob.token))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(leave).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[test]
fn socket_handshake_without_a_token_is_a_missing_credential() {
    let absent = WsQuery { token: None };
    assert_eq!(absent.token(), Err(AuthError::Missing));

    let present = WsQuery {
        token: Some("abc.def.ghi".to_string()),
    };
    assert_eq!(present.token(), Ok("abc.def.ghi"));
}
