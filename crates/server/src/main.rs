use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use presence::{GroupKey, PresenceRouter};
use serde::{Deserialize, Serialize};
use server_api::{
    add_members, create_direct, create_group, hide, leave, list_for_user, list_messages,
    mark_read, remove_member, send_message, ApiContext,
};
use shared::{
    domain::{ChatId, UserId},
    error::{ApiError, AuthError, ErrorCode},
    protocol::{ChatSummary, ClientRequest, MediaRef, MessagePayload, ServerEvent},
};
use storage::Storage;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod auth;
mod config;

use auth::{authenticate, bearer_token, TokenVerifier};
use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    verifier: TokenVerifier,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginResponse {
    user_id: i64,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CreateConversationRequest {
    Direct {
        recipient_id: i64,
    },
    Group {
        title: String,
        participant_ids: Vec<i64>,
    },
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    media: Option<MediaRef>,
}

#[derive(Debug, Deserialize)]
struct AddMembersRequest {
    user_ids: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkReadResponse {
    updated_count: u64,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

impl WsQuery {
    /// Absence of the credential is a 401 like everywhere else, not a
    /// deserialization failure.
    fn token(&self) -> Result<&str, AuthError> {
        self.token.as_deref().ok_or(AuthError::Missing)
    }
}

type Rejection = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext::new(storage, Arc::new(PresenceRouter::new()));
    let verifier = TokenVerifier::new(settings.auth_token_secret, settings.auth_token_ttl_seconds);

    let state = AppState { api, verifier };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/conversations", get(http_list_conversations))
        .route("/conversations", post(http_create_conversation))
        .route("/conversations/:chat_id/messages", get(http_list_messages))
        .route("/conversations/:chat_id/messages", post(http_send_message))
        .route("/conversations/:chat_id/read", post(http_mark_read))
        .route("/conversations/:chat_id/members", post(http_add_members))
        .route(
            "/conversations/:chat_id/members/:member_id",
            delete(http_remove_member),
        )
        .route("/conversations/:chat_id/leave", post(http_leave))
        .route("/conversations/:chat_id/hide", put(http_hide))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: ApiError) -> Rejection {
    (status_for(error.code), Json(error))
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, Rejection> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let token = bearer_token(header).map_err(|e| reject(e.into()))?;
    authenticate(&state.api.storage, &state.verifier, token)
        .await
        .map_err(reject)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, Rejection> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, Rejection> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "username cannot be empty",
        )));
    }

    let user_id = state
        .api
        .storage
        .create_user(username)
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    let token = state
        .verifier
        .mint(user_id)
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;

    Ok(Json(LoginResponse {
        user_id: user_id.0,
        token,
    }))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatSummary>>, Rejection> {
    let user_id = require_user(&state, &headers).await?;
    let chats = list_for_user(&state.api, user_id).await.map_err(reject)?;
    Ok(Json(chats))
}

async fn http_create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<ChatSummary>), Rejection> {
    let user_id = require_user(&state, &headers).await?;
    match req {
        CreateConversationRequest::Direct { recipient_id } => {
            let result = create_direct(&state.api, user_id, UserId(recipient_id))
                .await
                .map_err(reject)?;
            let status = if result.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            Ok((status, Json(result.chat)))
        }
        CreateConversationRequest::Group {
            title,
            participant_ids,
        } => {
            let participant_ids: Vec<UserId> =
                participant_ids.into_iter().map(UserId).collect();
            let chat = create_group(&state.api, user_id, &participant_ids, &title)
                .await
                .map_err(reject)?;
            Ok((StatusCode::CREATED, Json(chat)))
        }
    }
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<MessagePayload>>, Rejection> {
    let user_id = require_user(&state, &headers).await?;
    let messages = list_messages(&state.api, user_id, ChatId(chat_id))
        .await
        .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessagePayload>), Rejection> {
    let user_id = require_user(&state, &headers).await?;
    let message = send_message(
        &state.api,
        user_id,
        ChatId(chat_id),
        req.body.as_deref(),
        req.media.as_ref(),
    )
    .await
    .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<MarkReadResponse>, Rejection> {
    let user_id = require_user(&state, &headers).await?;
    let updated_count = mark_read(&state.api, user_id, ChatId(chat_id))
        .await
        .map_err(reject)?;
    Ok(Json(MarkReadResponse { updated_count }))
}

async fn http_add_members(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<AddMembersRequest>,
) -> Result<Json<ChatSummary>, Rejection> {
    let user_id = require_user(&state, &headers).await?;
    let new_ids: Vec<UserId> = req.user_ids.into_iter().map(UserId).collect();
    let chat = add_members(&state.api, user_id, ChatId(chat_id), &new_ids)
        .await
        .map_err(reject)?;
    Ok(Json(chat))
}

async fn http_remove_member(
    State(state): State<Arc<AppState>>,
    Path((chat_id, member_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<StatusCode, Rejection> {
    let user_id = require_user(&state, &headers).await?;
    remove_member(&state.api, user_id, ChatId(chat_id), UserId(member_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_leave(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, Rejection> {
    let user_id = require_user(&state, &headers).await?;
    leave(&state.api, user_id, ChatId(chat_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_hide(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, Rejection> {
    let user_id = require_user(&state, &headers).await?;
    hide(&state.api, user_id, ChatId(chat_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, Rejection> {
    // Browsers cannot set headers on socket upgrades, so the credential
    // rides in the query string instead.
    let token = q.token().map_err(|e| reject(e.into()))?;
    let user_id = authenticate(&state.api.storage, &state.verifier, token)
        .await
        .map_err(reject)?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, user_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
    let connection_id = state.api.presence.register(user_id, outbox);
    info!(user_id = user_id.0, %connection_id, "socket connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbox_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let request = match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => request,
            Err(parse_error) => {
                state.api.presence.send_to(
                    connection_id,
                    ServerEvent::SendFailed {
                        chat_id: None,
                        error: ApiError::new(ErrorCode::Validation, parse_error.to_string()),
                    },
                );
                continue;
            }
        };
        handle_client_request(&state, connection_id, user_id, request).await;
    }

    state.api.presence.disconnect(connection_id);
    send_task.abort();
    info!(user_id = user_id.0, %connection_id, "socket disconnected");
}

async fn handle_client_request(
    state: &AppState,
    connection_id: shared::domain::ConnectionId,
    user_id: UserId,
    request: ClientRequest,
) {
    match request {
        ClientRequest::JoinConversation { chat_id } => {
            // Membership is checked before the connection is attached to the
            // conversation group, so outsiders never see live traffic.
            match state.api.storage.participant_status(chat_id, user_id).await {
                Ok(Some(_)) => state
                    .api
                    .presence
                    .join(connection_id, GroupKey::Chat(chat_id)),
                Ok(None) => state.api.presence.send_to(
                    connection_id,
                    ServerEvent::SendFailed {
                        chat_id: Some(chat_id),
                        error: ApiError::new(
                            ErrorCode::Forbidden,
                            "not a participant in this conversation",
                        ),
                    },
                ),
                Err(storage_error) => {
                    warn!(%storage_error, "participant lookup failed during join");
                    state.api.presence.send_to(
                        connection_id,
                        ServerEvent::SendFailed {
                            chat_id: Some(chat_id),
                            error: ApiError::new(ErrorCode::Internal, "storage failure"),
                        },
                    );
                }
            }
        }
        ClientRequest::LeaveConversation { chat_id } => {
            state
                .api
                .presence
                .leave(connection_id, GroupKey::Chat(chat_id));
        }
        ClientRequest::Send {
            chat_id,
            body,
            media,
        } => {
            if let Err(error) =
                send_message(&state.api, user_id, chat_id, body.as_deref(), media.as_ref()).await
            {
                state.api.presence.send_to(
                    connection_id,
                    ServerEvent::SendFailed {
                        chat_id: Some(chat_id),
                        error,
                    },
                );
            }
        }
        ClientRequest::MarkRead { chat_id } => {
            if let Err(error) = mark_read(&state.api, user_id, chat_id).await {
                state.api.presence.send_to(
                    connection_id,
                    ServerEvent::SendFailed {
                        chat_id: Some(chat_id),
                        error,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
