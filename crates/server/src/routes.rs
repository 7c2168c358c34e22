//! Conversation ingress.
//!
//! - `POST   /v1/conversations/{key}/messages` - queue a message (202)
//! - `GET    /v1/conversations/{key}/history`  - stored history
//! - `DELETE /v1/conversations/{key}/history`  - drop stored history (204)

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use parley_agent::ActorRegistry;
use parley_core::domain::conversation::{ChatMessage, ConversationKey};
use parley_core::domain::io::ParsedInput;
use parley_core::errors::{ApplicationError, InterfaceError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_PLATFORM: &str = "http";

#[derive(Clone)]
pub struct ConversationState {
    registry: Arc<ActorRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    pub user_id: String,
    /// Defaults to the conversation key.
    pub chat_id: Option<String>,
    pub username: Option<String>,
    pub message_ref: Option<String>,
    pub platform: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub conversation_key: String,
    pub trace_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub conversation_key: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn router(registry: Arc<ActorRegistry>) -> Router {
    Router::new()
        .route("/v1/conversations/{key}/messages", post(send_message))
        .route("/v1/conversations/{key}/history", get(get_history).delete(clear_history))
        .with_state(ConversationState { registry })
}

pub async fn send_message(
    Path(raw_key): Path<String>,
    State(state): State<ConversationState>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<SendMessageResponse>)> {
    let key = parse_key(&raw_key)?;

    let chat_id = body.chat_id.unwrap_or_else(|| key.as_str().to_string());
    let mut input = ParsedInput::new(body.text, body.user_id, chat_id);
    input.username = body.username;
    input.message_ref = body.message_ref;
    input.metadata = body.metadata;
    let input = input.with_platform(body.platform.unwrap_or_else(|| DEFAULT_PLATFORM.to_string()));

    let receipt = state.registry.receive(&key, input).await.map_err(|err| reject(err.into()))?;
    info!(
        event_name = "http.message_accepted",
        conversation_key = %key,
        trace_id = %receipt.trace_id,
        "message accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SendMessageResponse {
            conversation_key: key.as_str().to_string(),
            trace_id: receipt.trace_id.as_str().to_string(),
        }),
    ))
}

pub async fn get_history(
    Path(raw_key): Path<String>,
    State(state): State<ConversationState>,
) -> ApiResult<Json<HistoryResponse>> {
    let key = parse_key(&raw_key)?;
    let messages = state.registry.history(&key).await.map_err(|err| reject(err.into()))?;
    Ok(Json(HistoryResponse { conversation_key: key.as_str().to_string(), messages }))
}

pub async fn clear_history(
    Path(raw_key): Path<String>,
    State(state): State<ConversationState>,
) -> ApiResult<StatusCode> {
    let key = parse_key(&raw_key)?;
    state.registry.clear_history(&key).await.map_err(|err| reject(err.into()))?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_key(raw_key: &str) -> ApiResult<ConversationKey> {
    ConversationKey::parse(raw_key).map_err(|err| reject(err.into()))
}

fn reject(error: ApplicationError) -> (StatusCode, Json<ApiError>) {
    let interface = error.into_interface(Uuid::new_v4().to_string());
    let (status, detail) = match &interface {
        InterfaceError::BadRequest { message, .. } => {
            warn!(
                event_name = "http.request_rejected",
                correlation_id = interface.correlation_id(),
                error = %message,
                "request rejected"
            );
            (StatusCode::BAD_REQUEST, Some(message.clone()))
        }
        InterfaceError::ServiceUnavailable { message, .. } => {
            error!(
                event_name = "http.service_unavailable",
                correlation_id = interface.correlation_id(),
                error = %message,
                "dependency unavailable"
            );
            (StatusCode::SERVICE_UNAVAILABLE, None)
        }
        InterfaceError::Internal { message, .. } => {
            error!(
                event_name = "http.internal_error",
                correlation_id = interface.correlation_id(),
                error = %message,
                "internal error"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, None)
        }
    };

    (
        status,
        Json(ApiError {
            error: interface.user_message().to_string(),
            detail,
            correlation_id: interface.correlation_id().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use parley_agent::{
        ActorEnvironment, ActorRegistry, ActorSettings, LoopbackProvider, ManualWakeScheduler,
        ProcessOutcome, RecordingChatSink, SimpleResponder, WakeScheduler,
    };
    use parley_core::audit::InMemoryAuditSink;
    use parley_core::domain::conversation::{ConversationKey, Role};
    use parley_db::InMemoryConversationStore;
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use tower::ServiceExt;

    use super::{router, ApiError, HistoryResponse, SendMessageResponse};

    fn fixture() -> (Router, Arc<ActorRegistry>, ManualWakeScheduler) {
        let scheduler = ManualWakeScheduler::default();
        let registry = Arc::new(ActorRegistry::new(Arc::new(ActorEnvironment {
            store: Arc::new(InMemoryConversationStore::default()),
            scheduler: Arc::new(scheduler.clone()),
            responder: Arc::new(SimpleResponder::new(Arc::new(LoopbackProvider))),
            sink: Arc::new(RecordingChatSink::default()),
            audit: Arc::new(InMemoryAuditSink::default()),
            settings: ActorSettings::default(),
        })));
        (router(registry.clone()), registry, scheduler)
    }

    fn post_message(key: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/v1/conversations/{key}/messages"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn history_request(method: &str, key: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(format!("/v1/conversations/{key}/history"))
            .body(Body::empty())
            .expect("request")
    }

    async fn read_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn posted_message_is_queued_and_answered_on_wake() {
        let (app, registry, scheduler) = fixture();
        let key = ConversationKey::new("web:42");

        let response = app
            .clone()
            .oneshot(post_message("web:42", json!({ "text": "hello", "user_id": "u-1" })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted: SendMessageResponse = read_json(response).await;
        assert_eq!(accepted.conversation_key, "web:42");
        assert!(scheduler.is_scheduled(&key));

        scheduler.fire(&key);
        let outcome = registry.dispatch_wake(&key).await.expect("wake");
        let ProcessOutcome::Processed(result) = outcome else {
            panic!("expected a processed outcome");
        };
        assert_eq!(result.trace_id.as_str(), accepted.trace_id);

        let response = app.oneshot(history_request("GET", "web:42")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let history: HistoryResponse = read_json(response).await;
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.messages[1].role, Role::Assistant);
        assert_eq!(history.messages[1].content, "You said: hello");
    }

    #[tokio::test]
    async fn empty_text_is_a_bad_request_with_correlation_id() {
        let (app, _, scheduler) = fixture();

        let response = app
            .oneshot(post_message("web:42", json!({ "text": "  ", "user_id": "u-1" })))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: ApiError = read_json(response).await;
        assert!(!error.correlation_id.is_empty());
        assert_eq!(error.detail.as_deref(), Some("message text must not be empty"));
        assert!(scheduler.requests().is_empty());
    }

    #[tokio::test]
    async fn keys_with_whitespace_are_rejected() {
        let (app, _, _) = fixture();

        let response = app.oneshot(history_request("GET", "web%2042")).await.expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_clears_stored_history() {
        let (app, registry, scheduler) = fixture();
        let key = ConversationKey::new("web:7");
        app.clone()
            .oneshot(post_message("web:7", json!({ "text": "remember me", "user_id": "u-1" })))
            .await
            .expect("response");
        scheduler.fire(&key);
        registry.dispatch_wake(&key).await.expect("wake");

        let response =
            app.clone().oneshot(history_request("DELETE", "web:7")).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let history: HistoryResponse =
            read_json(app.oneshot(history_request("GET", "web:7")).await.expect("response")).await;
        assert!(history.messages.is_empty());
    }
}
