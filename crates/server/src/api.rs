use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use ragway_agent::{
    OrchestrationError, SessionContext, SessionEvent, SessionOrchestrator, ToolExecutionEngine,
    ToolStats,
};
use ragway_core::domain::collection::{CollectionConfig, CollectionId, CollectionVersion};
use ragway_core::domain::session::{Message, SessionId};
use ragway_core::domain::tool::{Permission, ToolDescriptor};
use ragway_core::errors::{ApplicationError, ErrorKind, InterfaceError};
use ragway_core::persistence::TranscriptStore;
use ragway_core::registry::CollectionRegistry;
use ragway_db::CollectionVersionRepository;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

const USER_HEADER: &str = "x-user-id";
const PERMISSIONS_HEADER: &str = "x-granted-permissions";
const CORRELATION_HEADER: &str = "x-correlation-id";
const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SessionOrchestrator,
    pub registry: Arc<CollectionRegistry>,
    pub versions: Arc<dyn CollectionVersionRepository>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub tools: Arc<ToolExecutionEngine>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub kind: ErrorKind,
    pub detail: String,
    pub correlation_id: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub collection_id: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub session_id: SessionId,
    pub limit: usize,
    pub offset: usize,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub session_id: SessionId,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct ToolSummary {
    pub descriptor: ToolDescriptor,
    pub stats: ToolStats,
    pub average_duration_ms: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions/{session_id}/query", post(query_session))
        .route("/v1/sessions/{session_id}/cancel", post(cancel_session))
        .route("/v1/sessions/{session_id}/messages", get(list_messages))
        .route("/v1/collections/{collection_id}", get(active_version))
        .route(
            "/v1/collections/{collection_id}/versions",
            get(list_versions).post(publish_version),
        )
        .route("/v1/collections/{collection_id}/versions/{version_number}", get(get_version))
        .route(
            "/v1/collections/{collection_id}/versions/{version_number}/restore",
            post(restore_version),
        )
        .route("/v1/tools", get(list_tools))
        .with_state(state)
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn reject(error: impl Into<ApplicationError>, correlation_id: &str) -> (StatusCode, Json<ApiError>) {
    let application = error.into();
    let kind = application.kind();
    let interface = application.into_interface(correlation_id);
    let (status, detail) = match &interface {
        InterfaceError::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, message.clone()),
        InterfaceError::NotFound { message, .. } => (StatusCode::NOT_FOUND, message.clone()),
        InterfaceError::Conflict { message, .. } => (StatusCode::CONFLICT, message.clone()),
        InterfaceError::ServiceUnavailable { message, .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, message.clone())
        }
        InterfaceError::Internal { message, .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
        }
    };
    if status.is_server_error() {
        error!(
            event_name = "api.request.failed",
            correlation_id = %correlation_id,
            error_kind = kind.as_str(),
            detail = %detail,
            "request failed"
        );
    }
    (
        status,
        Json(ApiError {
            error: interface.user_message().to_owned(),
            kind,
            detail,
            correlation_id: correlation_id.to_owned(),
        }),
    )
}

fn session_context(
    session_id: String,
    headers: &HeaderMap,
    correlation_id: &str,
) -> ApiResult<SessionContext> {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            reject(
                ApplicationError::InvalidRequest(format!("missing `{USER_HEADER}` header")),
                correlation_id,
            )
        })?;
    let permissions: BTreeSet<Permission> = headers
        .get(PERMISSIONS_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(Permission::parse_list)
        .unwrap_or_default();

    Ok(SessionContext::new(SessionId(session_id), user_id)
        .with_permissions(permissions)
        .with_correlation_id(correlation_id))
}

fn sse_event(event: &SessionEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().event(event.name()).data(data),
        Err(error) => Event::default()
            .event("error")
            .data(format!("{{\"type\":\"error\",\"kind\":\"internal\",\"message\":\"{error}\"}}")),
    }
}

async fn query_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let correlation_id = correlation_id(&headers);
    let context = session_context(session_id, &headers, &correlation_id)?;
    let collection_id = CollectionId(request.collection_id);

    let events = state
        .orchestrator
        .handle(&request.query, &collection_id, context)
        .await
        .map_err(|error: OrchestrationError| reject(error, &correlation_id))?;

    info!(
        event_name = "api.session.query.streaming",
        correlation_id = %correlation_id,
        collection_id = %collection_id,
        "streaming session events"
    );
    Ok(Sse::new(events.map(|event| Ok::<_, Infallible>(sse_event(&event))))
        .keep_alive(KeepAlive::default()))
}

async fn cancel_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let correlation_id = correlation_id(&headers);
    let session_id = SessionId(session_id);
    if !state.orchestrator.cancel(&session_id) {
        return Err(reject(
            ApplicationError::NotFound(format!("session `{session_id}` has no request in flight")),
            &correlation_id,
        ));
    }
    info!(
        event_name = "api.session.cancel_requested",
        correlation_id = %correlation_id,
        session_id = %session_id,
        "cancellation requested"
    );
    Ok((StatusCode::ACCEPTED, Json(CancelResponse { session_id, cancelled: true })))
}

async fn list_messages(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<MessagePage>> {
    let correlation_id = correlation_id(&headers);
    let session_id = SessionId(session_id);
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = page.offset.unwrap_or(0);

    if state
        .transcripts
        .load_session(&session_id)
        .await
        .map_err(|error| reject(error, &correlation_id))?
        .is_none()
    {
        return Err(reject(
            ApplicationError::NotFound(format!("session `{session_id}`")),
            &correlation_id,
        ));
    }
    let messages = state
        .transcripts
        .list_messages(&session_id, limit, offset)
        .await
        .map_err(|error| reject(error, &correlation_id))?;

    Ok(Json(MessagePage { session_id, limit, offset, messages }))
}

async fn active_version(
    Path(collection_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<CollectionVersion>> {
    let correlation_id = correlation_id(&headers);
    state
        .registry
        .resolve(&CollectionId(collection_id))
        .map(|version| Json((*version).clone()))
        .map_err(|error| reject(error, &correlation_id))
}

async fn list_versions(
    Path(collection_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<CollectionVersion>>> {
    let correlation_id = correlation_id(&headers);
    state
        .registry
        .versions(&CollectionId(collection_id))
        .map(|versions| Json(versions.iter().map(|version| (**version).clone()).collect()))
        .map_err(|error| reject(error, &correlation_id))
}

async fn get_version(
    Path((collection_id, version_number)): Path<(String, u64)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<CollectionVersion>> {
    let correlation_id = correlation_id(&headers);
    state
        .registry
        .version(&CollectionId(collection_id), version_number)
        .map(|version| Json((*version).clone()))
        .map_err(|error| reject(error, &correlation_id))
}

async fn publish_version(
    Path(collection_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<CollectionConfig>,
) -> ApiResult<(StatusCode, Json<CollectionVersion>)> {
    let correlation_id = correlation_id(&headers);
    let version = state
        .registry
        .publish(CollectionId(collection_id), config)
        .map_err(|error| reject(error, &correlation_id))?;
    persist_version(&state, &version, &correlation_id).await?;
    Ok((StatusCode::CREATED, Json((*version).clone())))
}

async fn restore_version(
    Path((collection_id, version_number)): Path<(String, u64)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<CollectionVersion>)> {
    let correlation_id = correlation_id(&headers);
    let version = state
        .registry
        .restore(&CollectionId(collection_id), version_number)
        .map_err(|error| reject(error, &correlation_id))?;
    persist_version(&state, &version, &correlation_id).await?;
    Ok((StatusCode::CREATED, Json((*version).clone())))
}

/// The registry is authoritative while the process runs; a failed write
/// here only loses the version across restarts.
async fn persist_version(
    state: &AppState,
    version: &CollectionVersion,
    correlation_id: &str,
) -> ApiResult<()> {
    state.versions.save(version).await.map_err(|error| {
        warn!(
            event_name = "api.collection.persist_failed",
            correlation_id = %correlation_id,
            collection_id = %version.collection_id,
            version_number = version.version_number,
            error = %error,
            "published version could not be persisted"
        );
        reject(ApplicationError::Persistence(error.to_string()), correlation_id)
    })
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolSummary>> {
    let tools = state
        .tools
        .descriptors()
        .into_iter()
        .map(|descriptor| {
            let stats = state.tools.stats(&descriptor.tool_id).unwrap_or_default();
            let average_duration_ms = stats.average_duration_ms();
            ToolSummary { descriptor, stats, average_duration_ms }
        })
        .collect();
    Json(tools)
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use ragway_core::domain::collection::CollectionConfig;
    use ragway_db::CollectionVersionRepository;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::router;
    use crate::test_support::{app_state, app_state_with_model, HangingModel};

    async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, String::from_utf8(body.to_vec()).expect("utf8"))
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-user-id", "user-1")
            .header("x-correlation-id", "req-test")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn publish_then_read_versions() {
        let state = app_state().await;
        let app = router(state.clone());

        let (status, body) = send(
            app.clone(),
            json_request(
                "POST",
                "/v1/collections/faq/versions",
                serde_json::to_value(CollectionConfig::new("nomic-embed-text")).expect("config"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");

        let (status, body) = send(app.clone(), json_request("POST", "/v1/collections/faq/versions/1/restore", json!({}))).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let restored: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(restored["version_number"], 2);

        let (status, body) = send(app.clone(), get("/v1/collections/faq")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).expect("json")["version_number"], 2);

        let (_, body) = send(app.clone(), get("/v1/collections/faq/versions")).await;
        assert_eq!(serde_json::from_str::<Vec<Value>>(&body).expect("json").len(), 2);

        let (status, _) = send(app, get("/v1/collections/faq/versions/9")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.versions.list_all().await.expect("persisted").len(), 2);
    }

    #[tokio::test]
    async fn invalid_config_is_a_bad_request() {
        let app = router(app_state().await);
        let mut config = serde_json::to_value(CollectionConfig::new("nomic-embed-text")).expect("config");
        config["retrieval"]["top_k"] = json!(0);

        let (status, body) =
            send(app, json_request("POST", "/v1/collections/faq/versions", config)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(error["correlation_id"], "req-test");
        assert_eq!(error["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn query_streams_events_until_end() {
        let state = app_state().await;
        state
            .registry
            .publish(ragway_core::CollectionId("faq".to_owned()), CollectionConfig::new("nomic-embed-text"))
            .expect("publish");
        let app = router(state);

        let (status, body) = send(
            app.clone(),
            json_request("POST", "/v1/sessions/s-1/query", json!({"query": "hi", "collection_id": "faq"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("event: session_started"));
        assert!(body.contains("event: text_delta"));
        assert!(body.contains("event: end"));

        let (status, body) = send(app, get("/v1/sessions/s-1/messages?limit=1&offset=1")).await;
        assert_eq!(status, StatusCode::OK);
        let page: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(page["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(page["messages"][0]["role"], "assistant");
    }

    #[tokio::test]
    async fn query_errors_map_to_status_codes() {
        let state = app_state_with_model(HangingModel).await;
        state
            .registry
            .publish(ragway_core::CollectionId("faq".to_owned()), CollectionConfig::new("nomic-embed-text"))
            .expect("publish");
        let app = router(state.clone());

        let (status, _) = send(
            app.clone(),
            json_request("POST", "/v1/sessions/s-1/query", json!({"query": "hi", "collection_id": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let missing_user = Request::builder()
            .method("POST")
            .uri("/v1/sessions/s-1/query")
            .header("content-type", "application/json")
            .body(Body::from(json!({"query": "hi", "collection_id": "faq"}).to_string()))
            .expect("request");
        let (status, _) = send(app.clone(), missing_user).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let first = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/sessions/s-1/query",
                json!({"query": "hi", "collection_id": "faq"}),
            ))
            .await
            .expect("first response");
        assert_eq!(first.status(), StatusCode::OK);

        let (status, body) = send(
            app.clone(),
            json_request("POST", "/v1/sessions/s-1/query", json!({"query": "again", "collection_id": "faq"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT, "{body}");

        let (status, _) = send(app.clone(), json_request("POST", "/v1/sessions/s-1/cancel", json!({}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let body = to_bytes(first.into_body(), usize::MAX).await.expect("drain stream");
        assert!(String::from_utf8_lossy(&body).contains("\"kind\":\"aborted\""));

        let (status, _) = send(app, json_request("POST", "/v1/sessions/s-1/cancel", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_session_history_is_not_found() {
        let app = router(app_state().await);
        let (status, _) = send(app, get("/v1/sessions/ghost/messages")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_endpoint_lists_registered_tools_with_stats() {
        let state = app_state().await;
        state.tools.register(crate::test_support::EchoTool).expect("register");
        let (status, body) = send(router(state), get("/v1/tools")).await;

        assert_eq!(status, StatusCode::OK);
        let tools: Vec<Value> = serde_json::from_str(&body).expect("json");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["descriptor"]["tool_id"], "echo");
        assert_eq!(tools[0]["stats"]["execution_count"], 0);
    }
}
