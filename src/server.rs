//! HTTP and WebSocket surface.
//!
//! Two listeners with disjoint routes. The control origin exposes the
//! sandbox-addressed operations as JSON endpoints. The preview origin only
//! serves hosted documents with their policy header and accepts the sandbox
//! message channel over WebSocket, gated by the per-sandbox channel token.

use crate::bundle::{SourceBundle, FRONTEND_KEY};
use crate::channel::NetworkConditions;
use crate::engine::PreviewEngine;
use crate::error::{SandboxError, SandboxResult};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// JSON error body with a status derived from the error kind
pub struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
            SandboxError::Unauthorized(_) => StatusCode::FORBIDDEN,
            SandboxError::InvalidBundle(_)
            | SandboxError::Assembly(_)
            | SandboxError::Protocol(_)
            | SandboxError::SerdeError(_) => StatusCode::BAD_REQUEST,
            SandboxError::HotReloadDisabled(_) | SandboxError::InspectionInFlight(_) => {
                StatusCode::CONFLICT
            }
            SandboxError::ChannelClosed(_)
            | SandboxError::ChannelUnavailable(_)
            | SandboxError::SessionReset(_) => StatusCode::SERVICE_UNAVAILABLE,
            SandboxError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SandboxError::Config(_) | SandboxError::IoError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    /// Shorthand for a bundle with a single `frontend` entry
    #[serde(default)]
    pub frontend: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Sandbox this generation supersedes
    #[serde(default)]
    pub replaces: Option<String>,
}

impl PreviewRequest {
    fn into_bundle(self) -> SourceBundle {
        let mut bundle = SourceBundle::from_files(self.files);
        if let Some(frontend) = self.frontend {
            bundle = bundle.with_file(FRONTEND_KEY, frontend);
        }
        bundle
    }
}

#[derive(Debug, Deserialize)]
pub struct ComponentBody {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct InspectQuery {
    pub selector: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    #[serde(default)]
    pub token: String,
}

/// Routes of the control API. Nothing here is reachable from a preview.
pub fn control_router(engine: PreviewEngine) -> Router {
    Router::new()
        .route("/previews", post(create_preview))
        .route("/sandboxes", get(list_sandboxes))
        .route("/sandboxes/{id}", get(get_sandbox).delete(delete_sandbox))
        .route("/sandboxes/{id}/console", get(console_output))
        .route("/sandboxes/{id}/network", get(network_requests))
        .route("/sandboxes/{id}/inspect", get(inspect_element))
        .route("/sandboxes/{id}/hot-reload", post(enable_hot_reload))
        .route("/sandboxes/{id}/components/{component_id}", post(update_component))
        .route("/sandboxes/{id}/reload", post(full_reload))
        .route("/sandboxes/{id}/network-conditions", post(network_conditions))
        .route("/sandboxes/{id}/performance", get(performance_profile))
        .route("/sandboxes/{id}/accessibility", get(accessibility_audit))
        .route("/sandboxes/{id}/security", get(security_audit))
        .route("/sandboxes/{id}/tests", post(run_tests))
        .fallback(not_found)
        .with_state(engine)
}

/// Routes of the preview origin: hosted documents and their channels.
pub fn preview_router(engine: PreviewEngine) -> Router {
    Router::new()
        .route("/preview/{handle}", get(preview_document))
        .route("/sandboxes/{id}/channel", get(channel_ws))
        .fallback(not_found)
        .with_state(engine)
}

/// Bind both origins and serve until the process stops or a listener fails.
pub async fn serve(
    engine: PreviewEngine,
    control_addr: SocketAddr,
    preview_addr: SocketAddr,
) -> SandboxResult<()> {
    let control = TcpListener::bind(control_addr).await?;
    let preview = TcpListener::bind(preview_addr).await?;
    info!("Control API listening on http://{}", control.local_addr()?);
    info!("Preview origin listening on http://{}", preview.local_addr()?);

    let control_app = control_router(engine.clone());
    let preview_app = preview_router(engine);
    tokio::try_join!(
        async { axum::serve(control, control_app).await },
        async { axum::serve(preview, preview_app).await },
    )?;
    Ok(())
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    debug!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not Found" })))
}

async fn create_preview(
    State(engine): State<PreviewEngine>,
    Json(request): Json<PreviewRequest>,
) -> Response {
    let replaces = request.replaces.clone();
    let bundle = request.into_bundle();
    let result = match replaces {
        Some(previous) => engine.regenerate_preview(&previous, &bundle),
        None => engine.generate_preview(&bundle),
    };
    let status = if result.is_ready() {
        StatusCode::CREATED
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(result)).into_response()
}

async fn preview_document(
    State(engine): State<PreviewEngine>,
    Path(handle): Path<String>,
) -> Response {
    match engine.document(&handle) {
        Some(document) => (
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
                (header::CONTENT_SECURITY_POLICY, document.policy),
                (header::X_CONTENT_TYPE_OPTIONS, "nosniff".to_string()),
                (header::CACHE_CONTROL, "no-store".to_string()),
            ],
            document.html.to_string(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Preview not found").into_response(),
    }
}

async fn list_sandboxes(State(engine): State<PreviewEngine>) -> impl IntoResponse {
    Json(json!({ "sandboxes": engine.sandbox_ids() }))
}

async fn get_sandbox(State(engine): State<PreviewEngine>, Path(id): Path<String>) -> Response {
    match engine.environment(&id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => ApiError(SandboxError::NotFound(format!("sandbox {}", id))).into_response(),
    }
}

async fn delete_sandbox(State(engine): State<PreviewEngine>, Path(id): Path<String>) -> StatusCode {
    engine.cleanup_preview_environment(&id);
    StatusCode::NO_CONTENT
}

async fn console_output(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
) -> ApiResult<Vec<crate::registry::ConsoleEntry>> {
    Ok(Json(engine.get_console_output(&id)?))
}

async fn network_requests(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
) -> ApiResult<Vec<crate::registry::NetworkEntry>> {
    Ok(Json(engine.get_network_requests(&id)?))
}

async fn inspect_element(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
    Query(query): Query<InspectQuery>,
) -> ApiResult<crate::channel::ElementInfo> {
    Ok(Json(engine.inspect_element(&id, &query.selector).await?))
}

async fn enable_hot_reload(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    engine.enable_hot_reloading(&id)?;
    Ok(Json(json!({ "hotReload": true })))
}

async fn update_component(
    State(engine): State<PreviewEngine>,
    Path((id, component_id)): Path<(String, String)>,
    Json(body): Json<ComponentBody>,
) -> ApiResult<crate::engine::ComponentUpdate> {
    Ok(Json(engine.update_component(&id, &component_id, &body.code)?))
}

async fn full_reload(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let delivery = engine.full_reload(&id)?;
    Ok(Json(json!({ "delivery": delivery })))
}

async fn network_conditions(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
    Json(conditions): Json<NetworkConditions>,
) -> ApiResult<serde_json::Value> {
    let delivery = engine.simulate_network_conditions(&id, conditions)?;
    Ok(Json(json!({ "delivery": delivery, "conditions": conditions })))
}

async fn performance_profile(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
) -> ApiResult<crate::telemetry::PerformanceMetrics> {
    Ok(Json(engine.performance_profile(&id)?))
}

async fn accessibility_audit(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
) -> ApiResult<crate::telemetry::AccessibilityReport> {
    Ok(Json(engine.accessibility_audit(&id)?))
}

async fn security_audit(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
) -> ApiResult<crate::telemetry::SecurityReport> {
    Ok(Json(engine.security_audit(&id)?))
}

async fn run_tests(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
) -> ApiResult<crate::telemetry::TestReport> {
    Ok(Json(engine.run_tests(&id)?))
}

/// GET /sandboxes/{id}/channel?token=: each connection is a new channel
/// session. The token is checked before the upgrade.
async fn channel_ws(
    State(engine): State<PreviewEngine>,
    Path(id): Path<String>,
    Query(query): Query<ChannelQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(e) = engine.authorize_channel(&id, &query.token) {
        return ApiError(e).into_response();
    }
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| run_channel(socket, engine, id)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn run_channel(socket: WebSocket, engine: PreviewEngine, id: String) {
    let (session, mut outbound) = match engine.attach_channel(&id) {
        Ok(attached) => attached,
        Err(e) => {
            warn!("Refusing channel for {}: {}", id, e);
            return;
        }
    };
    info!("Sandbox {} connected (session {})", id, session);

    let (mut sink, mut stream) = socket.split();

    // Host messages -> socket. Ends when the session is replaced or released.
    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Could not encode message for {}: {}", writer_id, e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            Message::Text(text) => match engine.dispatch(&id, session, text.as_str()) {
                Ok(()) => {}
                Err(SandboxError::ChannelClosed(_)) => break,
                Err(e) => warn!("Dropping message from {}: {}", id, e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    engine.detach_channel(&id, session);
    writer.abort();
    info!("Sandbox {} disconnected (session {})", id, session);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const APP: &str = "export default function App() { return <h1>Hello</h1>; }";

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Response) {
        let response = app.oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(
            ApiError(SandboxError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(SandboxError::Timeout("x".into())).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError(SandboxError::ChannelUnavailable("x".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(SandboxError::Unauthorized("x".into())).status(),
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn create_then_fetch_document_with_policy_header() {
        let engine = PreviewEngine::default();
        let control = control_router(engine.clone());
        let preview = preview_router(engine.clone());

        let (status, response) =
            send(control.clone(), post_json("/previews", json!({ "frontend": APP }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ready");
        let url = body["url"].as_str().unwrap();
        assert!(url.starts_with("http://127.0.0.1:4174/preview/"));
        let path = &url[url.find("/preview/").unwrap()..];

        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let (status, _) = send(control, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let (status, response) = send(preview, request).await;
        assert_eq!(status, StatusCode::OK);
        let policy = response
            .headers()
            .get(header::CONTENT_SECURITY_POLICY)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(policy.contains("script-src"));
        let connect = policy
            .split(';')
            .map(str::trim)
            .find(|d| d.starts_with("connect-src"))
            .unwrap();
        assert!(!connect.contains("'self'"));
        assert!(connect.contains("ws://127.0.0.1:4174/sandboxes/"));
        let html = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&html).contains("Content-Security-Policy"));
    }

    #[tokio::test]
    async fn preview_origin_exposes_no_control_routes() {
        let engine = PreviewEngine::default();
        let id = engine
            .generate_preview(&SourceBundle::from_frontend(APP))
            .sandbox_id
            .unwrap();
        let preview = preview_router(engine.clone());

        for (method, uri) in [
            ("GET", "/sandboxes".to_string()),
            ("GET", format!("/sandboxes/{}/console", id)),
            ("POST", format!("/sandboxes/{}/tests", id)),
            ("DELETE", format!("/sandboxes/{}", id)),
        ] {
            let request = Request::builder()
                .method(method)
                .uri(uri.as_str())
                .body(Body::empty())
                .unwrap();
            let (status, _) = send(preview.clone(), request).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
        }
        assert!(engine.environment(&id).is_some());
    }

    #[tokio::test]
    async fn channel_requires_the_sandbox_token() {
        let engine = PreviewEngine::default();
        let first = engine
            .generate_preview(&SourceBundle::from_frontend(APP))
            .sandbox_id
            .unwrap();
        let second = engine
            .generate_preview(&SourceBundle::from_frontend(APP))
            .sandbox_id
            .unwrap();
        let token = engine.channel_token(&first).unwrap();
        let preview = preview_router(engine.clone());
        let fetch = |uri: String| Request::builder().uri(uri).body(Body::empty()).unwrap();

        let (status, _) = send(preview.clone(), fetch(format!("/sandboxes/{}/channel", first))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(
            preview.clone(),
            fetch(format!("/sandboxes/{}/channel?token={}", second, token)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(
            preview.clone(),
            fetch(format!("/sandboxes/sbx-0-missing/channel?token={}", token)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Right token, but a plain GET is not a WebSocket upgrade.
        let (status, _) = send(
            preview,
            fetch(format!("/sandboxes/{}/channel?token={}", first, token)),
        )
        .await;
        assert_ne!(status, StatusCode::FORBIDDEN);
        assert_ne!(status, StatusCode::NOT_FOUND);
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn empty_bundle_is_unprocessable() {
        let app = control_router(PreviewEngine::default());
        let (status, response) = send(app, post_json("/previews", json!({}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["error"].as_str().unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn unknown_sandbox_is_not_found() {
        let app = control_router(PreviewEngine::default());
        let request = Request::builder()
            .uri("/sandboxes/sbx-0-missing/console")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app.clone(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method("DELETE")
            .uri("/sandboxes/sbx-0-missing")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn inspect_without_connection_fails_fast() {
        let engine = PreviewEngine::default();
        let result = engine.generate_preview(&SourceBundle::from_frontend(APP));
        let id = result.sandbox_id.unwrap();
        let app = control_router(engine);
        let request = Request::builder()
            .uri(format!("/sandboxes/{}/inspect?selector=h1", id))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
