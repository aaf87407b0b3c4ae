use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::Request;
use axum::extract::State;
use axum::http::Method;
use axum::http::StatusCode;
use axum::http::header;
use axum::middleware;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use rmcp::transport::streamable_http_server::StreamableHttpServerConfig;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tracing::info;

use boris_core::ServerConfig;
use boris_core::SessionRegistry;

use crate::server::BorisServer;

/// Sessions idle past this are closed and their background tasks reaped.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const REAP_INTERVAL: Duration = Duration::from_secs(60);
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Serve `/mcp` (streamable HTTP with SSE) and `/health`.
///
/// The streamable service calls the factory once per new transport session,
/// so every session gets a fresh [`BorisServer`] bound to fresh mutable
/// state. The registry only learns about sessions that start background
/// tasks; it is how DELETE and the idle reaper reach their process groups.
pub async fn run(config: Arc<ServerConfig>) -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::default());

    let service = StreamableHttpService::new(
        {
            let config = config.clone();
            let registry = registry.clone();
            move || Ok(BorisServer::new(config.clone(), Some(registry.clone())))
        },
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig {
            sse_keep_alive: Some(SSE_KEEP_ALIVE),
            stateful_mode: true,
            ..StreamableHttpServerConfig::default()
        },
    );

    let mut mcp = Router::new()
        .nest_service("/mcp", service)
        .route_layer(middleware::from_fn_with_state(
            registry.clone(),
            session_teardown,
        ));
    if let Some(token) = config.bearer_token.clone() {
        info!("bearer authentication enabled for /mcp");
        mcp = mcp.route_layer(middleware::from_fn_with_state(
            Arc::new(token),
            require_bearer,
        ));
    }

    // /health stays unauthenticated.
    let app = mcp
        .route("/health", get(health))
        .layer(CorsLayer::permissive());

    tokio::spawn({
        let registry = registry.clone();
        async move {
            let mut tick = tokio::time::interval(REAP_INTERVAL);
            loop {
                tick.tick().await;
                registry.reap_idle(SESSION_IDLE_TIMEOUT).await;
            }
        }
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    tokio::select! {
        served = axum::serve(listener, app).into_future() => {
            served?;
        }
        _ = crate::shutdown_signal() => {
            info!("shutting down");
        }
    }

    registry.close_all().await;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "name": "boris",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Route transport session teardown to the registry. DELETE /mcp ends the
/// protocol session; any background tasks that session registered are
/// killed off the request path.
async fn session_teardown(
    State(registry): State<Arc<SessionRegistry>>,
    request: Request,
    next: Next,
) -> Response {
    let closing = if request.method() == Method::DELETE {
        request
            .headers()
            .get("mcp-session-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    } else {
        None
    };

    let response = next.run(request).await;

    if let Some(id) = closing {
        tokio::spawn(async move {
            registry.close_and_remove(&id).await;
        });
    }
    response
}

async fn require_bearer(
    State(token): State<Arc<String>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|presented| bool::from(presented.as_bytes().ct_eq(token.as_bytes())));

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response()
    }
}
