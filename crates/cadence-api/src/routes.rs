//! Router setup with all API routes and middleware.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::Router;
use cadence_core::{CadenceConfig, CadenceError};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // Dashboard origins: the configured port plus port+1 for a dev server.
    let port = state.config.general.port;
    let dev_port = port.saturating_add(1);
    let origins: Vec<HeaderValue> = [port, dev_port]
        .iter()
        .flat_map(|p| [format!("http://127.0.0.1:{}", p), format!("http://localhost:{}", p)])
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let automation_routes = Router::new()
        .route("/overview", get(handlers::overview))
        .route(
            "/queue",
            get(handlers::list_queue).delete(handlers::clear_queue),
        )
        .route("/queue/reorder", post(handlers::reorder_queue))
        .route("/queue/{item_id}/cancel", post(handlers::cancel_item))
        .route("/queue/{item_id}/retry", post(handlers::retry_item))
        .route("/queue/{item_id}/priority", put(handlers::update_priority))
        .route(
            "/connections/schedule",
            post(handlers::schedule_connection),
        )
        .route(
            "/engagement/schedule",
            post(handlers::schedule_engagement),
        )
        .route("/emergency-stop", post(handlers::emergency_stop))
        .route("/resume", post(handlers::resume))
        .route("/admin/clear", post(handlers::admin_clear))
        .route("/safety/status", get(handlers::safety_status))
        .route("/safety/alerts", get(handlers::safety_alerts))
        .route(
            "/safety/alerts/{alert_id}/acknowledge",
            post(handlers::acknowledge_alert),
        )
        .route("/quota", get(handlers::quota))
        .route(
            "/settings",
            get(handlers::get_settings)
                .put(handlers::update_settings)
                .layer(DefaultBodyLimit::max(64 * 1024)),
        )
        .route("/stream", get(handlers::stream));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws/automation/{account_id}", get(ws::ws_handler))
        .nest("/automation/{account_id}", automation_routes)
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured address and serve until `shutdown` resolves.
pub async fn start_server(
    config: &CadenceConfig,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), CadenceError> {
    let addr = format!("{}:{}", config.general.bind, config.general.port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CadenceError::Api(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| CadenceError::Api(format!("Server error: {}", e)))?;

    Ok(())
}
