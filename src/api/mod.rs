use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::auth::require_identity;
use crate::AppState;

pub mod handlers;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Build the API router.
/// All routes are relative, the caller mounts this under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/queries", post(handlers::submit_query))
        .route("/queries/explain", post(handlers::explain_query))
        .route("/queries/dry-run", post(handlers::dry_run_delete))
        .route("/approvals", get(handlers::list_approvals))
        .route("/approvals/:id", get(handlers::get_approval))
        .route(
            "/approvals/:id/preview",
            get(handlers::get_preview).post(handlers::open_preview),
        )
        .route("/approvals/:id/review", post(handlers::review_approval))
        .route("/approvals/:id/commit", post(handlers::commit_approval))
        .route("/approvals/:id/rollback", post(handlers::rollback_approval))
        .route("/previews", get(handlers::list_active_previews))
        .layer(middleware::from_fn_with_state(state, require_identity))
        .fallback(fallback_404)
}

/// The full application: health check plus the authenticated API.
pub fn app(state: Arc<AppState>) -> Router {
    let cors_origin = state.config.cors_origin.clone();

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .nest("/api/v1", api_router(state.clone()))
        .with_state(state)
        // Statements are text; nothing legitimate comes close to this.
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _| {
                    let origin = origin.to_str().unwrap_or("");
                    origin == cors_origin
                        || origin.starts_with("http://localhost:")
                        || origin.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, REQUEST_ID]),
        )
        .layer(PropagateRequestIdLayer::new(REQUEST_ID))
        .layer(SetRequestIdLayer::new(REQUEST_ID, MakeRequestUuid))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        // Responses may carry row data.
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
