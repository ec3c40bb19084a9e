use crate::api::{handlers, ProbeState};
use axum::{routing::get, Router};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

/// Build the probe router
pub fn build_router(state: ProbeState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/live", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
}
