use std::convert::Infallible;
use std::sync::Arc;

use axum::{routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use super::command::{self, AppState};

pub fn add_routes(router: Router, state: Arc<AppState>, concurrency_limit: usize) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No background work, axum being up is enough
        .route(
            "/admin/api/rockrmsinterface/:command",
            routing::get(command::dispatch)
                .post(command::dispatch)
                .with_state(state)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit)),
        )
}

pub async fn index() -> &'static str {
    "cdr api"
}
