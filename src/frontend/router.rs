//! Management request router

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::debug;

use super::CaLookup;

/// Build the router served by the secured front-end
///
/// - `GET /ping` - liveness
/// - `GET /cacerts` - the server CA, 503 until it exists
pub fn router(ca: CaLookup) -> Router {
    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/cacerts", get(cacerts_handler))
        .with_state(ca)
}

async fn cacerts_handler(State(ca): State<CaLookup>) -> Response {
    match ca.ca_cert() {
        Ok(pem) => ([(header::CONTENT_TYPE, "text/plain")], pem).into_response(),
        Err(e) => {
            debug!(error = %e, "CA requested before it was available");
            (StatusCode::SERVICE_UNAVAILABLE, "CA certificate not available yet\n").into_response()
        }
    }
}
