pub mod auth;
pub mod blogs;

use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::uploads::PUBLIC_PREFIX;

/// The complete HTTP surface: JSON API, uploaded images, CORS and tracing.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origin);
    let uploads = ServeDir::new(state.uploads.dir());

    Router::new()
        .route("/", get(health))
        .merge(auth::router())
        .merge(blogs::router(state.uploads.max_bytes()))
        .nest_service(PUBLIC_PREFIX, uploads)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "Server is running"
}

fn cors_layer(origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    match HeaderValue::from_str(origin) {
        Ok(origin) => base.allow_origin(origin).allow_credentials(true),
        Err(e) => {
            tracing::warn!("Ignoring invalid CORS origin {:?}: {}", origin, e);
            base
        }
    }
}
