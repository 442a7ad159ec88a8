//! HTTP dispatcher: a manual `match (&Method, path)` table, grounded on
//! `main_web.rs::handle_request_impl`. Generalizes the teacher's blanket
//! `*` CORS into a real allow-list check (`cors::is_allowed_origin`) applied
//! to every route, including the `OPTIONS` preflight.

pub mod cors;
pub mod ndjson;
pub mod request_parsing;
pub mod response_helpers;
pub mod routes;
pub mod state;

use std::convert::Infallible;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};

use response_helpers::json_error;
use state::AppState;

/// Reads the `Origin` header and returns it only if it's present in the
/// request AND allowed by config; routes pass this straight into their
/// response builders so disallowed origins simply get no CORS header.
fn allowed_origin<'a>(req: &'a Request<Body>, state: &AppState) -> Option<&'a str> {
    let origin = req.headers().get("origin")?.to_str().ok()?;
    cors::is_allowed_origin(origin, &state.config.extra_origins).then_some(origin)
}

pub async fn handle(
    state: Arc<AppState>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let origin = allowed_origin(&req, &state).map(str::to_string);
    let origin = origin.as_deref();

    if method == Method::OPTIONS {
        return Ok(response_helpers::cors_preflight(origin));
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/") => routes::health::handle(),

        (&Method::GET, "/api/tags") => routes::tags::handle(&state, origin),

        (&Method::POST, "/api/generate") => routes::generate::handle(&state, req, origin).await,

        (&Method::POST, "/api/create") => routes::create::handle(&state, req, origin).await,

        (&Method::POST, "/api/pull") => routes::pull::handle(&state, req, origin).await,

        (&Method::POST, "/api/push") => routes::push::handle(&state, req, origin).await,

        (&Method::POST, "/api/copy") => routes::copy::handle(&state, req, origin).await,

        (&Method::DELETE, "/api/delete") => routes::delete::handle(&state, req, origin).await,

        _ => json_error(StatusCode::NOT_FOUND, "no such route", origin),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_route_is_404() {
        let dir = std::env::temp_dir().join(format!("modeld-server-test-{}", uuid::Uuid::new_v4()));
        let store = crate::store::ModelStore::open(&dir).unwrap();
        let registry = crate::registry::RegistryClient::new();
        let config = crate::config::Config::from_env();
        let backend = Box::leak(Box::new(
            llama_cpp_2::llama_backend::LlamaBackend::init().unwrap(),
        ));
        let state = Arc::new(AppState::new(store, registry, config, backend));

        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/nonexistent")
            .body(Body::empty())
            .unwrap();

        let resp = handle(state, req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
