//! `GET /` health check, grounded on `web/routes/health.rs`.

use hyper::{Body, Response};

pub fn handle() -> Response<Body> {
    Response::new(Body::from("Ollama is running"))
}
