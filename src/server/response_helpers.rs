//! HTTP response helpers, grounded on `web/response_helpers.rs`, adapted to
//! route CORS decisions through a real allow-list (`server::cors`) instead
//! of a blanket `*`.

use hyper::{Body, Response, StatusCode};
use serde::Serialize;

use crate::error::AppError;

const CORS_METHODS: &str = "GET, POST, DELETE, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

fn with_cors(
    builder: hyper::http::response::Builder,
    origin: Option<&str>,
) -> hyper::http::response::Builder {
    let builder = builder
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS);
    match origin {
        Some(origin) => builder.header("access-control-allow-origin", origin),
        None => builder,
    }
}

pub fn json_response<T: Serialize>(
    status: StatusCode,
    body: &T,
    origin: Option<&str>,
) -> Response<Body> {
    let json = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string());
    with_cors(Response::builder().status(status), origin)
        .header("content-type", "application/json")
        .body(Body::from(json))
        .unwrap()
}

pub fn json_error(status: StatusCode, message: &str, origin: Option<&str>) -> Response<Body> {
    let json = serde_json::json!({ "error": message }).to_string();
    with_cors(Response::builder().status(status), origin)
        .header("content-type", "application/json")
        .body(Body::from(json))
        .unwrap()
}

pub fn app_error_response(err: &AppError, origin: Option<&str>) -> Response<Body> {
    json_error(err.status(), &err.to_string(), origin)
}

pub fn empty_response(status: StatusCode, origin: Option<&str>) -> Response<Body> {
    with_cors(Response::builder().status(status), origin)
        .body(Body::empty())
        .unwrap()
}

pub fn cors_preflight(origin: Option<&str>) -> Response<Body> {
    empty_response(StatusCode::NO_CONTENT, origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_sets_status() {
        let resp = json_error(StatusCode::BAD_REQUEST, "bad", None);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn app_error_maps_to_its_status() {
        let resp = app_error_response(&AppError::NotFound("x".into()), None);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
