//! `POST /api/copy` — duplicate a manifest under a new reference, sharing
//! the same underlying blobs (no bytes are copied).

use std::sync::Arc;

use hyper::{Body, Request, Response, StatusCode};
use serde::Deserialize;

use crate::server::request_parsing::parse_json_body;
use crate::server::response_helpers::{app_error_response, empty_response};
use crate::server::state::AppState;
use crate::store::Reference;

#[derive(Deserialize)]
struct CopyRequest {
    source: String,
    destination: String,
}

pub async fn handle(
    state: &Arc<AppState>,
    req: Request<Body>,
    origin: Option<&str>,
) -> Response<Body> {
    let body: CopyRequest = match parse_json_body(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return app_error_response(&e, origin),
    };

    let source = Reference::parse(&body.source);
    let destination = Reference::parse(&body.destination);

    let manifest = match state.store.read_manifest(&source) {
        Ok(m) => m,
        Err(e) => return app_error_response(&e, origin),
    };

    match state.store.write_manifest(&destination, &manifest) {
        Ok(()) => empty_response(StatusCode::OK, origin),
        Err(e) => app_error_response(&e, origin),
    }
}
