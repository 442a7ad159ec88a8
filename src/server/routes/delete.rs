//! `DELETE /api/delete` — remove a manifest and garbage-collect any blob
//! left unreferenced by it.

use std::sync::Arc;

use hyper::{Body, Request, Response, StatusCode};
use serde::Deserialize;

use crate::server::request_parsing::parse_json_body;
use crate::server::response_helpers::{app_error_response, empty_response};
use crate::server::state::AppState;
use crate::store::Reference;

#[derive(Deserialize)]
struct DeleteRequest {
    name: String,
}

pub async fn handle(
    state: &Arc<AppState>,
    req: Request<Body>,
    origin: Option<&str>,
) -> Response<Body> {
    let body: DeleteRequest = match parse_json_body(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return app_error_response(&e, origin),
    };

    let reference = Reference::parse(&body.name);
    match state.store.delete(&reference) {
        Ok(()) => empty_response(StatusCode::OK, origin),
        Err(e) => app_error_response(&e, origin),
    }
}
