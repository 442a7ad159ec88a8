//! `GET /api/tags` — list every locally stored model tag.

use std::sync::Arc;

use hyper::{Body, Response, StatusCode};
use serde::Serialize;

use crate::server::response_helpers::{app_error_response, json_response};
use crate::server::state::AppState;

#[derive(Serialize)]
struct TagEntry {
    name: String,
    modified_at: Option<String>,
    size: u64,
}

#[derive(Serialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

pub fn handle(state: &Arc<AppState>, origin: Option<&str>) -> Response<Body> {
    match state.store.list() {
        Ok(summaries) => {
            let models = summaries
                .into_iter()
                .map(|s| TagEntry {
                    name: s.reference.to_string(),
                    modified_at: s.modified_at,
                    size: s.size,
                })
                .collect();
            json_response(StatusCode::OK, &TagsResponse { models }, origin)
        }
        Err(e) => app_error_response(&e, origin),
    }
}
