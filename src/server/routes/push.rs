//! `POST /api/push` — uploads a local manifest's blobs and manifest to the
//! registry, streaming NDJSON progress events of the same shape as pull.
//!
//! Uses the shared `state.registry` rather than a fresh client per request,
//! for the same sharing reasons as `routes::pull`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::{Body, Request, Response};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};
use crate::registry::progress::Progress;
use crate::server::ndjson::ndjson_response;
use crate::server::request_parsing::parse_json_body;
use crate::server::response_helpers::app_error_response;
use crate::server::routes::pull::PullEvent;
use crate::server::state::AppState;
use crate::store::Reference;

#[derive(Deserialize)]
struct PushRequest {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    insecure: bool,
    username: Option<String>,
    password: Option<String>,
}

pub async fn handle(
    state: &Arc<AppState>,
    req: Request<Body>,
    origin: Option<&str>,
) -> Response<Body> {
    let body: PushRequest = match parse_json_body(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return app_error_response(&e, origin),
    };

    let reference = Reference::parse(&body.name);
    let (tx, rx) = mpsc::channel::<PullEvent>(16);
    let state = Arc::clone(state);
    let credentials = body.username.zip(body.password);

    tokio::spawn(async move {
        let result = run_push(&state, &reference, credentials, &tx).await;
        let final_event = match result {
            Ok(()) => PullEvent::status_only("success"),
            Err(e) => PullEvent::status_only(&format!("error: {e}")),
        };
        let _ = tx.send(final_event).await;
    });

    ndjson_response(rx, origin.map(str::to_string))
}

async fn run_push(
    state: &Arc<AppState>,
    reference: &Reference,
    credentials: Option<(String, String)>,
    tx: &mpsc::Sender<PullEvent>,
) -> AppResult<()> {
    let manifest = state.store.read_manifest(reference)?;

    let root = state.store.root().to_path_buf();
    let mut blobs = vec![manifest.config.clone()];
    blobs.extend(manifest.layers.clone());

    // Shared across every blob in this push: a client disconnect (detected
    // via a failed send on `tx`) stops the in-flight upload promptly rather
    // than letting it run to completion in the background.
    let cancel = Arc::new(AtomicBool::new(false));

    for layer in blobs {
        let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(16);
        let push_future = state.registry.push_blob(
            reference,
            &layer.digest,
            &root,
            credentials.clone(),
            Arc::clone(&cancel),
            progress_tx,
        );
        let forward = async {
            while let Some(update) = progress_rx.recv().await {
                if tx.send(PullEvent::from(update)).await.is_err() {
                    cancel.store(true, Ordering::Relaxed);
                    return;
                }
            }
        };
        let (result, ()) = tokio::join!(push_future, forward);
        result?;
        if cancel.load(Ordering::Relaxed) {
            return Err(AppError::Canceled);
        }
    }

    let _ = tx.send(PullEvent::status_only("writing manifest")).await;
    state
        .registry
        .put_manifest(reference, &manifest, credentials.as_ref())
}
