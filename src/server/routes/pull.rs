//! `POST /api/pull` — fetches a manifest and its blobs from the registry
//! into the local store, streaming NDJSON progress events shaped like
//! `{"status": "pulling", "digest": "...", "total": N, "completed": N}`.
//!
//! Uses the shared `state.registry` rather than a fresh client per request
//! so concurrent pulls of the same reference share `RegistryClient`'s
//! `TokenCache`/`InFlightTransfers` (spec §4.3 point 4, §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::{Body, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;

use crate::error::{AppError, AppResult};
use crate::registry::progress::{Progress, ProgressStatus};
use crate::server::ndjson::ndjson_response;
use crate::server::request_parsing::parse_json_body;
use crate::server::response_helpers::app_error_response;
use crate::server::state::AppState;
use crate::store::Reference;

#[derive(Deserialize)]
struct PullRequest {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    insecure: bool,
    username: Option<String>,
    password: Option<String>,
}

/// Also used by `routes::push`, which streams the identical event shape.
#[derive(Serialize, Clone)]
pub struct PullEvent {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed: Option<u64>,
}

impl PullEvent {
    pub fn status_only(status: &str) -> Self {
        PullEvent {
            status: status.to_string(),
            digest: None,
            total: None,
            completed: None,
        }
    }
}

impl From<Progress> for PullEvent {
    fn from(p: Progress) -> Self {
        let status = match p.status {
            ProgressStatus::Downloading => "pulling",
            ProgressStatus::Verifying => "verifying sha256",
            ProgressStatus::Complete => "pulling",
        };
        PullEvent {
            status: status.to_string(),
            digest: Some(p.digest),
            total: Some(p.total),
            completed: Some(p.completed),
        }
    }
}

pub async fn handle(
    state: &Arc<AppState>,
    req: Request<Body>,
    origin: Option<&str>,
) -> Response<Body> {
    let body: PullRequest = match parse_json_body(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return app_error_response(&e, origin),
    };

    let reference = Reference::parse(&body.name);
    let (tx, rx) = mpsc::channel::<PullEvent>(16);
    let state = Arc::clone(state);
    let credentials = body.username.zip(body.password);

    tokio::spawn(async move {
        let result = run_pull(&state, &reference, credentials, &tx).await;
        let final_event = match result {
            Ok(()) => PullEvent::status_only("success"),
            Err(e) => PullEvent::status_only(&format!("error: {e}")),
        };
        let _ = tx.send(final_event).await;
    });

    ndjson_response(rx, origin.map(str::to_string))
}

async fn run_pull(
    state: &Arc<AppState>,
    reference: &Reference,
    credentials: Option<(String, String)>,
    tx: &mpsc::Sender<PullEvent>,
) -> AppResult<()> {
    let registry_creds = credentials.clone();
    let blocking_reference = reference.clone();
    let registry = Arc::clone(&state.registry);
    let manifest = spawn_blocking(move || {
        registry.get_manifest(&blocking_reference, registry_creds.as_ref())
    })
    .await
    .map_err(|e| crate::error::AppError::Internal(format!("pull task panicked: {e}")))??;

    let root = state.store.root().to_path_buf();
    let mut blobs = vec![manifest.config.clone()];
    blobs.extend(manifest.layers.clone());

    // Shared across every blob in this pull: a client disconnect (detected
    // via a failed send on `tx`) stops the in-flight transfer promptly
    // rather than letting it run to completion in the background.
    let cancel = Arc::new(AtomicBool::new(false));

    for layer in blobs {
        let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(16);
        let pull_future = state.registry.pull_blob(
            reference,
            &layer.digest,
            layer.size,
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
        let (result, ()) = tokio::join!(pull_future, forward);
        result?;
        if cancel.load(Ordering::Relaxed) {
            return Err(AppError::Canceled);
        }
    }

    let _ = tx.send(PullEvent::status_only("writing manifest")).await;
    state.store.write_manifest(reference, &manifest)
}
