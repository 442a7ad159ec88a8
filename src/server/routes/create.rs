//! `POST /api/create` — builds a manifest from a model-definition document
//! and a set of local files/blobs, streaming status updates as it goes.
//!
//! Grounded on `web/routes/download.rs`'s channel-producer pattern: a
//! blocking worker does all the real work and pushes status lines into an
//! `mpsc` channel that `ndjson_response` turns into the HTTP body. When
//! `FROM` names a registry reference not yet present locally, it is pulled
//! first (spec §4.2: the build plan's base may be "another model reference
//! which must be pulled first"), reusing `registry::RegistryClient` the
//! same way `routes::pull` does.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hyper::{Body, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;

use crate::error::{AppError, AppResult};
use crate::modelfile::{self, ModelDefinition};
use crate::registry::progress::Progress;
use crate::server::ndjson::ndjson_response;
use crate::server::request_parsing::parse_json_body;
use crate::server::response_helpers::app_error_response;
use crate::server::state::AppState;
use crate::store::manifest::{
    Layer, ModelConfig, MEDIA_TYPE_ADAPTER, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LICENSE,
    MEDIA_TYPE_MODEL, MEDIA_TYPE_SYSTEM, MEDIA_TYPE_TEMPLATE, SCHEMA_VERSION,
};
use crate::store::{Manifest, ModelStore, Reference};

#[derive(Deserialize)]
struct CreateRequest {
    name: String,
    path: String,
}

#[derive(Serialize)]
struct CreateStatus {
    status: String,
}

pub async fn handle(
    state: &Arc<AppState>,
    req: Request<Body>,
    origin: Option<&str>,
) -> Response<Body> {
    let body: CreateRequest = match parse_json_body(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return app_error_response(&e, origin),
    };

    let reference = Reference::parse(&body.name);
    if state.store.read_manifest(&reference).is_ok() {
        return app_error_response(
            &AppError::Conflict(format!("model already exists: {reference}")),
            origin,
        );
    }

    let (tx, rx) = mpsc::channel::<CreateStatus>(8);
    let state = Arc::clone(state);
    let modelfile_path = body.path;

    tokio::spawn(async move {
        let result = run_create(&state, &reference, &modelfile_path, &tx).await;
        match result {
            Ok(()) => send(&tx, "success").await,
            Err(e) => send(&tx, &format!("error: {e}")).await,
        }
    });

    ndjson_response(rx, origin.map(str::to_string))
}

async fn run_create(
    state: &Arc<AppState>,
    reference: &Reference,
    modelfile_path: &str,
    tx: &mpsc::Sender<CreateStatus>,
) -> AppResult<()> {
    send(tx, "reading model file").await;
    let modelfile_path_owned = modelfile_path.to_string();
    let definition: ModelDefinition = spawn_blocking(move || {
        let source = std::fs::read_to_string(&modelfile_path_owned)
            .map_err(|e| AppError::BadRequest(format!("cannot read {modelfile_path_owned}: {e}")))?;
        modelfile::parse(&source)
            .map_err(|e| AppError::BadRequest(format!("invalid model file: {e}")))
    })
    .await
    .map_err(|e| AppError::Internal(format!("create task panicked: {e}")))??;

    send(tx, "resolving base model").await;
    let from_layer = resolve_from_layer(state, &definition, tx).await?;

    let store = state.store.clone();
    let tx_blocking = tx.clone();
    let manifest = spawn_blocking(move || build_manifest(&store, &definition, from_layer, &tx_blocking))
        .await
        .map_err(|e| AppError::Internal(format!("create task panicked: {e}")))??;

    state.store.write_manifest(reference, &manifest)
}

fn build_manifest(
    store: &ModelStore,
    definition: &ModelDefinition,
    from_layer: Layer,
    tx: &mpsc::Sender<CreateStatus>,
) -> AppResult<Manifest> {
    let mut layers = vec![from_layer];

    if let Some(template) = &definition.template {
        send_blocking(tx, "writing template layer");
        layers.push(blob_layer(store, MEDIA_TYPE_TEMPLATE, template.as_bytes())?);
    }
    if let Some(system) = &definition.system {
        send_blocking(tx, "writing system layer");
        layers.push(blob_layer(store, MEDIA_TYPE_SYSTEM, system.as_bytes())?);
    }
    for adapter_path in &definition.adapters {
        send_blocking(tx, "writing adapter layer");
        let bytes = std::fs::read(adapter_path).map_err(|e| {
            AppError::BadRequest(format!("cannot read adapter {adapter_path}: {e}"))
        })?;
        layers.push(blob_layer(store, MEDIA_TYPE_ADAPTER, &bytes)?);
    }
    for license in &definition.license {
        send_blocking(tx, "writing license layer");
        layers.push(blob_layer(store, MEDIA_TYPE_LICENSE, license.as_bytes())?);
    }

    send_blocking(tx, "writing config layer");
    let config = ModelConfig {
        parameters: definition.parameters.clone(),
    };
    let config_bytes = serde_json::to_vec(&config)?;
    let config_layer = blob_layer(store, MEDIA_TYPE_CONFIG, &config_bytes)?;

    Ok(Manifest {
        schema_version: SCHEMA_VERSION,
        config: config_layer,
        layers,
    })
}

/// Resolves the `FROM` directive into a model-weights layer. If it names a
/// local file, hashes and stores it directly; if it names a reference not
/// yet present locally, pulls the whole base model from the registry first
/// (spec §4.2), then takes its model layer.
async fn resolve_from_layer(
    state: &Arc<AppState>,
    definition: &ModelDefinition,
    tx: &mpsc::Sender<CreateStatus>,
) -> AppResult<Layer> {
    let from = definition
        .from
        .clone()
        .expect("modelfile::parse guarantees FROM is present");

    if Path::new(&from).is_file() {
        let store = state.store.clone();
        return spawn_blocking(move || {
            let bytes = std::fs::read(&from)
                .map_err(|e| AppError::BadRequest(format!("cannot read base model {from}: {e}")))?;
            blob_layer(&store, MEDIA_TYPE_MODEL, &bytes)
        })
        .await
        .map_err(|e| AppError::Internal(format!("create task panicked: {e}")))?;
    }

    let base_reference = Reference::parse(&from);
    if let Ok(manifest) = state.store.read_manifest(&base_reference) {
        return manifest
            .layer_of_type(MEDIA_TYPE_MODEL)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("base manifest has no model layer: {from}")));
    }

    send(tx, &format!("pulling base model {base_reference}")).await;
    pull_base_model(state, &base_reference, tx).await?;

    let manifest = state.store.read_manifest(&base_reference)?;
    manifest
        .layer_of_type(MEDIA_TYPE_MODEL)
        .cloned()
        .ok_or_else(|| AppError::Internal(format!("base manifest has no model layer: {from}")))
}

/// Pulls a base model's manifest and every referenced blob, the same way
/// `routes::pull::run_pull` does, forwarding coarse status lines (not the
/// fine-grained byte-progress events `/api/pull` streams) to `tx`.
async fn pull_base_model(
    state: &Arc<AppState>,
    reference: &Reference,
    tx: &mpsc::Sender<CreateStatus>,
) -> AppResult<()> {
    let registry = Arc::clone(&state.registry);
    let blocking_reference = reference.clone();
    let manifest = spawn_blocking(move || registry.get_manifest(&blocking_reference, None))
        .await
        .map_err(|e| AppError::Internal(format!("create task panicked: {e}")))??;

    let root = state.store.root().to_path_buf();
    let mut blobs = vec![manifest.config.clone()];
    blobs.extend(manifest.layers.clone());
    let cancel = Arc::new(AtomicBool::new(false));

    for layer in blobs {
        send(tx, &format!("pulling {}", layer.digest)).await;
        let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(16);
        let pull_future = state.registry.pull_blob(
            reference,
            &layer.digest,
            layer.size,
            &root,
            None,
            Arc::clone(&cancel),
            progress_tx,
        );
        let drain = async { while progress_rx.recv().await.is_some() {} };
        let (result, ()) = tokio::join!(pull_future, drain);
        result?;
    }

    state.store.write_manifest(reference, &manifest)
}

fn blob_layer(store: &ModelStore, media_type: &str, data: &[u8]) -> AppResult<Layer> {
    let (digest, size) = store.write_blob_from_bytes(data)?;
    Ok(Layer {
        media_type: media_type.to_string(),
        digest,
        size,
    })
}

async fn send(tx: &mpsc::Sender<CreateStatus>, status: &str) {
    let _ = tx
        .send(CreateStatus {
            status: status.to_string(),
        })
        .await;
}

fn send_blocking(tx: &mpsc::Sender<CreateStatus>, status: &str) {
    let _ = tx.blocking_send(CreateStatus {
        status: status.to_string(),
    });
}
