//! `POST /api/generate` — the daemon's core endpoint: resolve the model,
//! load or reuse the process-singleton session, render the prompt, and
//! stream generated tokens as NDJSON.
//!
//! Grounded on `web/chat/generation.rs`'s request-handling shape and
//! `web/routes/download.rs`'s custom `Body::channel()` producer/consumer
//! wiring (used here instead of `server::ndjson::ndjson_response` because
//! this handler also needs to detect client disconnects to cancel the
//! producer, per spec §5). The producer pair (`predict_future`/`forward`)
//! is spawned so the `Response` can be handed back to hyper immediately,
//! the same way `ndjson_response` does for the other streaming routes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hyper::{Body, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AppResult;
use crate::modelfile::ParameterValue;
use crate::prompt::{select_bundled_template, PromptRenderer};
use crate::server::request_parsing::parse_json_body;
use crate::server::response_helpers::app_error_response;
use crate::server::state::{new_session_id, AppState, SessionSlot};
use crate::session::engine::{LlamaEngine, LoadOptions};
use crate::session::sampler::{MirostatMode, SamplingConfig};
use crate::session::{PredictRequest, PredictStep, Session};
use crate::store::manifest::{MEDIA_TYPE_SYSTEM, MEDIA_TYPE_TEMPLATE};
use crate::store::{ModelConfig, Reference};

#[derive(Deserialize, Default)]
struct GenerateOptions {
    temperature: Option<f32>,
    top_k: Option<i32>,
    top_p: Option<f32>,
    min_p: Option<f32>,
    typical_p: Option<f32>,
    tfs_z: Option<f32>,
    repeat_penalty: Option<f32>,
    frequency_penalty: Option<f32>,
    presence_penalty: Option<f32>,
    penalty_last_n: Option<i32>,
    mirostat: Option<i32>,
    mirostat_tau: Option<f32>,
    mirostat_eta: Option<f32>,
    seed: Option<u64>,
    num_predict: Option<i32>,
    num_ctx: Option<u32>,
    num_gpu_layers: Option<u32>,
    num_batch: Option<u32>,
    num_keep: Option<u32>,
    stop: Option<Vec<String>>,
    logit_bias: Option<HashMap<String, f32>>,
    penalize_nl: Option<bool>,
}

#[derive(Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    system: Option<String>,
    template: Option<String>,
    context: Option<Vec<i32>>,
    options: Option<GenerateOptions>,
    session_id: Option<u64>,
}

#[derive(Serialize, Clone, Default)]
struct GenerateChunk {
    model: String,
    created_at: String,
    response: String,
    done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    load_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_eval_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_eval_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eval_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eval_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

struct ResolvedSettings {
    load: LoadOptions,
    sampling: SamplingConfig,
    num_predict: i32,
    num_keep: u32,
    stop: Vec<String>,
}

pub async fn handle(
    state: &Arc<AppState>,
    req: Request<Body>,
    origin: Option<&str>,
) -> Response<Body> {
    let body: GenerateRequest = match parse_json_body(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return app_error_response(&e, origin),
    };

    match run_generate(state, body).await {
        Ok(response) => response,
        Err(e) => app_error_response(&e, origin),
    }
}

async fn run_generate(
    state: &Arc<AppState>,
    body: GenerateRequest,
) -> AppResult<Response<Body>> {
    let reference = Reference::parse(&body.model);
    let manifest = state.store.read_manifest(&reference)?;

    let model_layer = manifest
        .layer_of_type(crate::store::manifest::MEDIA_TYPE_MODEL)
        .ok_or_else(|| {
            crate::error::AppError::Internal(format!("manifest has no model layer: {reference}"))
        })?;
    if !state.store.has_blob(&model_layer.digest) {
        return Err(crate::error::AppError::NotFound(format!(
            "model weights blob missing for {reference}; pull it first"
        )));
    }
    let model_path = state.store.blob_path(&model_layer.digest);

    let config: ModelConfig = read_blob_json(state, &manifest.config.digest).unwrap_or_default();
    let mut settings = resolve_settings(&config, &body.options);
    settings.load.model_path = model_path.to_string_lossy().into_owned();

    let template_source = body
        .template
        .clone()
        .or_else(|| {
            manifest
                .layer_of_type(MEDIA_TYPE_TEMPLATE)
                .and_then(|l| read_blob_string(state, &l.digest))
        })
        .unwrap_or_else(|| select_bundled_template(&reference.name).to_string());
    let system = body.system.clone().or_else(|| {
        manifest
            .layer_of_type(MEDIA_TYPE_SYSTEM)
            .and_then(|l| read_blob_string(state, &l.digest))
    });

    let renderer = PromptRenderer::new(template_source)?;
    let first_turn = body.context.is_none();
    let rendered_prompt = renderer.render(system.as_deref(), &body.prompt, first_turn)?;

    let total_start = Instant::now();
    let mut session_guard = Arc::clone(&state.session).lock_owned().await;

    let session_affinity = matches!(
        (&*session_guard, body.session_id),
        (Some(slot), Some(id)) if slot.session_id == id
    );
    // Even without matching session affinity, a currently loaded session
    // whose load options are unchanged is kept rather than torn down and
    // reloaded from disk (spec §4.4 "Load": only a *material* difference in
    // load options forces a reload).
    let reuse = session_affinity
        || session_guard
            .as_ref()
            .is_some_and(|slot| slot.inner.satisfies(&settings.load));

    let load_duration_ns = if reuse {
        session_guard.as_ref().unwrap().load_duration_ns
    } else {
        let load_start = Instant::now();
        let engine = LlamaEngine::load_boxed(state.backend, &settings.load)?;
        let inner = Session::new(engine, settings.load.clone())?;
        let load_duration_ns = load_start.elapsed().as_nanos() as u64;

        *session_guard = Some(SessionSlot {
            session_id: new_session_id(),
            model_reference: reference.to_string(),
            template: body.template.clone(),
            system: system.clone(),
            load_duration_ns,
            inner,
        });
        load_duration_ns
    };

    let predict_request = PredictRequest {
        prompt: rendered_prompt,
        num_predict: settings.num_predict,
        num_keep: settings.num_keep,
        stop: settings.stop,
        sampling: settings.sampling,
    };

    let (step_tx, step_rx) = mpsc::channel::<PredictStep>(1);
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let producer_cancel = Arc::clone(&cancel_flag);

    let model_name = reference.to_string();
    let (body_tx, response_body) = Body::channel();

    let forward_cancel = Arc::clone(&cancel_flag);
    let forward = forward_steps(
        step_rx,
        body_tx,
        model_name,
        total_start,
        load_duration_ns,
        forward_cancel,
    );

    // Holds the session mutex for the whole generation (spec's global
    // mutual-exclusion requirement) while running off the request-handling
    // future, so the `Response` below can be handed back to hyper right
    // away instead of only after generation finishes — hyper does not poll
    // a response body until the handler future has already resolved.
    tokio::spawn(async move {
        let slot = session_guard.as_mut().unwrap();
        let predict_future = slot.inner.predict(predict_request, step_tx, move || {
            producer_cancel.load(Ordering::Relaxed)
        });
        let (predict_result, ()) = tokio::join!(predict_future, forward);
        if let Err(e) = predict_result {
            log::error!("generation failed: {e}");
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .header("access-control-allow-methods", "GET, POST, DELETE, OPTIONS")
        .header("access-control-allow-headers", "content-type, authorization")
        .body(response_body)
        .unwrap())
}

async fn forward_steps(
    mut step_rx: mpsc::Receiver<PredictStep>,
    mut body_tx: hyper::body::Sender,
    model_name: String,
    total_start: Instant,
    load_duration_ns: u64,
    cancel_flag: Arc<AtomicBool>,
) {
    let mut eval_count: u64 = 0;
    let created_at = chrono::Utc::now().to_rfc3339();

    while let Some(step) = step_rx.recv().await {
        if !step.done {
            eval_count += 1;
        }

        let chunk = if step.done {
            GenerateChunk {
                model: model_name.clone(),
                created_at: created_at.clone(),
                response: String::new(),
                done: true,
                total_duration: Some(total_start.elapsed().as_nanos() as u64),
                load_duration: Some(load_duration_ns),
                prompt_eval_count: Some(step.prompt_eval_count as u64),
                prompt_eval_duration: Some(step.prompt_eval_duration_ns),
                eval_count: Some(eval_count),
                eval_duration: Some(step.eval_duration_ns),
                error: step
                    .done_reason
                    .as_deref()
                    .filter(|r| *r == "canceled")
                    .map(|_| "canceled".to_string()),
                context: step.context,
            }
        } else {
            GenerateChunk {
                model: model_name.clone(),
                created_at: created_at.clone(),
                response: step.token_text,
                done: false,
                ..Default::default()
            }
        };

        let mut line = serde_json::to_string(&chunk).unwrap_or_default();
        line.push('\n');
        if body_tx.send_data(line.into()).await.is_err() {
            cancel_flag.store(true, Ordering::Relaxed);
            return;
        }

        if step.done {
            return;
        }
    }
}

fn resolve_settings(config: &ModelConfig, options: &Option<GenerateOptions>) -> ResolvedSettings {
    let mut sampling = SamplingConfig::default();
    let mut num_ctx: u32 = 2048;
    let num_gpu_layers: u32 = 0;
    let num_batch: u32 = 512;
    let mut num_predict: i32 = -1;
    let mut num_keep: u32 = 0;
    let mut stop: Vec<String> = Vec::new();

    for (key, value) in &config.parameters {
        apply_parameter(
            key,
            value,
            &mut sampling,
            &mut num_ctx,
            &mut num_predict,
            &mut num_keep,
            &mut stop,
        );
    }

    let mut load = LoadOptions {
        model_path: String::new(),
        num_ctx,
        num_gpu_layers,
        num_batch,
    };

    if let Some(opts) = options {
        if let Some(v) = opts.temperature {
            sampling.temperature = v;
        }
        if let Some(v) = opts.top_k {
            sampling.top_k = v;
        }
        if let Some(v) = opts.top_p {
            sampling.top_p = v;
        }
        if let Some(v) = opts.min_p {
            sampling.min_p = v;
        }
        if let Some(v) = opts.typical_p {
            sampling.typical_p = v;
        }
        if let Some(v) = opts.tfs_z {
            sampling.tfs_z = v;
        }
        if let Some(v) = opts.repeat_penalty {
            sampling.repeat_penalty = v;
        }
        if let Some(v) = opts.frequency_penalty {
            sampling.frequency_penalty = v;
        }
        if let Some(v) = opts.presence_penalty {
            sampling.presence_penalty = v;
        }
        if let Some(v) = opts.penalty_last_n {
            sampling.penalty_last_n = v;
        }
        if let Some(v) = opts.mirostat {
            sampling.mirostat = match v {
                1 => MirostatMode::V1,
                2 => MirostatMode::V2,
                _ => MirostatMode::Off,
            };
        }
        if let Some(v) = opts.mirostat_tau {
            sampling.mirostat_tau = v;
        }
        if let Some(v) = opts.mirostat_eta {
            sampling.mirostat_eta = v;
        }
        if let Some(v) = opts.seed {
            sampling.seed = v;
        }
        if let Some(v) = opts.num_predict {
            num_predict = v;
        }
        if let Some(v) = opts.num_ctx {
            load.num_ctx = v;
        }
        if let Some(v) = opts.num_gpu_layers {
            load.num_gpu_layers = v;
        }
        if let Some(v) = opts.num_batch {
            load.num_batch = v;
        }
        if let Some(v) = opts.num_keep {
            num_keep = v;
        }
        if let Some(v) = &opts.stop {
            stop = v.clone();
        }
        if let Some(v) = &opts.logit_bias {
            sampling.logit_bias = v
                .iter()
                .filter_map(|(k, bias)| k.parse::<i32>().ok().map(|token| (token, *bias)))
                .collect();
        }
        if let Some(v) = opts.penalize_nl {
            sampling.penalize_nl = v;
        }
    }

    ResolvedSettings {
        load,
        sampling,
        num_predict,
        num_keep,
        stop,
    }
}

fn apply_parameter(
    key: &str,
    value: &ParameterValue,
    sampling: &mut SamplingConfig,
    num_ctx: &mut u32,
    num_predict: &mut i32,
    num_keep: &mut u32,
    stop: &mut Vec<String>,
) {
    let as_f32 = || match value {
        ParameterValue::Float(f) => Some(*f as f32),
        ParameterValue::Int(i) => Some(*i as f32),
        ParameterValue::String(s) => s.parse().ok(),
    };
    let as_i32 = || match value {
        ParameterValue::Int(i) => Some(*i as i32),
        ParameterValue::Float(f) => Some(*f as i32),
        ParameterValue::String(s) => s.parse().ok(),
    };

    match key {
        "temperature" => {
            if let Some(v) = as_f32() {
                sampling.temperature = v;
            }
        }
        "top_k" => {
            if let Some(v) = as_i32() {
                sampling.top_k = v;
            }
        }
        "top_p" => {
            if let Some(v) = as_f32() {
                sampling.top_p = v;
            }
        }
        "min_p" => {
            if let Some(v) = as_f32() {
                sampling.min_p = v;
            }
        }
        "typical_p" => {
            if let Some(v) = as_f32() {
                sampling.typical_p = v;
            }
        }
        "repeat_penalty" => {
            if let Some(v) = as_f32() {
                sampling.repeat_penalty = v;
            }
        }
        "frequency_penalty" => {
            if let Some(v) = as_f32() {
                sampling.frequency_penalty = v;
            }
        }
        "presence_penalty" => {
            if let Some(v) = as_f32() {
                sampling.presence_penalty = v;
            }
        }
        "penalty_last_n" => {
            if let Some(v) = as_i32() {
                sampling.penalty_last_n = v;
            }
        }
        "mirostat" => {
            if let Some(v) = as_i32() {
                sampling.mirostat = match v {
                    1 => MirostatMode::V1,
                    2 => MirostatMode::V2,
                    _ => MirostatMode::Off,
                };
            }
        }
        "mirostat_tau" => {
            if let Some(v) = as_f32() {
                sampling.mirostat_tau = v;
            }
        }
        "mirostat_eta" => {
            if let Some(v) = as_f32() {
                sampling.mirostat_eta = v;
            }
        }
        "seed" => {
            if let Some(v) = as_i32() {
                sampling.seed = v as u64;
            }
        }
        "num_ctx" => {
            if let Some(v) = as_i32() {
                *num_ctx = v.max(1) as u32;
            }
        }
        "num_predict" => {
            if let Some(v) = as_i32() {
                *num_predict = v;
            }
        }
        "num_keep" => {
            if let Some(v) = as_i32() {
                *num_keep = v.max(0) as u32;
            }
        }
        "stop" => {
            if let ParameterValue::String(s) = value {
                stop.push(s.clone());
            }
        }
        "penalize_nl" => {
            let b = match value {
                ParameterValue::String(s) => s.parse::<bool>().ok(),
                ParameterValue::Int(i) => Some(*i != 0),
                ParameterValue::Float(f) => Some(*f != 0.0),
            };
            if let Some(b) = b {
                sampling.penalize_nl = b;
            }
        }
        "logit_bias" => {
            // Repeatable, like `stop`: "PARAMETER logit_bias <token>:<bias>".
            if let ParameterValue::String(s) = value {
                if let Some((token, bias)) = s.split_once(':') {
                    if let (Ok(token), Ok(bias)) =
                        (token.trim().parse::<i32>(), bias.trim().parse::<f32>())
                    {
                        sampling.logit_bias.insert(token, bias);
                    }
                }
            }
        }
        _ => {}
    }
}

fn read_blob_string(state: &Arc<AppState>, digest: &crate::store::Digest) -> Option<String> {
    std::fs::read_to_string(state.store.blob_path(digest)).ok()
}

fn read_blob_json<T: serde::de::DeserializeOwned>(
    state: &Arc<AppState>,
    digest: &crate::store::Digest,
) -> Option<T> {
    let bytes = std::fs::read(state.store.blob_path(digest)).ok()?;
    serde_json::from_slice(&bytes).ok()
}
