//! The narrow native-backend capability surface the rest of the session
//! logic is built against. Per the design notes this is intentionally the
//! *only* thing that talks to `llama-cpp-2` directly — all sampling math
//! lives in `session::sampler` and operates on the plain `&[f32]` logits
//! slice `Engine::logits` returns.
//!
//! Concrete implementation grounded on `web/model_manager.rs::load_model`
//! and `web/chat/generation.rs`'s context/batch setup.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;

use crate::error::{AppError, AppResult};

/// Load-time knobs a caller may request; compared against the currently
/// loaded session to decide whether a reload is needed (spec §4.4 "Load").
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub model_path: String,
    pub num_ctx: u32,
    pub num_gpu_layers: u32,
    pub num_batch: u32,
}

pub trait Engine: Send {
    fn load(backend: &LlamaBackend, options: &LoadOptions) -> AppResult<Self>
    where
        Self: Sized;
    fn tokenize(&self, text: &str, add_bos: bool) -> AppResult<Vec<i32>>;
    fn detokenize(&self, tokens: &[i32]) -> AppResult<String>;
    fn token_to_piece(&self, token: i32) -> AppResult<String>;
    fn bos_token(&self) -> i32;
    fn eos_token(&self) -> i32;
    fn n_ctx(&self) -> u32;
    fn n_vocab(&self) -> i32;

    /// Evaluates `tokens` starting at KV position `past`, in `n_batch`-sized
    /// slices (spec §4.4 point 3).
    fn eval(&mut self, tokens: &[i32], past: u32, n_batch: u32) -> AppResult<()>;

    /// Logits for the most recently evaluated position.
    fn logits(&self) -> AppResult<&[f32]>;

    /// Drops everything at or after `keep_from` in the KV cache, used by
    /// context-window rotation.
    fn kv_cache_seq_rm(&mut self, keep_from: u32, keep_to: u32) -> AppResult<()>;
}

pub struct LlamaEngine {
    model: LlamaModel,
    context: llama_cpp_2::context::LlamaContext<'static>,
    n_ctx: u32,
}

// Safety note grounded on the teacher's own pattern in `web/models.rs`:
// `LlamaState` is held behind a single `Mutex` and never accessed from more
// than one thread at a time, so the non-`Send` borrow inside `LlamaContext`
// never actually crosses threads simultaneously.
unsafe impl Send for LlamaEngine {}

impl LlamaEngine {
    pub fn load_boxed(backend: &'static LlamaBackend, options: &LoadOptions) -> AppResult<Self> {
        if !Path::new(&options.model_path).is_file() {
            return Err(AppError::BadRequest(format!(
                "model file not found: {}",
                options.model_path
            )));
        }

        let model_params = LlamaModelParams::default().with_n_gpu_layers(options.num_gpu_layers);
        let model = LlamaModel::load_from_file(backend, &options.model_path, &model_params)
            .map_err(|e| AppError::Internal(format!("failed to load model: {e}")))?;

        let ctx_size = NonZeroU32::new(options.num_ctx.max(1))
            .ok_or_else(|| AppError::BadRequest("num_ctx must be > 0".to_string()))?;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(ctx_size))
            .with_n_batch(options.num_batch.max(1));

        let context = model
            .new_context(backend, ctx_params)
            .map_err(|e| AppError::Internal(format!("failed to create context: {e}")))?;

        Ok(LlamaEngine {
            model,
            // The backend and model outlive the context for the lifetime of
            // this struct (they're co-owned by the same `Session`), so this
            // transmute-free 'static is sound in the single-threaded-access
            // pattern this type enforces via its owning Mutex.
            context: unsafe { std::mem::transmute(context) },
            n_ctx: options.num_ctx,
        })
    }
}

impl Engine for LlamaEngine {
    fn load(_backend: &LlamaBackend, _options: &LoadOptions) -> AppResult<Self> {
        Err(AppError::Internal(
            "LlamaEngine requires a 'static backend; use load_boxed".to_string(),
        ))
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> AppResult<Vec<i32>> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        self.model
            .str_to_token(text, add_bos)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| AppError::Tokenize(e.to_string()))
    }

    fn detokenize(&self, tokens: &[i32]) -> AppResult<String> {
        let tokens: Vec<LlamaToken> = tokens.iter().map(|t| LlamaToken(*t)).collect();
        self.model
            .tokens_to_str(&tokens, Special::Tokenize)
            .map_err(|e| AppError::Tokenize(e.to_string()))
    }

    fn token_to_piece(&self, token: i32) -> AppResult<String> {
        self.model
            .token_to_str(LlamaToken(token), Special::Tokenize)
            .map_err(|e| AppError::Tokenize(e.to_string()))
    }

    fn bos_token(&self) -> i32 {
        self.model.token_bos().0
    }

    fn eos_token(&self) -> i32 {
        self.model.token_eos().0
    }

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn n_vocab(&self) -> i32 {
        self.model.n_vocab()
    }

    fn eval(&mut self, tokens: &[i32], past: u32, n_batch: u32) -> AppResult<()> {
        for (slice_idx, chunk) in tokens.chunks(n_batch.max(1) as usize).enumerate() {
            let mut batch = LlamaBatch::new(chunk.len(), 1);
            let chunk_start = past as i32 + (slice_idx * n_batch.max(1) as usize) as i32;
            for (i, tok) in chunk.iter().enumerate() {
                let is_last = i == chunk.len() - 1 && slice_idx == tokens.chunks(n_batch.max(1) as usize).count() - 1;
                batch
                    .add(LlamaToken(*tok), chunk_start + i as i32, &[0], is_last)
                    .map_err(|e| AppError::Eval(e.to_string()))?;
            }
            self.context
                .decode(&mut batch)
                .map_err(|e| AppError::Eval(e.to_string()))?;
        }
        Ok(())
    }

    fn logits(&self) -> AppResult<&[f32]> {
        Ok(self.context.get_logits_ith(-1))
    }

    fn kv_cache_seq_rm(&mut self, keep_from: u32, keep_to: u32) -> AppResult<()> {
        self.context
            .clear_kv_cache_seq(Some(0), Some(keep_from), Some(keep_to))
            .map_err(|e| AppError::Eval(e.to_string()))
    }
}
