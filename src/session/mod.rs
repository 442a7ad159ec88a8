//! The inference session: a process-singleton holding one loaded model and
//! driving the tokenize → cache-reuse → batch-eval → sample → rotate loop.
//!
//! Grounded on `web/chat/generation.rs::run_generation_loop` (stall
//! detection, cancellation checks, periodic housekeeping) and
//! `web/model_manager.rs::load_model` (load/reload policy, drop ordering).

pub mod engine;
pub mod sampler;

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};
use engine::{Engine, LoadOptions};
use sampler::{MirostatState, Rng, SamplingConfig};

/// How long a generation may go without producing a token before it's
/// considered stalled (grounded on `generation.rs`'s `TOKEN_STALL_TIMEOUT`).
const TOKEN_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Cancellation and stop-condition checks happen every this many generated
/// tokens, not on every token, to keep the hot loop cheap.
const CHECK_INTERVAL: usize = 4;

#[derive(Debug, Clone)]
pub struct PredictRequest {
    pub prompt: String,
    pub num_predict: i32,
    pub num_keep: u32,
    pub stop: Vec<String>,
    pub sampling: SamplingConfig,
}

#[derive(Debug, Clone, Default)]
pub struct PredictStep {
    pub token_text: String,
    pub done: bool,
    pub done_reason: Option<String>,
    /// Set only on the terminal step: the flattened token id sequence now
    /// resident in the KV cache, for the client to carry into the next
    /// turn's `context` field (spec §3 "Generation request/response stream").
    pub context: Option<Vec<i32>>,
    /// Set only on the terminal step: number of prompt tokens actually
    /// evaluated this call (excludes any reused cache prefix).
    pub prompt_eval_count: usize,
    /// Set only on the terminal step: nanoseconds spent evaluating the
    /// prompt before the first sampled token.
    pub prompt_eval_duration_ns: u64,
    /// Set only on the terminal step: nanoseconds spent in the sample loop
    /// (excludes prompt evaluation).
    pub eval_duration_ns: u64,
}

pub struct Session<E: Engine> {
    backend_options: LoadOptions,
    engine: E,
    /// Token ids currently resident in the KV cache, in order — used for
    /// longest-common-prefix reuse on the next predict call.
    cached_tokens: Vec<i32>,
    n_batch: u32,
    /// Number of prompt tokens actually evaluated by the most recent
    /// `predict` call (i.e. excluding the reused cache prefix), surfaced to
    /// the client as `prompt_eval_count`.
    last_prompt_eval_count: usize,
}

impl<E: Engine> Session<E> {
    pub fn new(engine: E, options: LoadOptions) -> AppResult<Self> {
        let n_batch = options.num_batch;
        let mut session = Session {
            backend_options: options,
            engine,
            cached_tokens: Vec::new(),
            n_batch,
            last_prompt_eval_count: 0,
        };
        session.warm_up()?;
        Ok(session)
    }

    /// True if `options` describes the same model/context already loaded,
    /// so the caller can skip a reload (spec §4.4 "Load").
    pub fn satisfies(&self, options: &LoadOptions) -> bool {
        &self.backend_options == options
    }

    /// The token ids currently resident in the KV cache, for the `context`
    /// field returned to the client so a later turn can resume the session.
    pub fn context_tokens(&self) -> Vec<i32> {
        self.cached_tokens.clone()
    }

    pub fn last_prompt_eval_count(&self) -> usize {
        self.last_prompt_eval_count
    }

    /// Evaluates a single BOS token and discards the result, so the first
    /// real request doesn't pay backend warm-up latency.
    fn warm_up(&mut self) -> AppResult<()> {
        let bos = self.engine.bos_token();
        self.engine.eval(&[bos], 0, self.n_batch)?;
        self.cached_tokens.clear();
        Ok(())
    }

    fn longest_common_prefix(&self, tokens: &[i32]) -> usize {
        self.cached_tokens
            .iter()
            .zip(tokens.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Drops the KV cache tail that diverges from `tokens`, keeping the
    /// common prefix, per spec §4.4 point 2.
    fn reuse_prefix(&mut self, tokens: &[i32]) -> AppResult<usize> {
        let common = self.longest_common_prefix(tokens);
        if common < self.cached_tokens.len() {
            self.engine
                .kv_cache_seq_rm(common as u32, self.cached_tokens.len() as u32)?;
            self.cached_tokens.truncate(common);
        }
        Ok(common)
    }

    /// Context-window rotation: when the KV cache would overflow, keep the
    /// first `num_keep` tokens (the primer/system prompt) plus the newer
    /// half of the remaining ring, discarding the rest.
    fn rotate_context_if_needed(&mut self, num_keep: u32, incoming: usize) -> AppResult<()> {
        let n_ctx = self.engine.n_ctx() as usize;
        let projected = self.cached_tokens.len() + incoming;
        if projected <= n_ctx {
            return Ok(());
        }

        // Always keep at least one token (BOS), per spec §4.4 point 6.
        let keep = (num_keep as usize).max(1).min(self.cached_tokens.len());
        let remainder = &self.cached_tokens[keep..];
        let discard = remainder.len() / 2;

        self.engine
            .kv_cache_seq_rm(keep as u32, (keep + discard) as u32)?;

        let mut rotated = self.cached_tokens[..keep].to_vec();
        rotated.extend_from_slice(&self.cached_tokens[keep + discard..]);
        self.cached_tokens = rotated;
        Ok(())
    }

    pub fn tokenize_with_leading_space(&self, text: &str) -> AppResult<Vec<i32>> {
        let spaced = format!(" {text}");
        self.engine.tokenize(&spaced, self.cached_tokens.is_empty())
    }

    /// Runs a full predict call, streaming each generated piece through
    /// `tx`. Mirostat state (if any) is created fresh for this call and
    /// discarded afterward (DESIGN.md Open Question 1).
    pub async fn predict(
        &mut self,
        request: PredictRequest,
        tx: mpsc::Sender<PredictStep>,
        mut canceled: impl FnMut() -> bool,
    ) -> AppResult<()> {
        let prompt_eval_start = Instant::now();
        let prompt_tokens = self.tokenize_with_leading_space(&request.prompt)?;

        self.rotate_context_if_needed(request.num_keep, prompt_tokens.len())?;
        let reused = self.reuse_prefix(&prompt_tokens)?;
        let to_eval = &prompt_tokens[reused..];
        self.last_prompt_eval_count = to_eval.len();

        if !to_eval.is_empty() {
            self.engine.eval(to_eval, reused as u32, self.n_batch)?;
        }
        self.cached_tokens = prompt_tokens;
        let prompt_eval_duration_ns = prompt_eval_start.elapsed().as_nanos() as u64;
        let eval_start = Instant::now();

        let mut mirostat: Option<MirostatState> = None;
        let mut rng = Rng::new(request.sampling.seed);
        let mut generated_text = String::new();
        let mut tail_buffer: Vec<u8> = Vec::new();
        let max_tokens = if request.num_predict < 0 {
            i32::MAX
        } else {
            request.num_predict
        };

        let mut last_progress = Instant::now();
        // Looked up once per call, not once per token: the newline token id
        // never changes mid-generation.
        let nl_token = self.engine.tokenize("\n", false)?.first().copied();

        for step in 0..max_tokens {
            if step % CHECK_INTERVAL as i32 == 0 && canceled() {
                self.finish(tx, "canceled", prompt_eval_duration_ns, eval_start).await;
                return Ok(());
            }

            if last_progress.elapsed() > TOKEN_STALL_TIMEOUT {
                return Err(AppError::Internal("generation stalled".to_string()));
            }

            let logits = self.engine.logits()?.to_vec();
            let mut logits = logits;
            sampler::apply_logit_bias(&mut logits, &request.sampling.logit_bias);
            let nl_pre_penalty = nl_token.and_then(|t| logits.get(t as usize).copied());
            sampler::apply_penalties(&mut logits, &self.cached_tokens, &request.sampling);
            if !request.sampling.penalize_nl {
                if let (Some(t), Some(v)) = (nl_token, nl_pre_penalty) {
                    if let Some(logit) = logits.get_mut(t as usize) {
                        *logit = v;
                    }
                }
            }

            let next_token = sampler::sample(&logits, &request.sampling, &mut mirostat, &mut rng);

            if next_token == self.engine.eos_token() {
                self.finish(tx, "stop", prompt_eval_duration_ns, eval_start).await;
                return Ok(());
            }

            let piece = self.engine.token_to_piece(next_token)?;
            generated_text.push_str(&piece);
            tail_buffer.extend_from_slice(piece.as_bytes());

            if let Some(matched) = matches_stop_sequence(&generated_text, &request.stop) {
                let keep_len = generated_text.len() - matched.len();
                let emit = piece
                    .char_indices()
                    .map(|(i, _)| i)
                    .find(|&i| generated_text.len() - piece.len() + i >= keep_len)
                    .map(|i| &piece[..i])
                    .unwrap_or("");
                if !emit.is_empty() {
                    let _ = tx
                        .send(PredictStep {
                            token_text: emit.to_string(),
                            done: false,
                            ..Default::default()
                        })
                        .await;
                }
                self.finish(tx, "stop", prompt_eval_duration_ns, eval_start).await;
                return Ok(());
            }

            let _ = tx
                .send(PredictStep {
                    token_text: piece,
                    done: false,
                    ..Default::default()
                })
                .await;

            self.rotate_context_if_needed(request.num_keep, 1)?;
            self.engine
                .eval(&[next_token], self.cached_tokens.len() as u32, self.n_batch)?;
            self.cached_tokens.push(next_token);
            last_progress = Instant::now();

            // Keep only a small tail to bound stop-sequence matching cost;
            // two bytes of slack covers multi-byte UTF-8 sequences that
            // straddle a chunk boundary.
            if tail_buffer.len() > 256 {
                let drop = tail_buffer.len() - 256;
                tail_buffer.drain(..drop.saturating_sub(2));
            }
        }

        self.finish(tx, "length", prompt_eval_duration_ns, eval_start).await;
        Ok(())
    }

    /// Sends the terminal `PredictStep`, carrying the context tokens and
    /// timing breakdown the client needs for multi-turn continuation and
    /// the `*_duration`/`*_count` fields of the response (spec §3, §6).
    async fn finish(
        &self,
        tx: mpsc::Sender<PredictStep>,
        reason: &str,
        prompt_eval_duration_ns: u64,
        eval_start: Instant,
    ) {
        let _ = tx
            .send(PredictStep {
                token_text: String::new(),
                done: true,
                done_reason: Some(reason.to_string()),
                context: Some(self.context_tokens()),
                prompt_eval_count: self.last_prompt_eval_count,
                prompt_eval_duration_ns,
                eval_duration_ns: eval_start.elapsed().as_nanos() as u64,
            })
            .await;
    }
}

/// Returns the matched suffix of `stop` sequences found in `text`, if any.
/// Matching is byte-oriented on the accumulated text so a stop sequence
/// split across two sampled pieces is still caught.
fn matches_stop_sequence<'a>(text: &str, stops: &'a [String]) -> Option<&'a str> {
    stops
        .iter()
        .find(|s| !s.is_empty() && text.ends_with(s.as_str()))
        .map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_sequence_exact_suffix_matches() {
        let stops = vec!["</s>".to_string(), "\n\n".to_string()];
        assert_eq!(
            matches_stop_sequence("hello world</s>", &stops),
            Some("</s>")
        );
    }

    #[test]
    fn stop_sequence_no_match_returns_none() {
        let stops = vec!["</s>".to_string()];
        assert_eq!(matches_stop_sequence("hello world", &stops), None);
    }

    #[test]
    fn empty_stop_strings_never_match() {
        let stops = vec![String::new()];
        assert_eq!(matches_stop_sequence("anything", &stops), None);
    }
}
