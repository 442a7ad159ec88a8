//! Shared state handed to every route handler: the model store, registry
//! client, and the single process-wide inference session slot.
//!
//! Grounded on `web/model_manager.rs`'s `ModelManager` (the mutex-guarded
//! singleton holding the loaded model) generalized from a `std::sync::Mutex`
//! to a `tokio::sync::Mutex` per SPEC_FULL.md's async concurrency model.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::config::Config;
use crate::registry::RegistryClient;
use crate::session::engine::LlamaEngine;
use crate::session::Session;
use crate::store::ModelStore;

pub struct SessionSlot {
    pub session_id: u64,
    /// Kept for a future `/api/show`-style introspection endpoint; not read
    /// by any route this daemon currently exposes.
    #[allow(dead_code)]
    pub model_reference: String,
    #[allow(dead_code)]
    pub template: Option<String>,
    #[allow(dead_code)]
    pub system: Option<String>,
    pub load_duration_ns: u64,
    pub inner: Session<LlamaEngine>,
}

pub struct AppState {
    pub store: ModelStore,
    pub registry: Arc<RegistryClient>,
    pub config: Config,
    pub backend: &'static llama_cpp_2::llama_backend::LlamaBackend,
    /// `Arc`-wrapped so a generate handler can take an owned lock
    /// (`lock_owned`) that outlives the request future once the actual
    /// generation is moved onto a spawned task.
    pub session: Arc<Mutex<Option<SessionSlot>>>,
}

impl AppState {
    pub fn new(
        store: ModelStore,
        registry: RegistryClient,
        config: Config,
        backend: &'static llama_cpp_2::llama_backend::LlamaBackend,
    ) -> Self {
        AppState {
            store,
            registry: Arc::new(registry),
            config,
            backend,
            session: Arc::new(Mutex::new(None)),
        }
    }
}

/// Monotonic-enough session identifier: nanoseconds since epoch at creation
/// time, per spec §3 "Session" field definition.
pub fn new_session_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
