//! Entry point: parses CLI flags, initializes logging and the inference
//! backend, opens the model store, and serves the HTTP API.
//!
//! Grounded on `main_web.rs`'s `main()` (service-fn wiring and startup
//! banner), generalized from a fixed port/`Tauri` desktop shell into a
//! standalone daemon configured by `config::Config`.

mod config;
mod error;
mod logger;
mod modelfile;
mod prompt;
mod registry;
mod server;
mod session;
mod store;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use llama_cpp_2::llama_backend::LlamaBackend;
use log::info;

use config::Config;
use registry::RegistryClient;
use server::state::AppState;
use store::ModelStore;

/// CLI flags, each overriding the corresponding `OLLAMA_*` environment
/// variable when present (spec's "External interfaces" section).
#[derive(Parser, Debug)]
#[command(name = "modeld", about = "Local daemon for running GGUF language models behind an HTTP API")]
struct Cli {
    /// Address to bind the HTTP server to, e.g. 127.0.0.1:11434.
    #[arg(long)]
    host: Option<String>,

    /// Directory holding the content-addressed model store.
    #[arg(long)]
    models_dir: Option<String>,

    /// Enable debug-level logging.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(cli.verbose)?;

    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(models_dir) = cli.models_dir {
        config.models_dir = models_dir.into();
    }

    info!("starting modeld, models dir: {}", config.models_dir.display());

    let store = ModelStore::open(&config.models_dir)?;
    let registry = RegistryClient::new();
    let backend: &'static LlamaBackend = Box::leak(Box::new(
        LlamaBackend::init().map_err(|e| anyhow::anyhow!("failed to init llama backend: {e}"))?,
    ));

    let addr: SocketAddr = config
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid host {}: {e}", config.host))?;

    let state = Arc::new(AppState::new(store, registry, config, backend));

    let make_svc = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { server::handle(state, req).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);

    println!("modeld is listening on http://{addr}");
    println!("Available endpoints:");
    println!("  GET    /                   - health check");
    println!("  GET    /api/tags           - list local models");
    println!("  POST   /api/generate       - generate a completion (NDJSON stream)");
    println!("  POST   /api/create         - build a model from a model file");
    println!("  POST   /api/pull           - fetch a model from a registry");
    println!("  POST   /api/push           - publish a model to a registry");
    println!("  POST   /api/copy           - duplicate a local model");
    println!("  DELETE /api/delete         - remove a local model");

    server
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    Ok(())
}
