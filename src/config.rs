//! Daemon configuration, assembled from environment variables with defaults.
//!
//! Grounded on `web/config.rs`'s load-with-fallback pattern, generalized from
//! a JSON file to env vars per the external interfaces section.

use std::path::PathBuf;

const DEFAULT_HOST: &str = "127.0.0.1:11434";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub models_dir: PathBuf,
    pub extra_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());

        let models_dir = std::env::var("OLLAMA_MODELS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_models_dir());

        let extra_origins = std::env::var("OLLAMA_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Config {
            host,
            models_dir,
            extra_origins,
        }
    }
}

fn default_models_dir() -> PathBuf {
    if let Some(home) = dirs_home() {
        home.join(".ollama").join("models")
    } else {
        PathBuf::from(".ollama/models")
    }
}

/// Minimal stand-in for a `dirs` crate lookup (the teacher pack carries none):
/// reads `HOME` (unix) or `USERPROFILE` (windows).
fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        std::env::remove_var("OLLAMA_HOST");
        std::env::remove_var("OLLAMA_ORIGINS");
        let cfg = Config::from_env();
        assert_eq!(cfg.host, DEFAULT_HOST);
        assert!(cfg.extra_origins.is_empty());
    }

    #[test]
    fn parses_origin_list() {
        std::env::set_var("OLLAMA_ORIGINS", "http://foo.test, http://bar.test");
        let cfg = Config::from_env();
        assert_eq!(
            cfg.extra_origins,
            vec!["http://foo.test".to_string(), "http://bar.test".to_string()]
        );
        std::env::remove_var("OLLAMA_ORIGINS");
    }
}
