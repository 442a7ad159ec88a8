//! `[registry/][namespace/]name[:tag]` model reference parsing.

use serde::{Deserialize, Serialize};

pub const DEFAULT_REGISTRY: &str = "registry.ollama.ai";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

impl Reference {
    pub fn parse(s: &str) -> Self {
        let (rest, tag) = match s.rsplit_once(':') {
            // A ':' that is actually part of a port number (registry:port/...)
            // must not be mistaken for a tag separator.
            Some((rest, tag)) if !tag.contains('/') => (rest, tag.to_string()),
            _ => (s, DEFAULT_TAG.to_string()),
        };

        let parts: Vec<&str> = rest.split('/').collect();
        let (registry, namespace, name) = match parts.as_slice() {
            [name] => (
                DEFAULT_REGISTRY.to_string(),
                DEFAULT_NAMESPACE.to_string(),
                (*name).to_string(),
            ),
            [namespace, name] => (
                DEFAULT_REGISTRY.to_string(),
                (*namespace).to_string(),
                (*name).to_string(),
            ),
            [registry, namespace, name] => (
                (*registry).to_string(),
                (*namespace).to_string(),
                (*name).to_string(),
            ),
            _ => (
                DEFAULT_REGISTRY.to_string(),
                DEFAULT_NAMESPACE.to_string(),
                rest.to_string(),
            ),
        };

        Reference {
            registry,
            namespace,
            name,
            tag,
        }
    }

    /// Path fragment used under `manifests/`: `<registry>/<namespace>/<name>/<tag>`.
    pub fn manifest_path_fragment(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.registry, self.namespace, self.name, self.tag
        )
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.registry == DEFAULT_REGISTRY && self.namespace == DEFAULT_NAMESPACE {
            write!(f, "{}:{}", self.name, self.tag)
        } else if self.registry == DEFAULT_REGISTRY {
            write!(f, "{}/{}:{}", self.namespace, self.name, self.tag)
        } else {
            write!(
                f,
                "{}/{}/{}:{}",
                self.registry, self.namespace, self.name, self.tag
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_all_defaults() {
        let r = Reference::parse("llama3");
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.namespace, DEFAULT_NAMESPACE);
        assert_eq!(r.name, "llama3");
        assert_eq!(r.tag, DEFAULT_TAG);
    }

    #[test]
    fn name_with_tag() {
        let r = Reference::parse("llama3:8b");
        assert_eq!(r.name, "llama3");
        assert_eq!(r.tag, "8b");
    }

    #[test]
    fn namespace_and_name() {
        let r = Reference::parse("myorg/llama3:8b");
        assert_eq!(r.namespace, "myorg");
        assert_eq!(r.name, "llama3");
        assert_eq!(r.tag, "8b");
    }

    #[test]
    fn full_reference() {
        let r = Reference::parse("example.com/myorg/llama3:8b");
        assert_eq!(r.registry, "example.com");
        assert_eq!(r.namespace, "myorg");
        assert_eq!(r.name, "llama3");
        assert_eq!(r.tag, "8b");
    }

    #[test]
    fn registry_with_port_is_not_mistaken_for_tag() {
        let r = Reference::parse("localhost:5000/myorg/llama3");
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.namespace, "myorg");
        assert_eq!(r.name, "llama3");
        assert_eq!(r.tag, DEFAULT_TAG);
    }

    #[test]
    fn display_roundtrips_defaults() {
        let r = Reference::parse("llama3");
        assert_eq!(r.to_string(), "llama3:latest");
    }
}
