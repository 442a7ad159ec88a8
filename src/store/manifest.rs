//! Manifest wire format: a model config layer plus zero or more weight/
//! template/adapter layers, referenced by media type and digest.
//!
//! Struct shape grounded on `ollama-rust/models.rs`'s `Manifest`/`Layer`/
//! `ModelConfig`.

use serde::{Deserialize, Serialize};

use super::digest::Digest;

pub const SCHEMA_VERSION: u32 = 2;

pub const MEDIA_TYPE_MODEL: &str = "application/vnd.ollama.image.model";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.ollama.image.config";
pub const MEDIA_TYPE_TEMPLATE: &str = "application/vnd.ollama.image.template";
pub const MEDIA_TYPE_SYSTEM: &str = "application/vnd.ollama.image.system";
pub const MEDIA_TYPE_PARAMS: &str = "application/vnd.ollama.image.params";
pub const MEDIA_TYPE_ADAPTER: &str = "application/vnd.ollama.image.adapter";
pub const MEDIA_TYPE_LICENSE: &str = "application/vnd.ollama.image.license";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub config: Layer,
    pub layers: Vec<Layer>,
}

/// Parameters and template/system overrides baked into the config blob at
/// `/api/create` time. Kept separate from the `TEMPLATE`/`SYSTEM` layers
/// (which hold the raw text for re-export) so the generate handler can read
/// sampling defaults without re-fetching those blobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub parameters: Vec<(String, crate::modelfile::ParameterValue)>,
}

impl Manifest {
    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(crate::error::AppError::BadRequest(format!(
                "unsupported manifest schema version: {}",
                self.schema_version
            )));
        }
        Ok(())
    }

    /// Total on-disk size of everything this manifest references.
    pub fn total_size(&self) -> u64 {
        self.config.size + self.layers.iter().map(|l| l.size).sum::<u64>()
    }

    pub fn layer_of_type(&self, media_type: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.media_type == media_type)
    }

    pub fn all_blob_digests(&self) -> Vec<Digest> {
        let mut digests = vec![self.config.digest.clone()];
        digests.extend(self.layers.iter().map(|l| l.digest.clone()));
        digests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> Digest {
        let hex: String = std::iter::repeat(format!("{byte:02x}")).take(32).collect();
        Digest::parse(&format!("sha256:{hex}")).unwrap()
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let m = Manifest {
            schema_version: 1,
            config: Layer {
                media_type: MEDIA_TYPE_CONFIG.into(),
                digest: digest(1),
                size: 10,
            },
            layers: vec![],
        };
        assert!(m.validate().is_err());
    }

    #[test]
    fn total_size_sums_config_and_layers() {
        let m = Manifest {
            schema_version: SCHEMA_VERSION,
            config: Layer {
                media_type: MEDIA_TYPE_CONFIG.into(),
                digest: digest(1),
                size: 10,
            },
            layers: vec![
                Layer {
                    media_type: MEDIA_TYPE_MODEL.into(),
                    digest: digest(2),
                    size: 100,
                },
                Layer {
                    media_type: MEDIA_TYPE_TEMPLATE.into(),
                    digest: digest(3),
                    size: 5,
                },
            ],
        };
        assert_eq!(m.total_size(), 115);
        assert!(m.layer_of_type(MEDIA_TYPE_MODEL).is_some());
        assert!(m.layer_of_type(MEDIA_TYPE_ADAPTER).is_none());
    }
}
