//! Content-addressed model store: manifests referencing blobs by digest.
//!
//! Directory layout grounded on `ollama-rust/models.rs`'s `ModelManager`:
//! `<root>/manifests/<registry>/<namespace>/<name>/<tag>` (one JSON manifest
//! per tag) and `<root>/blobs/sha256-<hex>`.

pub mod blob;
pub mod digest;
pub mod manifest;
pub mod reference;

use std::fs;
use std::path::{Path, PathBuf};

pub use digest::Digest;
pub use manifest::{Manifest, ModelConfig};
pub use reference::Reference;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelSummary {
    pub reference: Reference,
    pub digest: Digest,
    pub size: u64,
    pub modified_at: Option<String>,
}

impl ModelStore {
    pub fn open(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("manifests"))?;
        Ok(ModelStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self, reference: &Reference) -> PathBuf {
        self.root
            .join("manifests")
            .join(reference.manifest_path_fragment())
    }

    pub fn read_manifest(&self, reference: &Reference) -> AppResult<Manifest> {
        let path = self.manifest_path(reference);
        let bytes = fs::read(&path)
            .map_err(|_| AppError::NotFound(format!("model not found: {reference}")))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn write_manifest(&self, reference: &Reference, manifest: &Manifest) -> AppResult<()> {
        manifest.validate()?;
        for digest in manifest.all_blob_digests() {
            if !self.has_blob(&digest) {
                return Err(AppError::NotFound(format!(
                    "manifest references missing blob {digest}"
                )));
            }
        }
        let path = self.manifest_path(reference);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        blob::blob_path(&self.root, digest)
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        blob::blob_exists(&self.root, digest)
    }

    pub fn write_blob_verified(&self, expected: &Digest, data: &[u8]) -> AppResult<()> {
        blob::write_blob_verified(&self.root, expected, data)?;
        Ok(())
    }

    pub fn write_blob_from_bytes(&self, data: &[u8]) -> AppResult<(Digest, u64)> {
        blob::write_blob_from_bytes(&self.root, data)
    }

    pub fn blob_size(&self, digest: &Digest) -> Option<u64> {
        blob::stat_blob(&self.root, digest)
    }

    /// Recursively walks `manifests/` collecting every tag, for `/api/tags`.
    pub fn list(&self) -> AppResult<Vec<ModelSummary>> {
        let mut out = Vec::new();
        let manifests_root = self.root.join("manifests");
        self.walk_manifests(&manifests_root, &mut out)?;
        Ok(out)
    }

    fn walk_manifests(&self, dir: &Path, out: &mut Vec<ModelSummary>) -> AppResult<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.walk_manifests(&path, out)?;
                continue;
            }

            // Manifest files live four levels below `manifests/`:
            // registry/namespace/name/tag
            let Ok(rel) = path.strip_prefix(self.root.join("manifests")) else {
                continue;
            };
            let components: Vec<_> = rel.components().collect();
            if components.len() != 4 {
                continue;
            }
            let registry = components[0].as_os_str().to_string_lossy().to_string();
            let namespace = components[1].as_os_str().to_string_lossy().to_string();
            let name = components[2].as_os_str().to_string_lossy().to_string();
            let tag = components[3].as_os_str().to_string_lossy().to_string();
            let reference = Reference {
                registry,
                namespace,
                name,
                tag,
            };

            let Ok(bytes) = fs::read(&path) else { continue };
            let Ok(manifest) = serde_json::from_slice::<Manifest>(&bytes) else {
                continue;
            };
            if manifest.validate().is_err() {
                continue;
            }

            let model_digest = manifest
                .layer_of_type(manifest::MEDIA_TYPE_MODEL)
                .map(|l| l.digest.clone())
                .unwrap_or_else(|| manifest.config.digest.clone());

            let modified_at = fs::metadata(&path)
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs().to_string());

            out.push(ModelSummary {
                reference,
                digest: model_digest,
                size: manifest.total_size(),
                modified_at,
            });
        }
        Ok(())
    }

    /// Removes a manifest, then runs a full garbage-collection scan over the
    /// remaining manifests to delete any blob no longer referenced (spec's
    /// "GC by scan" resolution, see DESIGN.md Open Question 3).
    pub fn delete(&self, reference: &Reference) -> AppResult<()> {
        let path = self.manifest_path(reference);
        fs::remove_file(&path)
            .map_err(|_| AppError::NotFound(format!("model not found: {reference}")))?;
        self.collect_garbage()
    }

    fn collect_garbage(&self) -> AppResult<()> {
        let mut referenced = std::collections::HashSet::new();
        self.collect_referenced_digests(&self.root.join("manifests"), &mut referenced)?;

        let blobs_dir = self.root.join("blobs");
        if !blobs_dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&blobs_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(fname) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Leave in-progress temp files alone; they belong to a pull/push
            // currently in flight.
            if fname.starts_with(".tmp-") {
                continue;
            }
            let Some(hex) = fname.strip_prefix("sha256-") else {
                continue;
            };
            let digest_str = format!("sha256:{hex}");
            if !referenced.contains(&digest_str) {
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }

    fn collect_referenced_digests(
        &self,
        dir: &Path,
        out: &mut std::collections::HashSet<String>,
    ) -> AppResult<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_referenced_digests(&path, out)?;
                continue;
            }
            if let Ok(bytes) = fs::read(&path) {
                if let Ok(manifest) = serde_json::from_slice::<Manifest>(&bytes) {
                    for d in manifest.all_blob_digests() {
                        out.insert(d.as_str().to_string());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifest::{Layer, MEDIA_TYPE_CONFIG, MEDIA_TYPE_MODEL};

    fn store() -> ModelStore {
        let dir = std::env::temp_dir().join(format!("modeld-store-test-{}", uuid::Uuid::new_v4()));
        ModelStore::open(dir).unwrap()
    }

    fn digest(byte: u8) -> Digest {
        let hex: String = std::iter::repeat(format!("{byte:02x}")).take(32).collect();
        Digest::parse(&format!("sha256:{hex}")).unwrap()
    }

    /// Drops a placeholder file at `digest`'s blob path so `write_manifest`'s
    /// referenced-blob check is satisfied; content doesn't need to hash to
    /// the digest since `has_blob` only checks presence.
    fn put_blob(store: &ModelStore, digest: &Digest) {
        std::fs::write(store.blob_path(digest), b"placeholder").unwrap();
    }

    fn sample_manifest(model_digest: Digest, config_digest: Digest) -> Manifest {
        Manifest {
            schema_version: manifest::SCHEMA_VERSION,
            config: Layer {
                media_type: MEDIA_TYPE_CONFIG.into(),
                digest: config_digest,
                size: 4,
            },
            layers: vec![Layer {
                media_type: MEDIA_TYPE_MODEL.into(),
                digest: model_digest,
                size: 1000,
            }],
        }
    }

    #[test]
    fn write_then_read_manifest() {
        let store = store();
        let reference = Reference::parse("llama3:8b");
        let m = sample_manifest(digest(1), digest(2));
        put_blob(&store, &digest(1));
        put_blob(&store, &digest(2));
        store.write_manifest(&reference, &m).unwrap();

        let read = store.read_manifest(&reference).unwrap();
        assert_eq!(read.total_size(), 1004);
    }

    #[test]
    fn write_manifest_rejects_missing_blob() {
        let store = store();
        let reference = Reference::parse("llama3:8b");
        let m = sample_manifest(digest(1), digest(2));
        // Neither blob has been written.
        assert!(matches!(
            store.write_manifest(&reference, &m),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let store = store();
        let reference = Reference::parse("ghost:latest");
        assert!(matches!(
            store.read_manifest(&reference),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn list_finds_manifests_across_namespaces() {
        let store = store();
        put_blob(&store, &digest(1));
        put_blob(&store, &digest(2));
        put_blob(&store, &digest(3));
        put_blob(&store, &digest(4));
        store
            .write_manifest(&Reference::parse("llama3:8b"), &sample_manifest(digest(1), digest(2)))
            .unwrap();
        store
            .write_manifest(
                &Reference::parse("myorg/mistral:7b"),
                &sample_manifest(digest(3), digest(4)),
            )
            .unwrap();

        let mut names: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.reference.to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["llama3:8b".to_string(), "myorg/mistral:7b".to_string()]
        );
    }

    #[test]
    fn delete_garbage_collects_unreferenced_blobs() {
        let store = store();
        let shared_model = digest(9);
        let r1 = Reference::parse("model-a:latest");
        let r2 = Reference::parse("model-b:latest");

        put_blob(&store, &digest(10));
        put_blob(&store, &digest(11));
        // Written before either manifest since write_manifest now requires
        // every referenced digest to already be on disk.
        let blob_path = store.blob_path(&shared_model);
        std::fs::write(&blob_path, b"weights").unwrap();

        store
            .write_manifest(&r1, &sample_manifest(shared_model.clone(), digest(10)))
            .unwrap();
        store
            .write_manifest(&r2, &sample_manifest(shared_model.clone(), digest(11)))
            .unwrap();

        store.delete(&r1).unwrap();
        assert!(blob_path.is_file(), "blob still referenced by model-b");

        store.delete(&r2).unwrap();
        assert!(!blob_path.is_file(), "blob should be collected once unreferenced");
    }
}
