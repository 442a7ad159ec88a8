//! Blob storage on disk: `<root>/blobs/sha256-<hex>`, written atomically via
//! a temp file + rename.
//!
//! Grounded on `ollama-rust/models.rs`'s `get_blob_path`/`create_blob`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::digest::{Digest, DigestWriter};
use crate::error::{AppError, AppResult};

pub fn blob_path(root: &Path, digest: &Digest) -> PathBuf {
    root.join("blobs").join(format!("sha256-{}", digest.hex()))
}

pub fn blob_exists(root: &Path, digest: &Digest) -> bool {
    blob_path(root, digest).is_file()
}

pub fn stat_blob(root: &Path, digest: &Digest) -> Option<u64> {
    fs::metadata(blob_path(root, digest)).ok().map(|m| m.len())
}

/// Writes `data` to a temp file under `blobs/`, verifies its digest matches
/// `expected`, then renames it into place. Returns an error (and removes the
/// temp file) on mismatch.
pub fn write_blob_verified(root: &Path, expected: &Digest, data: &[u8]) -> AppResult<PathBuf> {
    let blobs_dir = root.join("blobs");
    fs::create_dir_all(&blobs_dir)?;

    let actual = Digest::of_bytes(data);
    if &actual != expected {
        return Err(AppError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    let tmp_path = blobs_dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(data)?;
    tmp.sync_all()?;
    drop(tmp);

    let dest = blob_path(root, expected);
    fs::rename(&tmp_path, &dest)?;
    Ok(dest)
}

/// Writes `data`, computing its own digest rather than verifying against an
/// expected one. Used by `/api/create` for content authored locally (config,
/// template, system, license blobs) that has no pre-known digest.
pub fn write_blob_from_bytes(root: &Path, data: &[u8]) -> AppResult<(Digest, u64)> {
    let digest = Digest::of_bytes(data);
    write_blob_verified(root, &digest, data)?;
    Ok((digest, data.len() as u64))
}

/// Streaming counterpart used by the registry client: caller writes chunks
/// as they arrive over the wire, digest is verified once the stream ends.
pub struct BlobWriter {
    tmp_path: PathBuf,
    file: File,
    hasher: DigestWriter,
}

impl BlobWriter {
    pub fn create(root: &Path) -> AppResult<Self> {
        let blobs_dir = root.join("blobs");
        fs::create_dir_all(&blobs_dir)?;
        let tmp_path = blobs_dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let file = File::create(&tmp_path)?;
        Ok(BlobWriter {
            tmp_path,
            file,
            hasher: DigestWriter::new(),
        })
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> AppResult<()> {
        self.file.write_all(chunk)?;
        self.hasher.update(chunk);
        Ok(())
    }

    /// Verifies the accumulated digest against `expected`, then renames the
    /// temp file into its final `blobs/` location. On mismatch the temp
    /// file is removed so a retried pull starts clean.
    pub fn finish(self, root: &Path, expected: &Digest) -> AppResult<PathBuf> {
        self.file.sync_all()?;
        drop(self.file);

        let actual = self.hasher.finalize();
        if &actual != expected {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(AppError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let dest = blob_path(root, expected);
        fs::rename(&self.tmp_path, &dest)?;
        Ok(dest)
    }

    pub fn abandon(self) {
        let _ = fs::remove_file(&self.tmp_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempdir();
        let data = b"gguf model bytes";
        let digest = Digest::of_bytes(data);

        let path = write_blob_verified(&dir, &digest, data).unwrap();
        assert!(path.is_file());
        assert_eq!(stat_blob(&dir, &digest), Some(data.len() as u64));
        assert!(blob_exists(&dir, &digest));
    }

    #[test]
    fn mismatch_is_rejected_and_leaves_no_file() {
        let dir = tempdir();
        let data = b"gguf model bytes";
        let wrong = Digest::of_bytes(b"different content");

        let err = write_blob_verified(&dir, &wrong, data);
        assert!(err.is_err());
    }

    #[test]
    fn blob_writer_streams_and_verifies() {
        let dir = tempdir();
        let data = b"streamed chunk one and chunk two";
        let digest = Digest::of_bytes(data);

        let mut w = BlobWriter::create(&dir).unwrap();
        w.write_chunk(&data[..10]).unwrap();
        w.write_chunk(&data[10..]).unwrap();
        let path = w.finish(&dir, &digest).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn blob_writer_mismatch_removes_temp_file() {
        let dir = tempdir();
        let wrong = Digest::of_bytes(b"nope");

        let mut w = BlobWriter::create(&dir).unwrap();
        w.write_chunk(b"some bytes").unwrap();
        assert!(w.finish(&dir, &wrong).is_err());
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("modeld-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
