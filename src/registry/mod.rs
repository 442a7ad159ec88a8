//! Resumable, chunked pull/push against a container-registry-shaped model
//! registry. Grounded on `web/routes/download.rs` (resumable ranged
//! transfer, `.part` file handling, progress-event cadence) and
//! `aconz2-program-explorer__peoci-src-ocidist.rs` (bearer auth
//! challenge-and-retry, digest verification while streaming).

pub mod auth;
pub mod progress;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};
use crate::store::manifest::Manifest;
use crate::store::{Digest, Reference};
use auth::{fetch_token, parse_www_authenticate, TokenCache};
use progress::{InFlightTransfers, Progress, ProgressStatus, Role};

const RETRY_BACKOFFS_MS: &[u64] = &[250, 500, 1000];

pub struct RegistryClient {
    tokens: TokenCache,
    transfers: InFlightTransfers,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    pub fn new() -> Self {
        RegistryClient {
            tokens: TokenCache::new(),
            transfers: InFlightTransfers::new(),
        }
    }

    fn repository(reference: &Reference) -> String {
        format!("{}/{}", reference.namespace, reference.name)
    }

    fn authed_request(
        &self,
        reference: &Reference,
        method: &str,
        url: &str,
        credentials: Option<&(String, String)>,
    ) -> AppResult<ureq::Response> {
        let repository = Self::repository(reference);
        let mut attempt = ureq::request(method, url);
        if let Some(token) = self.tokens.get(&reference.registry, &repository) {
            attempt = attempt.set("Authorization", &format!("Bearer {token}"));
        }

        match attempt.call() {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(401, resp)) => {
                let challenge = resp
                    .header("www-authenticate")
                    .and_then(parse_www_authenticate)
                    .ok_or_else(|| {
                        AppError::AuthFailed("401 without a Bearer challenge".to_string())
                    })?;

                let (user, pass) = credentials
                    .map(|(u, p)| (Some(u.as_str()), Some(p.as_str())))
                    .unwrap_or((None, None));
                let token = fetch_token(&challenge, user, pass)?;
                self.tokens.put(&reference.registry, &repository, token.clone());

                ureq::request(method, url)
                    .set("Authorization", &format!("Bearer {token}"))
                    .call()
                    .map_err(|e| AppError::Network(e.to_string()))
            }
            Err(e) => Err(AppError::Network(e.to_string())),
        }
    }

    /// `GET /v2/<namespace>/<name>/manifests/<tag>`
    pub fn get_manifest(
        &self,
        reference: &Reference,
        credentials: Option<&(String, String)>,
    ) -> AppResult<Manifest> {
        let url = format!(
            "https://{}/v2/{}/{}/manifests/{}",
            reference.registry, reference.namespace, reference.name, reference.tag
        );

        with_retry(|| {
            let resp = self.authed_request(reference, "GET", &url, credentials)?;
            resp.into_json::<Manifest>()
                .map_err(|e| AppError::Network(format!("invalid manifest JSON: {e}")))
        })
    }

    pub fn put_manifest(
        &self,
        reference: &Reference,
        manifest: &Manifest,
        credentials: Option<&(String, String)>,
    ) -> AppResult<()> {
        let url = format!(
            "https://{}/v2/{}/{}/manifests/{}",
            reference.registry, reference.namespace, reference.name, reference.tag
        );
        let body = serde_json::to_vec(manifest)?;

        with_retry(|| {
            let repository = Self::repository(reference);
            let mut req = ureq::put(&url).set("content-type", "application/json");
            if let Some(token) = self.tokens.get(&reference.registry, &repository) {
                req = req.set("Authorization", &format!("Bearer {token}"));
            }
            req.send_bytes(&body)
                .map_err(|e| AppError::Network(e.to_string()))?;
            Ok(())
        })
    }

    /// Uploads a single blob already present in `root`, symmetric to
    /// `pull_blob`: HEAD to skip blobs the registry already has, then a
    /// chunked `POST`-session/`PATCH`-chunks/`PUT`-finalize upload for the
    /// rest (spec §4.3 "Push protocol"), reporting progress as each chunk
    /// is written. Checks `cancel` between chunks so a disconnected caller
    /// stops the upload promptly instead of running it to completion.
    pub async fn push_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        root: &Path,
        credentials: Option<(String, String)>,
        cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
        progress_tx: mpsc::Sender<Progress>,
    ) -> AppResult<()> {
        let path = crate::store::blob::blob_path(root, digest);
        let size = std::fs::metadata(&path)?.len();

        let reference = reference.clone();
        let digest = digest.clone();
        let token = self
            .tokens
            .get(&reference.registry, &Self::repository(&reference));

        tokio::task::spawn_blocking(move || {
            push_blob_blocking(
                &reference, &digest, &path, size, token, credentials, cancel, progress_tx,
            )
        })
        .await
        .map_err(|e| AppError::Internal(format!("push task panicked: {e}")))?
    }

    /// Downloads a single blob to `<root>/blobs/sha256-<hex>`, resuming from
    /// a partial `.part` file if one exists, verifying the digest on
    /// completion, and reporting progress on `progress_tx`.
    ///
    /// If another caller is already pulling the same digest, this call
    /// follows that transfer's progress instead of starting a second one.
    /// `cancel` is checked between chunks so a disconnected caller stops the
    /// download promptly; a follower's cancellation never interrupts the
    /// leader, only its own forwarding loop.
    pub async fn pull_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        size: u64,
        root: &Path,
        credentials: Option<(String, String)>,
        cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
        progress_tx: mpsc::Sender<Progress>,
    ) -> AppResult<PathBuf> {
        let final_path = crate::store::blob::blob_path(root, digest);
        if final_path.is_file() {
            let _ = progress_tx
                .send(Progress {
                    digest: digest.to_string(),
                    completed: size,
                    total: size,
                    status: ProgressStatus::Complete,
                })
                .await;
            return Ok(final_path);
        }

        match self.transfers.join(digest) {
            Role::Leader(broadcast_tx) => {
                let result = self
                    .pull_blob_as_leader(
                        reference,
                        digest,
                        size,
                        root,
                        credentials,
                        cancel,
                        &progress_tx,
                        &broadcast_tx,
                    )
                    .await;
                self.transfers.leave(digest);
                result
            }
            Role::Follower(mut rx) => {
                while let Ok(update) = rx.recv().await {
                    if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                        return Err(AppError::Canceled);
                    }
                    let done = update.status == ProgressStatus::Complete;
                    if progress_tx.send(update).await.is_err() {
                        return Err(AppError::Canceled);
                    }
                    if done {
                        break;
                    }
                }
                Ok(final_path)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pull_blob_as_leader(
        &self,
        reference: &Reference,
        digest: &Digest,
        size: u64,
        root: &Path,
        credentials: Option<(String, String)>,
        cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
        progress_tx: &mpsc::Sender<Progress>,
        broadcast_tx: &tokio::sync::broadcast::Sender<Progress>,
    ) -> AppResult<PathBuf> {
        let root = root.to_path_buf();
        let reference = reference.clone();
        let digest = digest.clone();
        let progress_tx = progress_tx.clone();
        let broadcast_tx = broadcast_tx.clone();
        let token = self
            .tokens
            .get(&reference.registry, &Self::repository(&reference));

        tokio::task::spawn_blocking(move || {
            pull_blob_blocking(
                &reference,
                &digest,
                size,
                &root,
                token,
                credentials,
                cancel,
                progress_tx,
                broadcast_tx,
            )
        })
        .await
        .map_err(|e| AppError::Internal(format!("pull task panicked: {e}")))?
    }
}

#[allow(clippy::too_many_arguments)]
fn pull_blob_blocking(
    reference: &Reference,
    digest: &Digest,
    size: u64,
    root: &Path,
    mut token: Option<String>,
    credentials: Option<(String, String)>,
    cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
    progress_tx: mpsc::Sender<Progress>,
    broadcast_tx: tokio::sync::broadcast::Sender<Progress>,
) -> AppResult<PathBuf> {
    let url = format!(
        "https://{}/v2/{}/{}/blobs/{}",
        reference.registry, reference.namespace, reference.name, digest
    );

    let part_path = root.join("blobs").join(format!(".part-{}", digest.hex()));
    std::fs::create_dir_all(root.join("blobs"))?;

    let resume_offset = std::fs::metadata(&part_path).map(|m| m.len()).unwrap_or(0);

    let mut attempt_request = |offset: u64, token: &Option<String>| -> Result<ureq::Response, ureq::Error> {
        let mut req = ureq::get(&url);
        if let Some(t) = token {
            req = req.set("Authorization", &format!("Bearer {t}"));
        }
        if offset > 0 {
            req = req.set("Range", &format!("bytes={offset}-"));
        }
        req.call()
    };

    let resp = match attempt_request(resume_offset, &token) {
        Ok(r) => r,
        Err(ureq::Error::Status(401, resp)) => {
            let challenge = resp
                .header("www-authenticate")
                .and_then(parse_www_authenticate)
                .ok_or_else(|| AppError::AuthFailed("401 without Bearer challenge".to_string()))?;
            let (user, pass) = credentials
                .as_ref()
                .map(|(u, p)| (Some(u.as_str()), Some(p.as_str())))
                .unwrap_or((None, None));
            let new_token = fetch_token(&challenge, user, pass)?;
            token = Some(new_token.clone());
            attempt_request(resume_offset, &token).map_err(|e| AppError::Network(e.to_string()))?
        }
        Err(e) => return Err(AppError::Network(e.to_string())),
    };

    let is_range_response = resp.status() == 206;
    let actual_offset = if is_range_response { resume_offset } else { 0 };
    if !is_range_response && part_path.exists() {
        let _ = std::fs::remove_file(&part_path);
    }

    let mut file = if actual_offset > 0 {
        std::fs::OpenOptions::new().append(true).open(&part_path)?
    } else {
        std::fs::File::create(&part_path)?
    };

    let mut hasher = crate::store::digest::DigestWriter::new();
    // Re-hash the already-downloaded prefix so the final digest covers the
    // whole blob, not just the resumed tail.
    if actual_offset > 0 {
        let mut existing = std::fs::File::open(&part_path)?;
        let mut buf = vec![0u8; 65536];
        loop {
            let n = existing.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }

    let mut reader = resp.into_reader();
    let mut buf = [0u8; 65536];
    let mut downloaded = actual_offset;
    let mut last_sent = std::time::Instant::now();

    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| AppError::Network(format!("read error: {e}")))?;
        if n == 0 {
            break;
        }
        std::io::Write::write_all(&mut file, &buf[..n])?;
        hasher.update(&buf[..n]);
        downloaded += n as u64;

        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            drop(file);
            return Err(AppError::Canceled);
        }

        if last_sent.elapsed() >= Duration::from_millis(200) {
            let update = Progress {
                digest: digest.to_string(),
                completed: downloaded,
                total: size,
                status: ProgressStatus::Downloading,
            };
            let _ = progress_tx.blocking_send(update.clone());
            let _ = broadcast_tx.send(update);
            last_sent = std::time::Instant::now();
        }
    }

    drop(file);

    let verify_update = Progress {
        digest: digest.to_string(),
        completed: downloaded,
        total: size,
        status: ProgressStatus::Verifying,
    };
    let _ = progress_tx.blocking_send(verify_update.clone());
    let _ = broadcast_tx.send(verify_update);

    let actual_digest = hasher.finalize();
    if &actual_digest != digest {
        // Never retry a digest mismatch: drop the partial file so the next
        // attempt restarts clean.
        let _ = std::fs::remove_file(&part_path);
        return Err(AppError::DigestMismatch {
            expected: digest.to_string(),
            actual: actual_digest.to_string(),
        });
    }

    let final_path = crate::store::blob::blob_path(root, digest);
    std::fs::rename(&part_path, &final_path)?;

    let done_update = Progress {
        digest: digest.to_string(),
        completed: downloaded,
        total: size,
        status: ProgressStatus::Complete,
    };
    let _ = progress_tx.blocking_send(done_update.clone());
    let _ = broadcast_tx.send(done_update);

    Ok(final_path)
}

const PUSH_CHUNK_SIZE: usize = 1024 * 1024;

/// Mirrors `pull_blob_blocking`'s shape for the upload direction: HEAD to
/// skip blobs the registry already holds, then POST/PATCH.../PUT to stream
/// the rest in fixed-size chunks.
#[allow(clippy::too_many_arguments)]
fn push_blob_blocking(
    reference: &Reference,
    digest: &Digest,
    path: &Path,
    size: u64,
    mut token: Option<String>,
    credentials: Option<(String, String)>,
    cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
    progress_tx: mpsc::Sender<Progress>,
) -> AppResult<()> {
    let blob_url = format!(
        "https://{}/v2/{}/{}/blobs/{}",
        reference.registry, reference.namespace, reference.name, digest
    );

    let head = |token: &Option<String>| -> Result<ureq::Response, ureq::Error> {
        let mut req = ureq::request("HEAD", &blob_url);
        if let Some(t) = token {
            req = req.set("Authorization", &format!("Bearer {t}"));
        }
        req.call()
    };

    if head(&token).is_ok() {
        let done = Progress {
            digest: digest.to_string(),
            completed: size,
            total: size,
            status: ProgressStatus::Complete,
        };
        let _ = progress_tx.blocking_send(done);
        return Ok(());
    }

    let start_url = format!(
        "https://{}/v2/{}/{}/blobs/uploads/",
        reference.registry, reference.namespace, reference.name
    );

    let start = |token: &Option<String>| -> Result<ureq::Response, ureq::Error> {
        let mut req = ureq::post(&start_url);
        if let Some(t) = token {
            req = req.set("Authorization", &format!("Bearer {t}"));
        }
        req.call()
    };

    let resp = match start(&token) {
        Ok(r) => r,
        Err(ureq::Error::Status(401, resp)) => {
            let challenge = resp
                .header("www-authenticate")
                .and_then(parse_www_authenticate)
                .ok_or_else(|| AppError::AuthFailed("401 without Bearer challenge".to_string()))?;
            let (user, pass) = credentials
                .as_ref()
                .map(|(u, p)| (Some(u.as_str()), Some(p.as_str())))
                .unwrap_or((None, None));
            let new_token = fetch_token(&challenge, user, pass)?;
            token = Some(new_token);
            start(&token).map_err(|e| AppError::Network(e.to_string()))?
        }
        Err(e) => return Err(AppError::Network(e.to_string())),
    };

    let mut upload_url = resp
        .header("location")
        .ok_or_else(|| AppError::Network("upload session missing Location header".to_string()))?
        .to_string();

    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; PUSH_CHUNK_SIZE];
    let mut uploaded: u64 = 0;
    let mut last_sent = std::time::Instant::now();

    loop {
        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(AppError::Canceled);
        }

        let n = std::io::Read::read(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        let range = format!("{}-{}", uploaded, uploaded + n as u64 - 1);
        let mut req = ureq::request("PATCH", &upload_url)
            .set("content-type", "application/octet-stream")
            .set("content-range", &range)
            .set("content-length", &n.to_string());
        if let Some(t) = &token {
            req = req.set("Authorization", &format!("Bearer {t}"));
        }
        let resp = req
            .send_bytes(&buf[..n])
            .map_err(|e| AppError::Network(format!("chunk upload failed: {e}")))?;
        if let Some(next) = resp.header("location") {
            upload_url = next.to_string();
        }
        uploaded += n as u64;

        if last_sent.elapsed() >= Duration::from_millis(200) || uploaded == size {
            let update = Progress {
                digest: digest.to_string(),
                completed: uploaded,
                total: size,
                status: ProgressStatus::Downloading,
            };
            let _ = progress_tx.blocking_send(update);
            last_sent = std::time::Instant::now();
        }
    }

    let finalize_url = format!("{upload_url}{}digest={digest}", if upload_url.contains('?') { "&" } else { "?" });
    let mut finalize = ureq::put(&finalize_url);
    if let Some(t) = &token {
        finalize = finalize.set("Authorization", &format!("Bearer {t}"));
    }
    finalize
        .call()
        .map_err(|e| AppError::Network(format!("upload finalize failed: {e}")))?;

    let done = Progress {
        digest: digest.to_string(),
        completed: uploaded,
        total: size,
        status: ProgressStatus::Complete,
    };
    let _ = progress_tx.blocking_send(done);
    Ok(())
}

/// Retries `network`-classified failures with exponential backoff;
/// `digest-mismatch` and other error kinds are never retried.
fn with_retry<T>(mut f: impl FnMut() -> AppResult<T>) -> AppResult<T> {
    let mut last_err = None;
    for backoff_ms in std::iter::once(0).chain(RETRY_BACKOFFS_MS.iter().copied()) {
        if backoff_ms > 0 {
            std::thread::sleep(Duration::from_millis(backoff_ms));
        }
        match f() {
            Ok(v) => return Ok(v),
            Err(e @ AppError::Network(_)) => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| AppError::Network("retries exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_retry_stops_after_non_network_error() {
        let mut calls = 0;
        let result: AppResult<()> = with_retry(|| {
            calls += 1;
            Err(AppError::BadRequest("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1, "non-network errors must not be retried");
    }

    #[test]
    fn with_retry_gives_up_after_all_backoffs() {
        let mut calls = 0;
        let result: AppResult<()> = with_retry(|| {
            calls += 1;
            Err(AppError::Network("down".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1 + RETRY_BACKOFFS_MS.len());
    }
}
