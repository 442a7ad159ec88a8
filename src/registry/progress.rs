//! In-flight pull/push de-duplication, keyed by blob digest.
//!
//! A second caller pulling a blob that's already downloading subscribes to
//! the same progress broadcast instead of issuing a second GET.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::Digest;

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub digest: String,
    pub completed: u64,
    pub total: u64,
    pub status: ProgressStatus,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Downloading,
    Verifying,
    Complete,
}

#[derive(Default)]
pub struct InFlightTransfers {
    inner: Mutex<HashMap<Digest, broadcast::Sender<Progress>>>,
}

pub enum Role {
    /// This caller is the one actually performing the transfer.
    Leader(broadcast::Sender<Progress>),
    /// Another caller is already transferring this digest; subscribe instead.
    Follower(broadcast::Receiver<Progress>),
}

impl InFlightTransfers {
    pub fn new() -> Self {
        InFlightTransfers {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Registers interest in `digest`. The first caller becomes the leader
    /// and is responsible for performing the transfer and broadcasting
    /// progress; later callers become followers.
    pub fn join(&self, digest: &Digest) -> Role {
        let mut guard = self.inner.lock().unwrap();
        if let Some(tx) = guard.get(digest) {
            return Role::Follower(tx.subscribe());
        }
        let (tx, _rx) = broadcast::channel(256);
        guard.insert(digest.clone(), tx.clone());
        Role::Leader(tx)
    }

    pub fn leave(&self, digest: &Digest) {
        self.inner.lock().unwrap().remove(digest);
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
    fn first_caller_leads_second_follows() {
        let transfers = InFlightTransfers::new();
        let d = digest(1);

        match transfers.join(&d) {
            Role::Leader(_) => {}
            Role::Follower(_) => panic!("expected leader"),
        }

        match transfers.join(&d) {
            Role::Follower(_) => {}
            Role::Leader(_) => panic!("expected follower"),
        }
    }

    #[test]
    fn leaving_allows_a_new_leader() {
        let transfers = InFlightTransfers::new();
        let d = digest(2);
        let _ = transfers.join(&d);
        transfers.leave(&d);

        match transfers.join(&d) {
            Role::Leader(_) => {}
            Role::Follower(_) => panic!("expected a fresh leader after leave()"),
        }
    }
}
