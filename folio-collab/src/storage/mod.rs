//! Section snapshot persistence.
//!
//! ```text
//! ┌────────────────┐  spawn_blocking   ┌──────────────────────────────┐
//! │ section actor  │ ────────────────► │ dyn SnapshotStore            │
//! │ (text, rev)    │ ◄──────────────── │  MemoryStore | RocksStore    │
//! └────────────────┘   persisted(rev)  └──────────────────────────────┘
//! ```
//!
//! Stores hold the latest `(text, revision)` per `(document, section)`;
//! writes are last-write-wins. Calls are blocking and run off the async
//! executor. Failed persists are retried with exponential backoff and then
//! logged; they never reach clients.

pub mod rocks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use rocks::{RocksStore, SectionMetadata, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persisted state of one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSnapshot {
    pub text: String,
    pub revision: u64,
}

/// Durable storage for section snapshots.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Latest persisted snapshot, or `None` for a section never persisted.
    fn load_section_snapshot(
        &self,
        document_id: &str,
        section: &str,
    ) -> Result<Option<SectionSnapshot>, StoreError>;

    /// Replace the persisted snapshot.
    fn persist_section_snapshot(
        &self,
        document_id: &str,
        section: &str,
        snapshot: &SectionSnapshot,
    ) -> Result<(), StoreError>;

    /// Make everything persisted so far durable. Called once at shutdown.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-process store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sections: Mutex<HashMap<(String, String), SectionSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted sections across all documents.
    pub fn len(&self) -> usize {
        self.sections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.lock().is_empty()
    }
}

impl SnapshotStore for MemoryStore {
    fn load_section_snapshot(
        &self,
        document_id: &str,
        section: &str,
    ) -> Result<Option<SectionSnapshot>, StoreError> {
        let key = (document_id.to_string(), section.to_string());
        Ok(self.sections.lock().get(&key).cloned())
    }

    fn persist_section_snapshot(
        &self,
        document_id: &str,
        section: &str,
        snapshot: &SectionSnapshot,
    ) -> Result<(), StoreError> {
        let key = (document_id.to_string(), section.to_string());
        self.sections.lock().insert(key, snapshot.clone());
        Ok(())
    }
}

/// Retry schedule for persistence calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn for_testing() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }
}

/// Load a snapshot on the blocking pool.
pub async fn load_blocking(
    store: Arc<dyn SnapshotStore>,
    document_id: String,
    section: String,
) -> Result<Option<SectionSnapshot>, StoreError> {
    tokio::task::spawn_blocking(move || store.load_section_snapshot(&document_id, &section))
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

/// Persist a snapshot on the blocking pool, retrying with backoff.
pub async fn persist_with_retry(
    store: Arc<dyn SnapshotStore>,
    document_id: String,
    section: String,
    snapshot: SectionSnapshot,
    policy: RetryPolicy,
) -> Result<(), StoreError> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        let result = {
            let store = store.clone();
            let document_id = document_id.clone();
            let section = section.clone();
            let snapshot = snapshot.clone();
            tokio::task::spawn_blocking(move || {
                store.persist_section_snapshot(&document_id, &section, &snapshot)
            })
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
            .and_then(|r| r)
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.attempts.max(1) => {
                log::warn!(
                    "Persist of {document_id}/{section}@{} failed (attempt {attempt}): {e}",
                    snapshot.revision
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
