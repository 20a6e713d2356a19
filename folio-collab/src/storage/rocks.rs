//! RocksDB-backed section snapshot store.
//!
//! Column families:
//! - `sections` — section text (LZ4 compressed), keyed by document + section
//! - `metadata` — per-section metadata (bincode: revision, sizes, timestamps)
//!
//! Key layout: `<doc_len:4 bytes BE><document_id><section>`. The length
//! prefix keeps `("ab", "c")` and `("a", "bc")` apart and lets all sections
//! of one document be found by prefix scan.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    MultiThreaded, Options, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{SectionSnapshot, SnapshotStore, StoreError};

const CF_SECTIONS: &str = "sections";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SECTIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Metadata stored next to each section's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionMetadata {
    pub document_id: String,
    pub section: String,
    /// Revision the stored text corresponds to
    pub revision: u64,
    /// Uncompressed text size in bytes
    pub text_size: u64,
    /// Compressed text size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl SectionMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB store for section snapshots.
///
/// Text and metadata for a section are written in one `WriteBatch`, so a
/// reader never sees text from one persist with the revision of another.
pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened section store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed.
            CF_SECTIONS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    // ─── Sections ─────────────────────────────────────────────────────

    /// Write text + metadata for one section atomically.
    pub fn save_section(
        &self,
        document_id: &str,
        section: &str,
        snapshot: &SectionSnapshot,
    ) -> Result<SectionMetadata, StoreError> {
        let cf_sections = self.cf(CF_SECTIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = Self::section_key(document_id, section);

        let compressed = lz4_flex::compress_prepend_size(snapshot.text.as_bytes());

        let now = now_secs();
        let created_at = self
            .load_metadata(document_id, section)?
            .map_or(now, |m| m.created_at);
        let meta = SectionMetadata {
            document_id: document_id.to_string(),
            section: section.to_string(),
            revision: snapshot.revision,
            text_size: snapshot.text.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at,
            updated_at: now,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_sections, &key, &compressed);
        batch.put_cf(&cf_meta, &key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load text + revision for one section.
    pub fn load_section(
        &self,
        document_id: &str,
        section: &str,
    ) -> Result<Option<SectionSnapshot>, StoreError> {
        let Some(meta) = self.load_metadata(document_id, section)? else {
            return Ok(None);
        };
        let cf = self.cf(CF_SECTIONS)?;
        let key = Self::section_key(document_id, section);
        let Some(compressed) = self.db.get_cf(&cf, &key)? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Some(SectionSnapshot {
            text,
            revision: meta.revision,
        }))
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(
        &self,
        document_id: &str,
        section: &str,
    ) -> Result<Option<SectionMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, Self::section_key(document_id, section))? {
            Some(bytes) => SectionMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn document_prefix(document_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(4 + document_id.len());
        prefix.extend_from_slice(&(document_id.len() as u32).to_be_bytes());
        prefix.extend_from_slice(document_id.as_bytes());
        prefix
    }

    fn section_key(document_id: &str, section: &str) -> Vec<u8> {
        let mut key = Self::document_prefix(document_id);
        key.extend_from_slice(section.as_bytes());
        key
    }
}

impl SnapshotStore for RocksStore {
    fn load_section_snapshot(
        &self,
        document_id: &str,
        section: &str,
    ) -> Result<Option<SectionSnapshot>, StoreError> {
        self.load_section(document_id, section)
    }

    fn persist_section_snapshot(
        &self,
        document_id: &str,
        section: &str,
        snapshot: &SectionSnapshot,
    ) -> Result<(), StoreError> {
        let meta = self.save_section(document_id, section, snapshot)?;
        log::debug!(
            "Persisted {document_id}/{section}@{} ({} -> {} bytes)",
            meta.revision,
            meta.text_size,
            meta.compressed_size
        );
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    fn snap(text: &str, revision: u64) -> SectionSnapshot {
        SectionSnapshot {
            text: text.into(),
            revision,
        }
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_section_save_load() {
        let (_dir, store) = open_temp();
        let text = "We sampled 40 participants. ".repeat(20);

        let meta = store.save_section("paper-1", "methods", &snap(&text, 12)).unwrap();
        assert_eq!(meta.revision, 12);
        assert_eq!(meta.text_size, text.len() as u64);
        assert!(meta.compressed_size < meta.text_size);

        let loaded = store.load_section("paper-1", "methods").unwrap().unwrap();
        assert_eq!(loaded, snap(&text, 12));
    }

    #[test]
    fn test_missing_section_is_none() {
        let (_dir, store) = open_temp();
        assert!(store.load_section("paper-1", "abstract").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_keeps_created_at() {
        let (_dir, store) = open_temp();
        let first = store.save_section("d", "s", &snap("a", 1)).unwrap();
        let second = store.save_section("d", "s", &snap("ab", 2)).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.load_section("d", "s").unwrap().unwrap(), snap("ab", 2));
    }

    #[test]
    fn test_key_prefix_isolation() {
        let (_dir, store) = open_temp();
        store.save_section("ab", "c", &snap("one", 1)).unwrap();
        store.save_section("a", "bc", &snap("two", 2)).unwrap();

        assert_eq!(store.load_section("ab", "c").unwrap().unwrap().text, "one");
        assert_eq!(store.load_section("a", "bc").unwrap().unwrap().text, "two");
        assert!(store.load_section("a", "b").unwrap().is_none());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store
                .persist_section_snapshot("d", "intro", &snap("héllo wörld", 7))
                .unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        let loaded = store.load_section_snapshot("d", "intro").unwrap().unwrap();
        assert_eq!(loaded, snap("héllo wörld", 7));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("folio_data"));
        assert!(!config.sync_writes);
    }
}
