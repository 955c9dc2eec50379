//! RocksDB-backed persistent commit store.
//!
//! Column families:
//! - `commits` : Stamped commits as LZ4-compressed JSON, keyed by `doc:ref`
//! - `sync_log`: Refs in acceptance order, keyed by `doc:syncId:syncIndex`
//! - `metadata`: Per-document [`DocumentMetadata`] (bincode)
//!
//! `doc` is a fixed 16-byte prefix derived from the document id, so every
//! document's records are prefix-scannable and documents never interleave.
//! One database serves every document; [`RocksStoreFactory`] owns it.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::commit::{Commit, SyncId};
use crate::hash::RefScheme;

use super::batch::{plan_batch, DocHead};
use super::{collect_page, AddResult, CommitsPage, DocStore, DocStoreFactory, StoreConfig, StoreError};

const CF_COMMITS: &str = "commits";
const CF_SYNC_LOG: &str = "sync_log";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_COMMITS, CF_SYNC_LOG, CF_METADATA];

/// Length of the per-document key prefix.
const PREFIX_LEN: usize = 16;

type Db = DBWithThreadMode<SingleThreaded>;

/// Per-document record in the `metadata` column family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub head: DocHead,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str) -> Self {
        let now = now_secs();
        Self {
            doc_id: doc_id.to_string(),
            head: DocHead::default(),
            created_at: now,
            updated_at: now,
        }
    }

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

/// Owns the database and opens per-document stores on it.
#[derive(Clone)]
pub struct RocksStoreFactory {
    db: Arc<Db>,
    config: StoreConfig,
    verify: Option<RefScheme>,
}

impl RocksStoreFactory {
    /// Open the database at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("opened commit store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            config,
            verify: None,
        })
    }

    pub fn with_verify_refs(mut self, scheme: RefScheme) -> Self {
        self.verify = Some(scheme);
        self
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
            CF_COMMITS => {
                // Values are already LZ4 frames.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SYNC_LOG => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(PREFIX_LEN));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Ids of every document with stored metadata.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = cf(&self.db, CF_METADATA)?;
        let mut docs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            docs.push(DocumentMetadata::decode(&value)?.doc_id);
        }
        Ok(docs)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl DocStoreFactory for RocksStoreFactory {
    fn open(&self, doc_id: &str) -> Result<Box<dyn DocStore>, StoreError> {
        let prefix = doc_prefix(doc_id);
        let cf_meta = cf(&self.db, CF_METADATA)?;
        let meta = match self.db.get_cf(cf_meta, prefix)? {
            Some(bytes) => DocumentMetadata::decode(&bytes)?,
            None => DocumentMetadata::new(doc_id),
        };
        log::debug!(
            "opened {doc_id}: {} commits, head {:?}",
            meta.head.commit_count,
            meta.head.head
        );
        Ok(Box::new(RocksDocStore {
            db: Some(Arc::clone(&self.db)),
            doc_id: doc_id.to_string(),
            prefix,
            meta,
            sync_writes: self.config.sync_writes,
            verify: self.verify,
        }))
    }
}

/// One document's view of the shared database.
///
/// The relay keeps at most one store per document open, so the cached
/// metadata is authoritative.
pub struct RocksDocStore {
    /// `None` once closed.
    db: Option<Arc<Db>>,
    doc_id: String,
    prefix: [u8; PREFIX_LEN],
    meta: DocumentMetadata,
    sync_writes: bool,
    verify: Option<RefScheme>,
}

impl RocksDocStore {
    fn db(&self) -> Result<&Db, StoreError> {
        self.db
            .as_deref()
            .ok_or_else(|| StoreError::Closed(self.doc_id.clone()))
    }

    fn commit_key(&self, ref_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(PREFIX_LEN + ref_id.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(ref_id.as_bytes());
        key
    }

    /// Build a sync log key: prefix (16) + syncId (8 BE) + syncIndex (4 BE).
    fn log_key(&self, sync_id: SyncId, sync_index: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(PREFIX_LEN + 12);
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(&sync_id.0.to_be_bytes());
        key.extend_from_slice(&sync_index.to_be_bytes());
        key
    }

    fn load_commit(&self, ref_id: &str) -> Result<Option<Commit>, StoreError> {
        let db = self.db()?;
        match db.get_cf(cf(db, CF_COMMITS)?, self.commit_key(ref_id))? {
            Some(bytes) => decode_commit(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Keys of every record under this document's prefix in `cf_name`.
    fn prefixed_keys(&self, cf_name: &str) -> Result<Vec<Box<[u8]>>, StoreError> {
        let db = self.db()?;
        let mut keys = Vec::new();
        let iter = db.iterator_cf(cf(db, cf_name)?, IteratorMode::From(&self.prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&self.prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

impl DocStore for RocksDocStore {
    fn doc_id(&self) -> &str {
        &self.doc_id
    }

    fn get_commits_event(&self, since: Option<SyncId>, limit: usize) -> Result<CommitsPage, StoreError> {
        let db = self.db()?;
        let cf_log = cf(db, CF_SYNC_LOG)?;
        let start = since.unwrap_or(SyncId::ZERO).next();
        let start_key = self.log_key(start, 0);

        let entries = db
            .iterator_cf(cf_log, IteratorMode::From(&start_key, Direction::Forward))
            .map_while(|item| match item {
                Ok((key, value)) if key.starts_with(&self.prefix) => Some(Ok((key, value))),
                Ok(_) => None,
                Err(e) => Some(Err(StoreError::from(e))),
            })
            .map(|item| {
                let (key, value) = item?;
                let sync_id = parse_log_key(&key)?;
                let ref_id = std::str::from_utf8(&value)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                let commit = self.load_commit(ref_id)?.ok_or_else(|| {
                    StoreError::Database(format!("sync log names missing commit {ref_id}"))
                })?;
                Ok((sync_id, commit))
            });

        collect_page(entries, limit, self.meta.head.last_sync_id())
    }

    fn add(&mut self, commits: &[Commit]) -> Result<AddResult, StoreError> {
        let plan = plan_batch(commits, &self.meta.head, self.verify.as_ref(), |ref_id| {
            Ok(self.load_commit(ref_id)?.map(|c| c.metadata))
        })?;
        if plan.is_noop() {
            return Ok(plan.into_result());
        }

        let mut meta = self.meta.clone();
        meta.head = plan.next.clone();
        meta.updated_at = now_secs();

        let db = self.db()?;
        let cf_commits = cf(db, CF_COMMITS)?;
        let cf_log = cf(db, CF_SYNC_LOG)?;
        let cf_meta = cf(db, CF_METADATA)?;
        let sync_id = plan.sync_id.unwrap_or(SyncId::ZERO);

        let mut batch = WriteBatch::default();
        for commit in &plan.accepted {
            let index = commit.server_metadata().map_or(0, |s| s.sync_index);
            batch.put_cf(cf_commits, self.commit_key(&commit.ref_id), encode_commit(commit)?);
            batch.put_cf(cf_log, self.log_key(sync_id, index), commit.ref_id.as_bytes());
        }
        batch.put_cf(cf_meta, self.prefix, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        if let Err(e) = db.write_opt(batch, &write_opts) {
            log::error!("batch write for {} failed: {e}", self.doc_id);
            return Ok(plan.fail_storage(&e.to_string()));
        }

        self.meta = meta;
        Ok(plan.into_result())
    }

    fn head(&self) -> Result<Option<String>, StoreError> {
        self.db()?;
        Ok(self.meta.head.head.clone())
    }

    fn commit_count(&self) -> Result<u64, StoreError> {
        self.db()?;
        Ok(self.meta.head.commit_count)
    }

    fn delete(&mut self) -> Result<(), StoreError> {
        let db = self.db()?;
        let mut batch = WriteBatch::default();
        for name in [CF_COMMITS, CF_SYNC_LOG] {
            let handle = cf(db, name)?;
            for key in self.prefixed_keys(name)? {
                batch.delete_cf(handle, key);
            }
        }
        batch.delete_cf(cf(db, CF_METADATA)?, self.prefix);
        db.write(batch)?;

        log::info!("deleted document {}", self.doc_id);
        self.meta = DocumentMetadata::new(&self.doc_id);
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.db.take();
        Ok(())
    }
}

fn cf<'a>(db: &'a Db, name: &str) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
}

/// First 16 bytes of the document id's SHA-256.
fn doc_prefix(doc_id: &str) -> [u8; PREFIX_LEN] {
    let digest = Sha256::digest(doc_id.as_bytes());
    let mut prefix = [0u8; PREFIX_LEN];
    prefix.copy_from_slice(&digest[..PREFIX_LEN]);
    prefix
}

fn parse_log_key(key: &[u8]) -> Result<SyncId, StoreError> {
    let bytes = key
        .get(PREFIX_LEN..PREFIX_LEN + 8)
        .ok_or_else(|| StoreError::Deserialization("short sync log key".into()))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(SyncId(u64::from_be_bytes(buf)))
}

fn encode_commit(commit: &Commit) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(commit).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_commit(bytes: &[u8]) -> Result<Commit, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn factory(dir: &TempDir) -> RocksStoreFactory {
        RocksStoreFactory::open(StoreConfig::for_testing(dir.path())).unwrap()
    }

    fn commit(ref_id: &str, base: Option<&str>) -> Commit {
        Commit {
            ref_id: ref_id.into(),
            base_ref: base.map(Into::into),
            merge_ref: None,
            delta: json!({"text": [format!("edit {ref_id}")]}),
            metadata: json!({"user": "alice"}),
        }
    }

    #[test]
    fn test_add_and_page() {
        let dir = TempDir::new().unwrap();
        let mut store = factory(&dir).open("doc-a").unwrap();

        let result = store.add(&[commit("1", None), commit("2", Some("1"))]).unwrap();
        assert_eq!(result.acks.len(), 2);
        assert_eq!(result.sync_id, Some(SyncId(1)));
        store.add(&[commit("3", Some("2"))]).unwrap();

        let page = store.get_commits_event(None, 100).unwrap();
        let refs: Vec<&str> = page.commits.iter().map(|c| c.ref_id.as_str()).collect();
        assert_eq!(refs, vec!["1", "2", "3"]);
        assert_eq!(page.commits[0].metadata["user"], "alice");
        assert_eq!(page.sync_id, Some(SyncId(2)));

        let rest = store.get_commits_event(Some(SyncId(1)), 100).unwrap();
        assert_eq!(rest.commits.len(), 1);
        assert!(store.get_commits_event(Some(SyncId(2)), 100).unwrap().commits.is_empty());
    }

    #[test]
    fn test_reopen_keeps_seen_refs() {
        let dir = TempDir::new().unwrap();
        let first_ack;
        {
            let factory = factory(&dir);
            let mut store = factory.open("doc").unwrap();
            first_ack = store.add(&[commit("1", None)]).unwrap().acks;
            store.close().unwrap();
        }

        let factory = factory(&dir);
        let mut store = factory.open("doc").unwrap();
        assert_eq!(store.head().unwrap().as_deref(), Some("1"));

        let replay = store.add(&[commit("1", None)]).unwrap();
        assert_eq!(replay.acks, first_ack);
        assert_eq!(store.commit_count().unwrap(), 1);

        let next = store.add(&[commit("2", Some("1"))]).unwrap();
        assert!(next.ref_errors.is_empty());
        assert_eq!(next.sync_id, Some(SyncId(2)));
    }

    #[test]
    fn test_unknown_parent_is_per_commit() {
        let dir = TempDir::new().unwrap();
        let mut store = factory(&dir).open("doc").unwrap();
        let result = store
            .add(&[commit("1", None), commit("orphan", Some("nope"))])
            .unwrap();
        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.ref_errors["orphan"].code, ErrorCode::UnknownRef);
    }

    #[test]
    fn test_documents_are_isolated() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let mut a = factory.open("doc-a").unwrap();
        let mut b = factory.open("doc-b").unwrap();
        a.add(&[commit("1", None)]).unwrap();
        b.add(&[commit("x", None), commit("y", Some("x"))]).unwrap();

        assert_eq!(a.get_commits_event(None, 10).unwrap().commits.len(), 1);
        assert_eq!(b.get_commits_event(None, 10).unwrap().commits.len(), 2);

        let mut ids = factory.list_documents().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["doc-a", "doc-b"]);
    }

    #[test]
    fn test_delete_removes_document() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let mut a = factory.open("doc-a").unwrap();
        let mut b = factory.open("doc-b").unwrap();
        a.add(&[commit("1", None)]).unwrap();
        b.add(&[commit("1", None)]).unwrap();

        a.delete().unwrap();
        assert!(a.get_commits_event(None, 10).unwrap().commits.is_empty());
        assert_eq!(a.head().unwrap(), None);
        assert_eq!(b.commit_count().unwrap(), 1);

        let reopened = factory.open("doc-a").unwrap();
        assert_eq!(reopened.commit_count().unwrap(), 0);
    }

    #[test]
    fn test_closed_store_refuses_work() {
        let dir = TempDir::new().unwrap();
        let mut store = factory(&dir).open("doc").unwrap();
        store.close().unwrap();
        assert!(matches!(store.add(&[commit("1", None)]), Err(StoreError::Closed(_))));
    }

    #[test]
    fn test_commit_records_round_trip_compressed() {
        let big = Commit {
            metadata: Value::Null,
            delta: json!({"body": ["lorem ipsum ".repeat(200)]}),
            ..commit("r", None)
        };
        let bytes = encode_commit(&big).unwrap();
        assert!(bytes.len() < serde_json::to_vec(&big).unwrap().len());
        assert_eq!(decode_commit(&bytes).unwrap(), big);
    }

    #[test]
    fn test_metadata_bincode() {
        let meta = DocumentMetadata {
            head: DocHead {
                head: Some("h".into()),
                last_sync_id: 7,
                commit_count: 9,
            },
            ..DocumentMetadata::new("doc")
        };
        assert_eq!(DocumentMetadata::decode(&meta.encode().unwrap()).unwrap(), meta);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert!(config.sync_writes);
    }
}
