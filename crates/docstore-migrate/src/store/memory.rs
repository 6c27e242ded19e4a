//! In-memory document store with JSON snapshot persistence.
//!
//! Documents in a collection are keyed by an insertion sequence number. The
//! cursor handed out by `list_collection` is the sequence number of the last
//! returned document, so it stays valid when documents before it are deleted
//! mid-scan (which recursive deletes do).
//!
//! Deleting a document leaves its subcollections in place, as the real store
//! does. Those orphans remain listable through `list_subcollections`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Cursor, DocumentStore, EqualityFilter, Page};
use crate::core::{CollectionPath, Document, DocumentPath, MutationOp};
use crate::error::{MigrateError, Result};

/// Per-commit operation limit of the modelled store.
pub const DEFAULT_HARD_CAP: usize = 500;

/// Snapshot layout: collection path → document id → fields.
type Snapshot = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Clone, Default)]
struct StoredDoc {
    seq: u64,
    fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
struct CollectionData {
    next_seq: u64,
    order: BTreeMap<u64, String>,
    docs: HashMap<String, StoredDoc>,
}

impl CollectionData {
    fn insert_new(&mut self, id: &str, fields: BTreeMap<String, Value>) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.order.insert(seq, id.to_string());
        self.docs.insert(id.to_string(), StoredDoc { seq, fields });
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.docs.remove(id) {
            Some(doc) => {
                self.order.remove(&doc.seq);
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Failures to inject into the next calls, for exercising error paths.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Fail this many upcoming commits with a transient error.
    pub transient_commits: usize,
    /// Fail this many upcoming page fetches with a transient error.
    pub transient_pages: usize,
    /// Fail this many upcoming single-document deletes with a transient error.
    pub transient_deletes: usize,
    /// Deny every commit.
    pub deny_commits: bool,
    /// Deny every read.
    pub deny_reads: bool,
}

/// Thread-safe in-memory [`DocumentStore`].
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, CollectionData>>,
    faults: Mutex<FaultPlan>,
    commit_log: Mutex<Vec<usize>>,
    hard_cap: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with the default hard cap.
    pub fn new() -> Self {
        Self::with_hard_cap(DEFAULT_HARD_CAP)
    }

    pub fn with_hard_cap(hard_cap: usize) -> Self {
        Self {
            collections: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(FaultPlan::default()),
            commit_log: Mutex::new(Vec::new()),
            hard_cap,
        }
    }

    /// Load a store from a JSON snapshot file. A missing file yields an empty store.
    pub fn load_json<P: AsRef<Path>>(path: P, hard_cap: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Snapshot {:?} does not exist, starting empty", path);
            return Ok(Self::with_hard_cap(hard_cap));
        }

        let content = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        let mut collections = BTreeMap::new();
        for (collection, docs) in snapshot {
            let collection_path = CollectionPath::parse(&collection)?;
            let data: &mut CollectionData = collections
                .entry(collection_path.as_str().to_string())
                .or_default();
            for (id, fields) in docs {
                let doc = Document::from_json(collection_path.doc(&id)?, fields);
                data.insert_new(&id, doc.into_fields());
            }
        }
        Ok(Self {
            collections: Mutex::new(collections),
            faults: Mutex::new(FaultPlan::default()),
            commit_log: Mutex::new(Vec::new()),
            hard_cap,
        })
    }

    /// Write the store to a JSON snapshot file (atomic write).
    pub async fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self.snapshot().await;
        let content = serde_json::to_string_pretty(&snapshot)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    async fn snapshot(&self) -> Snapshot {
        let collections = self.collections.lock().await;
        collections
            .iter()
            .filter(|(_, data)| !data.is_empty())
            .map(|(path, data)| {
                let docs = data
                    .docs
                    .iter()
                    .map(|(id, doc)| {
                        let fields = doc
                            .fields
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        (id.clone(), Value::Object(fields))
                    })
                    .collect();
                (path.clone(), docs)
            })
            .collect()
    }

    /// Insert or replace a document outside of any batch (fixtures, tests).
    pub async fn insert(&self, path: &DocumentPath, fields: Value) {
        let doc = Document::from_json(path.clone(), fields);
        let mut collections = self.collections.lock().await;
        let data = collections
            .entry(path.collection().as_str().to_string())
            .or_default();
        match data.docs.get_mut(path.id()) {
            Some(existing) => existing.fields = doc.into_fields(),
            None => data.insert_new(path.id(), doc.into_fields()),
        }
    }

    /// Replace the fault plan.
    pub async fn inject(&self, faults: FaultPlan) {
        *self.faults.lock().await = faults;
    }

    /// Sizes of all committed batches, in commit order.
    pub async fn commit_log(&self) -> Vec<usize> {
        self.commit_log.lock().await.clone()
    }

    /// Total number of documents across all collections.
    pub async fn document_count(&self) -> usize {
        let collections = self.collections.lock().await;
        collections.values().map(|c| c.docs.len()).sum()
    }

    /// Paths of every stored document, sorted.
    pub async fn document_paths(&self) -> Vec<String> {
        let collections = self.collections.lock().await;
        let mut paths: Vec<String> = collections
            .iter()
            .flat_map(|(collection, data)| {
                data.docs
                    .keys()
                    .map(move |id| format!("{}/{}", collection, id))
            })
            .collect();
        paths.sort();
        paths
    }

    fn decode_cursor(cursor: &Cursor) -> Result<u64> {
        cursor
            .as_str()
            .parse::<u64>()
            .map_err(|_| MigrateError::validation(cursor.as_str(), "malformed cursor"))
    }

    async fn check_read(&self) -> Result<()> {
        let faults = self.faults.lock().await;
        if faults.deny_reads {
            return Err(MigrateError::Permission("read access denied".to_string()));
        }
        Ok(())
    }

    fn apply_op(scratch: &mut HashMap<String, CollectionData>, op: &MutationOp) -> Result<()> {
        let path = op.path();
        let data = scratch
            .entry(path.collection().as_str().to_string())
            .or_default();

        if let MutationOp::DeleteDocument { .. } = op {
            data.remove(path.id());
            return Ok(());
        }

        match data.docs.get_mut(path.id()) {
            Some(stored) => {
                let mut doc =
                    Document::with_fields(path.clone(), std::mem::take(&mut stored.fields));
                op.apply_to(&mut doc);
                stored.fields = doc.into_fields();
            }
            None if op.requires_existing() => {
                return Err(MigrateError::NotFound(format!(
                    "{} ({} requires an existing document)",
                    path,
                    op.kind()
                )));
            }
            None => {
                let mut doc = Document::new(path.clone());
                op.apply_to(&mut doc);
                data.insert_new(path.id(), doc.into_fields());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>> {
        self.check_read().await?;
        let collections = self.collections.lock().await;
        Ok(collections
            .get(path.collection().as_str())
            .and_then(|data| data.docs.get(path.id()))
            .map(|stored| Document::with_fields(path.clone(), stored.fields.clone())))
    }

    async fn list_collection(
        &self,
        path: &CollectionPath,
        cursor: Option<&Cursor>,
        page_size: usize,
        filter: Option<&EqualityFilter>,
    ) -> Result<Page> {
        self.check_read().await?;
        {
            let mut faults = self.faults.lock().await;
            if faults.transient_pages > 0 {
                faults.transient_pages -= 1;
                return Err(MigrateError::Transient(format!(
                    "listing {} timed out",
                    path
                )));
            }
        }

        let after = cursor.map(Self::decode_cursor).transpose()?.unwrap_or(0);
        let collections = self.collections.lock().await;
        let Some(data) = collections.get(path.as_str()) else {
            return Ok(Page::default());
        };

        let mut matched: Vec<(u64, Document)> = Vec::with_capacity(page_size + 1);
        for (seq, id) in data.order.range(after + 1..) {
            let Some(stored) = data.docs.get(id) else {
                continue;
            };
            let doc = Document::with_fields(path.doc(id)?, stored.fields.clone());
            if filter.map_or(true, |f| f.matches(&doc)) {
                matched.push((*seq, doc));
                if matched.len() > page_size {
                    break;
                }
            }
        }

        let has_more = matched.len() > page_size;
        matched.truncate(page_size);
        let next_cursor = if has_more {
            matched.last().map(|(seq, _)| Cursor::new(seq.to_string()))
        } else {
            None
        };

        Ok(Page {
            documents: matched.into_iter().map(|(_, doc)| doc).collect(),
            next_cursor,
        })
    }

    async fn list_subcollections(&self, path: &DocumentPath) -> Result<Vec<CollectionPath>> {
        self.check_read().await?;
        let prefix = format!("{}/", path);
        let collections = self.collections.lock().await;
        let mut found = Vec::new();
        for (collection, data) in collections.range(prefix.clone()..) {
            let Some(rest) = collection.strip_prefix(&prefix) else {
                break;
            };
            if !rest.contains('/') && !data.is_empty() {
                found.push(CollectionPath::parse(collection)?);
            }
        }
        Ok(found)
    }

    async fn commit_batch(&self, ops: &[MutationOp]) -> Result<()> {
        if ops.len() > self.hard_cap {
            return Err(MigrateError::BatchInvariant {
                size: ops.len(),
                limit: self.hard_cap,
            });
        }
        {
            let mut faults = self.faults.lock().await;
            if faults.deny_commits {
                return Err(MigrateError::Permission("write access denied".to_string()));
            }
            if faults.transient_commits > 0 {
                faults.transient_commits -= 1;
                return Err(MigrateError::Transient("commit deadline exceeded".to_string()));
            }
        }

        let mut collections = self.collections.lock().await;

        // Apply to copies of the touched collections; swap in only on success.
        let mut scratch: HashMap<String, CollectionData> = HashMap::new();
        for op in ops {
            let key = op.path().collection().as_str().to_string();
            if !scratch.contains_key(&key) {
                let copy = collections.get(&key).cloned().unwrap_or_default();
                scratch.insert(key, copy);
            }
        }
        for op in ops {
            Self::apply_op(&mut scratch, op)?;
        }
        collections.extend(scratch);
        drop(collections);

        self.commit_log.lock().await.push(ops.len());
        Ok(())
    }

    async fn delete_document(&self, path: &DocumentPath) -> Result<bool> {
        {
            let mut faults = self.faults.lock().await;
            if faults.deny_commits {
                return Err(MigrateError::Permission("write access denied".to_string()));
            }
            if faults.transient_deletes > 0 {
                faults.transient_deletes -= 1;
                return Err(MigrateError::Transient(format!("deleting {} timed out", path)));
            }
        }
        let mut collections = self.collections.lock().await;
        Ok(collections
            .get_mut(path.collection().as_str())
            .map(|data| data.remove(path.id()))
            .unwrap_or(false))
    }

    fn max_batch_ops(&self) -> usize {
        self.hard_cap
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
