use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable};
use serde_json::Value;
use tracing::{debug, warn};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::clock::Clock;
use crate::index::{IndexJob, RegisteredIndex};
use crate::meta::DocMeta;
use crate::session::DocumentSession;
use crate::storage_error::StorageError;
use crate::tables;

pub use crate::index::IndexDefinition;

/// One logical mutation inside a session commit.
pub enum WriteRequest {
    PutDocument {
        id: String,
        collection: String,
        body: Vec<u8>,
    },
    DeleteDocument {
        id: String,
    },
    IncrementCounter {
        doc_id: String,
        name: String,
        delta: i64,
    },
}

/// A session commit. Applied atomically in a single write transaction.
pub type WriteBatch = Vec<WriteRequest>;

struct WriteJob {
    batch: WriteBatch,
    respond_to: oneshot::Sender<Result<u64, StorageError>>,
}

pub struct DocumentStore {
    db: Arc<Database>,
    write_tx: mpsc::Sender<WriteJob>,
    index_tx: mpsc::Sender<IndexJob>,
    catalog: RwLock<Vec<RegisteredIndex>>,
    committed_seq: AtomicU64,
    indexed_seq: AtomicU64,
    rebuilds_pending: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl DocumentStore {
    pub async fn open(path: &str, clock: Arc<dyn Clock>) -> Result<Arc<Self>, StorageError> {
        let db = Database::create(path).map_err(|e| StorageError::Other(e.to_string()))?;
        Self::start(db, clock)
    }

    /// Ephemeral store for tests and throwaway instances.
    pub async fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Arc<Self>, StorageError> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Self::start(db, clock)
    }

    fn start(db: Database, clock: Arc<dyn Clock>) -> Result<Arc<Self>, StorageError> {
        // All tables are fixed; create them up front.
        let txn = db
            .begin_write()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        for def in [
            tables::DOCS,
            tables::DOC_META,
            tables::COUNTERS,
            tables::INDEX_ENTRIES,
            tables::INDEX_TERMS,
        ] {
            txn.open_table(def)
                .map_err(|e| StorageError::Other(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Other(e.to_string()))?;

        let (write_tx, mut write_rx) = mpsc::channel::<WriteJob>(100);
        let (index_tx, mut index_rx) = mpsc::channel::<IndexJob>(100);

        let store = Arc::new(DocumentStore {
            db: Arc::new(db),
            write_tx,
            index_tx,
            catalog: RwLock::new(Vec::new()),
            committed_seq: AtomicU64::new(0),
            indexed_seq: AtomicU64::new(0),
            rebuilds_pending: AtomicU64::new(0),
            clock,
        });

        let writer = store.clone();
        tokio::spawn(async move {
            while let Some(job) = write_rx.recv().await {
                match writer.apply_batch(job.batch) {
                    Ok((seq, docs)) => {
                        let notify = writer.index_tx.send(IndexJob::DocsChanged { seq, docs });
                        if notify.await.is_err() {
                            warn!(seq, "indexer queue dropped");
                        }
                        let _ = job.respond_to.send(Ok(seq));
                    }
                    Err(e) => {
                        let _ = job.respond_to.send(Err(e));
                    }
                }
            }
        });

        let indexer = store.clone();
        tokio::spawn(async move {
            while let Some(job) = index_rx.recv().await {
                if let Err(e) = indexer.handle_index_job(job) {
                    warn!(error = %e, "indexing job failed");
                }
            }
        });

        Ok(store)
    }

    pub fn open_session(self: &Arc<Self>) -> DocumentSession {
        DocumentSession::new(self.clone())
    }

    pub fn get_clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    // ----------- Write path --------------

    /// Enqueue a batch on the writer task and wait for the commit.
    /// Returns the committed sequence number.
    pub async fn write_batch(&self, batch: WriteBatch) -> Result<u64, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(WriteJob {
                batch,
                respond_to: tx,
            })
            .await
            .map_err(|e| StorageError::Other(format!("Write queue dropped: {}", e)))?;
        rx.await
            .map_err(|e| StorageError::Other(format!("Write task dropped: {}", e)))?
    }

    fn apply_batch(&self, batch: WriteBatch) -> Result<(u64, Vec<(String, String)>), StorageError> {
        let now = self.clock.now();
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let mut changed: Vec<(String, String)> = Vec::new();
        let ops = batch.len();
        {
            let mut docs_t = txn
                .open_table(tables::DOCS)
                .map_err(|e| StorageError::Other(e.to_string()))?;
            let mut meta_t = txn
                .open_table(tables::DOC_META)
                .map_err(|e| StorageError::Other(e.to_string()))?;
            let mut counters_t = txn
                .open_table(tables::COUNTERS)
                .map_err(|e| StorageError::Other(e.to_string()))?;

            for req in &batch {
                match req {
                    WriteRequest::PutDocument {
                        id,
                        collection,
                        body,
                    } => {
                        let key = id.as_bytes();
                        let old_meta = {
                            let got = meta_t
                                .get(key)
                                .map_err(|e| StorageError::Other(e.to_string()))?;
                            match got {
                                Some(raw) => Some(decode_meta(&raw.value())?),
                                None => None,
                            }
                        };
                        let meta = match old_meta {
                            Some(old) => DocMeta {
                                version: old.version + 1,
                                created_at: old.created_at,
                                updated_at: now,
                                deleted_at: None,
                                collection: collection.clone(),
                            },
                            None => DocMeta {
                                version: 0,
                                created_at: now,
                                updated_at: now,
                                deleted_at: None,
                                collection: collection.clone(),
                            },
                        };
                        docs_t
                            .insert(key, body.clone())
                            .map_err(|e| StorageError::Other(e.to_string()))?;
                        meta_t
                            .insert(key, encode_meta(&meta)?)
                            .map_err(|e| StorageError::Other(e.to_string()))?;
                        changed.push((id.clone(), collection.clone()));
                    }
                    WriteRequest::DeleteDocument { id } => {
                        let key = id.as_bytes();
                        let mut meta = {
                            let raw = meta_t
                                .get(key)
                                .map_err(|e| StorageError::Other(e.to_string()))?
                                .ok_or(StorageError::NotFound)?;
                            decode_meta(&raw.value())?
                        };
                        meta.deleted_at = Some(now);
                        meta.updated_at = now;
                        docs_t
                            .remove(key)
                            .map_err(|e| StorageError::Other(e.to_string()))?;
                        // The meta row stays behind as a tombstone.
                        let collection = meta.collection.clone();
                        meta_t
                            .insert(key, encode_meta(&meta)?)
                            .map_err(|e| StorageError::Other(e.to_string()))?;
                        changed.push((id.clone(), collection));
                    }
                    WriteRequest::IncrementCounter {
                        doc_id,
                        name,
                        delta,
                    } => {
                        let key = tables::counter_key(doc_id, name);
                        let current = {
                            let got = counters_t
                                .get(key.as_slice())
                                .map_err(|e| StorageError::Other(e.to_string()))?;
                            match got {
                                Some(raw) => decode_counter(&raw.value())?,
                                None => 0,
                            }
                        };
                        counters_t
                            .insert(key.as_slice(), (current + delta).to_be_bytes().to_vec())
                            .map_err(|e| StorageError::Other(e.to_string()))?;
                    }
                }
            }
        }
        txn.commit()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let seq = self.committed_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(seq, ops, "batch committed");
        Ok((seq, changed))
    }

    // ----------- Read path --------------

    pub async fn get_document(&self, id: &str) -> Result<Option<(Value, DocMeta)>, StorageError> {
        self.read_document(id)
    }

    pub async fn get_counter(
        &self,
        doc_id: &str,
        name: &str,
    ) -> Result<Option<i64>, StorageError> {
        self.read_counter(doc_id, name)
    }

    /// All counters of one document, by name.
    pub async fn counters_of(&self, doc_id: &str) -> Result<Vec<(String, i64)>, StorageError> {
        self.read_counters_of(doc_id)
    }

    /// Index entries, optionally filtered by equality on one projected field.
    pub async fn query_index(
        &self,
        index: &str,
        filter: Option<(&str, &Value)>,
    ) -> Result<Vec<Value>, StorageError> {
        self.read_index_entries(index, filter)
    }

    pub(crate) fn read_document(
        &self,
        id: &str,
    ) -> Result<Option<(Value, DocMeta)>, StorageError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let docs_t = txn
            .open_table(tables::DOCS)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let Some(raw) = docs_t
            .get(id.as_bytes())
            .map_err(|e| StorageError::Other(e.to_string()))?
        else {
            return Ok(None);
        };
        let body: Value = serde_json::from_slice(&raw.value())?;
        let meta_t = txn
            .open_table(tables::DOC_META)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let meta_raw = meta_t
            .get(id.as_bytes())
            .map_err(|e| StorageError::Other(e.to_string()))?
            .ok_or(StorageError::NotFound)?;
        let meta = decode_meta(&meta_raw.value())?;
        Ok(Some((body, meta)))
    }

    pub(crate) fn read_counter(
        &self,
        doc_id: &str,
        name: &str,
    ) -> Result<Option<i64>, StorageError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let counters_t = txn
            .open_table(tables::COUNTERS)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let key = tables::counter_key(doc_id, name);
        let got = counters_t
            .get(key.as_slice())
            .map_err(|e| StorageError::Other(e.to_string()))?;
        match got {
            Some(raw) => Ok(Some(decode_counter(&raw.value())?)),
            None => Ok(None),
        }
    }

    pub(crate) fn read_counters_of(
        &self,
        doc_id: &str,
    ) -> Result<Vec<(String, i64)>, StorageError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let counters_t = txn
            .open_table(tables::COUNTERS)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let prefix = tables::counter_prefix(doc_id);
        let hi = tables::prefix_upper_bound(&prefix);
        let mut out = Vec::new();
        for row in counters_t
            .range(prefix.as_slice()..hi.as_slice())
            .map_err(|e| StorageError::Other(e.to_string()))?
        {
            let (k, v) = row.map_err(|e| StorageError::Other(e.to_string()))?;
            let name = String::from_utf8_lossy(&k.value()[prefix.len()..]).into_owned();
            out.push((name, decode_counter(&v.value())?));
        }
        Ok(out)
    }

    pub(crate) fn read_index_entries(
        &self,
        index: &str,
        filter: Option<(&str, &Value)>,
    ) -> Result<Vec<Value>, StorageError> {
        {
            let cat = self
                .catalog
                .read()
                .map_err(|_| StorageError::Other("index catalog lock poisoned".into()))?;
            if !cat.iter().any(|r| r.name == index) {
                return Err(StorageError::IndexNotFound(index.to_string()));
            }
        }
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let entries_t = txn
            .open_table(tables::INDEX_ENTRIES)
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut out = Vec::new();
        match filter {
            Some((field, value)) => {
                let terms_t = txn
                    .open_table(tables::INDEX_TERMS)
                    .map_err(|e| StorageError::Other(e.to_string()))?;
                let prefix = tables::term_prefix(index, field, &tables::term_text(value));
                let hi = tables::prefix_upper_bound(&prefix);
                for row in terms_t
                    .range(prefix.as_slice()..hi.as_slice())
                    .map_err(|e| StorageError::Other(e.to_string()))?
                {
                    let (_, doc_id) = row.map_err(|e| StorageError::Other(e.to_string()))?;
                    let doc_id = String::from_utf8_lossy(&doc_id.value()).into_owned();
                    let key = tables::entry_key(index, &doc_id);
                    if let Some(raw) = entries_t
                        .get(key.as_slice())
                        .map_err(|e| StorageError::Other(e.to_string()))?
                    {
                        out.push(serde_json::from_slice(&raw.value())?);
                    }
                }
            }
            None => {
                let prefix = tables::entry_prefix(index);
                let hi = tables::prefix_upper_bound(&prefix);
                for row in entries_t
                    .range(prefix.as_slice()..hi.as_slice())
                    .map_err(|e| StorageError::Other(e.to_string()))?
                {
                    let (_, v) = row.map_err(|e| StorageError::Other(e.to_string()))?;
                    out.push(serde_json::from_slice(&v.value())?);
                }
            }
        }
        debug!(index, results = out.len(), "index queried");
        Ok(out)
    }

    // ----------- Indexing --------------

    /// Register a map index and kick off a background rebuild. Returns
    /// without waiting; pair with [`wait_for_indexing`](Self::wait_for_indexing).
    pub async fn execute_index<I: IndexDefinition>(&self) -> Result<(), StorageError> {
        let reg = RegisteredIndex::of::<I>();
        {
            let mut cat = self
                .catalog
                .write()
                .map_err(|_| StorageError::Other("index catalog lock poisoned".into()))?;
            cat.retain(|r| r.name != reg.name);
            cat.push(reg);
        }
        self.rebuilds_pending.fetch_add(1, Ordering::SeqCst);
        self.index_tx
            .send(IndexJob::Rebuild { name: reg.name })
            .await
            .map_err(|e| StorageError::Other(format!("Indexer queue dropped: {}", e)))?;
        Ok(())
    }

    /// Block until every committed batch is reflected in the index tables and
    /// no rebuild is pending.
    pub async fn wait_for_indexing(&self, timeout: Duration) -> Result<(), StorageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let caught_up = self.rebuilds_pending.load(Ordering::SeqCst) == 0
                && self.indexed_seq.load(Ordering::SeqCst)
                    >= self.committed_seq.load(Ordering::SeqCst);
            if caught_up {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StorageError::IndexingTimeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn handle_index_job(&self, job: IndexJob) -> Result<(), StorageError> {
        match job {
            IndexJob::DocsChanged { seq, docs } => {
                let result = if docs.is_empty() {
                    Ok(())
                } else {
                    self.apply_doc_changes(&docs)
                };
                // Counter-only batches still move the watermark.
                self.indexed_seq.fetch_max(seq, Ordering::SeqCst);
                result
            }
            IndexJob::Rebuild { name } => {
                let reg = {
                    let cat = self
                        .catalog
                        .read()
                        .map_err(|_| StorageError::Other("index catalog lock poisoned".into()))?;
                    cat.iter().find(|r| r.name == name).copied()
                };
                let result = match reg {
                    Some(reg) => self.rebuild_index(&reg),
                    None => Ok(()),
                };
                self.rebuilds_pending.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }
    }

    fn apply_doc_changes(&self, docs: &[(String, String)]) -> Result<(), StorageError> {
        let indexes: Vec<RegisteredIndex> = {
            let cat = self
                .catalog
                .read()
                .map_err(|_| StorageError::Other("index catalog lock poisoned".into()))?;
            cat.clone()
        };
        if indexes.is_empty() {
            return Ok(());
        }
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        {
            let docs_t = txn
                .open_table(tables::DOCS)
                .map_err(|e| StorageError::Other(e.to_string()))?;
            let mut entries_t = txn
                .open_table(tables::INDEX_ENTRIES)
                .map_err(|e| StorageError::Other(e.to_string()))?;
            let mut terms_t = txn
                .open_table(tables::INDEX_TERMS)
                .map_err(|e| StorageError::Other(e.to_string()))?;

            for (id, collection) in docs {
                for reg in indexes.iter().filter(|r| r.collection == collection.as_str()) {
                    unindex_doc(&mut entries_t, &mut terms_t, reg.name, id)?;
                    let body = {
                        let got = docs_t
                            .get(id.as_bytes())
                            .map_err(|e| StorageError::Other(e.to_string()))?;
                        match got {
                            Some(raw) => Some(serde_json::from_slice::<Value>(&raw.value())?),
                            None => None,
                        }
                    };
                    if let Some(body) = body {
                        if let Some(entry) = (reg.map)(&body) {
                            index_doc(&mut entries_t, &mut terms_t, reg.name, id, &entry)?;
                        }
                    }
                }
            }
        }
        txn.commit()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    fn rebuild_index(&self, reg: &RegisteredIndex) -> Result<(), StorageError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let mut indexed = 0usize;
        {
            let docs_t = txn
                .open_table(tables::DOCS)
                .map_err(|e| StorageError::Other(e.to_string()))?;
            let meta_t = txn
                .open_table(tables::DOC_META)
                .map_err(|e| StorageError::Other(e.to_string()))?;
            let mut entries_t = txn
                .open_table(tables::INDEX_ENTRIES)
                .map_err(|e| StorageError::Other(e.to_string()))?;
            let mut terms_t = txn
                .open_table(tables::INDEX_TERMS)
                .map_err(|e| StorageError::Other(e.to_string()))?;

            // Drop whatever a previous registration left behind.
            clear_prefix(&mut entries_t, &tables::entry_prefix(reg.name))?;
            clear_prefix(&mut terms_t, &tables::term_index_prefix(reg.name))?;

            let mut mapped: Vec<(String, Value)> = Vec::new();
            for row in docs_t
                .iter()
                .map_err(|e| StorageError::Other(e.to_string()))?
            {
                let (k, v) = row.map_err(|e| StorageError::Other(e.to_string()))?;
                let id = String::from_utf8_lossy(k.value()).into_owned();
                let collection = {
                    let raw = meta_t
                        .get(k.value())
                        .map_err(|e| StorageError::Other(e.to_string()))?
                        .ok_or(StorageError::NotFound)?;
                    decode_meta(&raw.value())?.collection
                };
                if collection != reg.collection {
                    continue;
                }
                let body: Value = serde_json::from_slice(&v.value())?;
                if let Some(entry) = (reg.map)(&body) {
                    mapped.push((id, entry));
                }
            }
            for (id, entry) in &mapped {
                index_doc(&mut entries_t, &mut terms_t, reg.name, id, entry)?;
                indexed += 1;
            }
        }
        txn.commit()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        debug!(index = reg.name, entries = indexed, "index rebuilt");
        Ok(())
    }
}

type WriteTable<'t> = redb::Table<'t, &'static [u8], Vec<u8>>;

fn clear_prefix(table: &mut WriteTable<'_>, prefix: &[u8]) -> Result<(), StorageError> {
    let hi = tables::prefix_upper_bound(prefix);
    let keys: Vec<Vec<u8>> = {
        let mut keys = Vec::new();
        for row in table
            .range(prefix..hi.as_slice())
            .map_err(|e| StorageError::Other(e.to_string()))?
        {
            let (k, _) = row.map_err(|e| StorageError::Other(e.to_string()))?;
            keys.push(k.value().to_vec());
        }
        keys
    };
    for key in keys {
        table
            .remove(key.as_slice())
            .map_err(|e| StorageError::Other(e.to_string()))?;
    }
    Ok(())
}

fn unindex_doc(
    entries_t: &mut WriteTable<'_>,
    terms_t: &mut WriteTable<'_>,
    index: &str,
    doc_id: &str,
) -> Result<(), StorageError> {
    let entry_key = tables::entry_key(index, doc_id);
    let old_entry = {
        let got = entries_t
            .get(entry_key.as_slice())
            .map_err(|e| StorageError::Other(e.to_string()))?;
        match got {
            Some(raw) => Some(serde_json::from_slice::<Value>(&raw.value())?),
            None => None,
        }
    };
    let Some(old_entry) = old_entry else {
        return Ok(());
    };
    if let Some(fields) = old_entry.as_object() {
        for (field, value) in fields {
            let key = tables::term_key(index, field, &tables::term_text(value), doc_id);
            terms_t
                .remove(key.as_slice())
                .map_err(|e| StorageError::Other(e.to_string()))?;
        }
    }
    entries_t
        .remove(entry_key.as_slice())
        .map_err(|e| StorageError::Other(e.to_string()))?;
    Ok(())
}

fn index_doc(
    entries_t: &mut WriteTable<'_>,
    terms_t: &mut WriteTable<'_>,
    index: &str,
    doc_id: &str,
    entry: &Value,
) -> Result<(), StorageError> {
    entries_t
        .insert(
            tables::entry_key(index, doc_id).as_slice(),
            serde_json::to_vec(entry)?,
        )
        .map_err(|e| StorageError::Other(e.to_string()))?;
    if let Some(fields) = entry.as_object() {
        for (field, value) in fields {
            let key = tables::term_key(index, field, &tables::term_text(value), doc_id);
            terms_t
                .insert(key.as_slice(), doc_id.as_bytes().to_vec())
                .map_err(|e| StorageError::Other(e.to_string()))?;
        }
    }
    Ok(())
}

fn encode_meta(meta: &DocMeta) -> Result<Vec<u8>, StorageError> {
    bincode::encode_to_vec(meta, bincode::config::standard())
        .map_err(|e| StorageError::Bincode(e.to_string()))
}

fn decode_meta(raw: &[u8]) -> Result<DocMeta, StorageError> {
    bincode::decode_from_slice::<DocMeta, _>(raw, bincode::config::standard())
        .map(|(meta, _)| meta)
        .map_err(|e| StorageError::Bincode(e.to_string()))
}

fn decode_counter(raw: &[u8]) -> Result<i64, StorageError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StorageError::Other("malformed counter value".into()))?;
    Ok(i64::from_be_bytes(bytes))
}
