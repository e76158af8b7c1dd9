use serde::de::DeserializeOwned;
use serde_json::Value;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::document::Document;
use crate::index::IndexDefinition;
use crate::query::IndexQuery;
use crate::rql::{self, RawQueryResult};
use crate::storage_error::StorageError;
use crate::store::{DocumentStore, WriteBatch, WriteRequest};

pub const DEFAULT_MAX_REQUESTS: usize = 30;

/// Unit of work over a [`DocumentStore`]. Mutations queue locally until
/// [`save_changes`](Self::save_changes); reads are served from the session
/// cache where possible, each cache miss costing one request against the
/// session budget.
pub struct DocumentSession {
    store: Arc<DocumentStore>,
    max_requests: usize,
    requests: usize,
    pending: WriteBatch,
    documents: HashMap<String, Value>,
    // Ids deleted through this session; loads answer None from here without
    // a round trip.
    deleted: HashSet<String>,
    counters: HashMap<String, HashMap<String, i64>>,
    // Documents whose complete counter set is cached (via an include), so a
    // miss by name means the counter does not exist.
    counters_complete: HashSet<String>,
}

impl DocumentSession {
    pub(crate) fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            max_requests: DEFAULT_MAX_REQUESTS,
            requests: 0,
            pending: Vec::new(),
            documents: HashMap::new(),
            deleted: HashSet::new(),
            counters: HashMap::new(),
            counters_complete: HashSet::new(),
        }
    }

    /// Cap the number of server round trips this session may make.
    pub fn set_max_requests_per_session(&mut self, max: usize) {
        self.max_requests = max;
    }

    pub fn requests_made(&self) -> usize {
        self.requests
    }

    pub fn store_entity<T: Document>(&mut self, entity: &T) -> Result<(), StorageError> {
        let body = serde_json::to_value(entity)?;
        let id = entity.id().to_string();
        self.deleted.remove(&id);
        self.documents.insert(id.clone(), body.clone());
        self.pending.push(WriteRequest::PutDocument {
            id,
            collection: T::COLLECTION.to_string(),
            body: serde_json::to_vec(&body)?,
        });
        Ok(())
    }

    pub fn delete(&mut self, id: &str) {
        self.documents.remove(id);
        self.deleted.insert(id.to_string());
        self.pending
            .push(WriteRequest::DeleteDocument { id: id.to_string() });
    }

    /// Commit all queued mutations as one batch. One round trip; a no-op when
    /// nothing is pending.
    pub async fn save_changes(&mut self) -> Result<(), StorageError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.bump_request()?;
        let batch = std::mem::take(&mut self.pending);
        self.store.write_batch(batch).await?;
        Ok(())
    }

    pub async fn load<T: Document>(&mut self, id: &str) -> Result<Option<T>, StorageError> {
        if self.deleted.contains(id) {
            return Ok(None);
        }
        if let Some(body) = self.documents.get(id) {
            return Ok(Some(serde_json::from_value(body.clone())?));
        }
        self.bump_request()?;
        match self.store.get_document(id).await? {
            Some((body, _meta)) => {
                self.documents.insert(id.to_string(), body.clone());
                Ok(Some(serde_json::from_value(body)?))
            }
            None => Ok(None),
        }
    }

    pub fn counters_for(&mut self, doc_id: &str) -> SessionCounters<'_> {
        SessionCounters {
            session: self,
            doc_id: doc_id.to_string(),
        }
    }

    pub fn query<I: IndexDefinition>(&mut self) -> IndexQuery<'_> {
        IndexQuery::new(self, I::NAME)
    }

    /// Execute a raw query (see [`crate::rql`] for the supported grammar).
    pub async fn raw_query<R: DeserializeOwned>(
        &mut self,
        text: &str,
    ) -> Result<RawQueryResult<R>, StorageError> {
        rql::execute(self, text).await
    }

    pub(crate) fn store_handle(&self) -> Arc<DocumentStore> {
        self.store.clone()
    }

    pub(crate) fn bump_request(&mut self) -> Result<(), StorageError> {
        if self.requests >= self.max_requests {
            return Err(StorageError::TooManyRequests {
                max: self.max_requests,
            });
        }
        self.requests += 1;
        Ok(())
    }

    /// Pull an included document and its full counter set into the session
    /// cache. Runs inside the round trip that asked for the include, so it
    /// never touches the request budget.
    pub(crate) async fn ingest_include(&mut self, id: &str) -> Result<(), StorageError> {
        if !self.documents.contains_key(id) {
            if let Some((body, _meta)) = self.store.get_document(id).await? {
                self.documents.insert(id.to_string(), body);
            }
        }
        if !self.counters_complete.contains(id) {
            let all = self.store.counters_of(id).await?;
            let cached = self.counters.entry(id.to_string()).or_default();
            for (name, value) in all {
                cached.insert(name, value);
            }
            self.counters_complete.insert(id.to_string());
        }
        Ok(())
    }

    fn cached_counter(&self, doc_id: &str, name: &str) -> Option<Option<i64>> {
        if let Some(by_name) = self.counters.get(doc_id) {
            if let Some(v) = by_name.get(name) {
                return Some(Some(*v));
            }
        }
        if self.counters_complete.contains(doc_id) {
            return Some(None);
        }
        None
    }
}

/// Counter accessor scoped to one document, in the style of `counters_for`.
pub struct SessionCounters<'a> {
    session: &'a mut DocumentSession,
    doc_id: String,
}

impl SessionCounters<'_> {
    /// Queue an increment; applied on `save_changes`.
    pub fn increment(&mut self, name: &str, delta: i64) {
        self.session.pending.push(WriteRequest::IncrementCounter {
            doc_id: self.doc_id.clone(),
            name: name.to_string(),
            delta,
        });
    }

    /// Read a counter value. Served from the session cache when the counter
    /// was included alongside a query or read before; otherwise one round
    /// trip.
    pub async fn get(&mut self, name: &str) -> Result<Option<i64>, StorageError> {
        if let Some(cached) = self.session.cached_counter(&self.doc_id, name) {
            return Ok(cached);
        }
        self.session.bump_request()?;
        let got = self.session.store.get_counter(&self.doc_id, name).await?;
        if let Some(value) = got {
            self.session
                .counters
                .entry(self.doc_id.clone())
                .or_default()
                .insert(name.to_string(), value);
        }
        Ok(got)
    }
}
