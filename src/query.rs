use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::session::DocumentSession;
use crate::storage_error::StorageError;

/// Typed query against one index, built from
/// [`DocumentSession::query`](crate::session::DocumentSession::query).
pub struct IndexQuery<'a> {
    session: &'a mut DocumentSession,
    index: &'static str,
    filter: Option<(String, Value)>,
    includes: Vec<String>,
}

impl<'a> IndexQuery<'a> {
    pub(crate) fn new(session: &'a mut DocumentSession, index: &'static str) -> Self {
        Self {
            session,
            index,
            filter: None,
            includes: Vec::new(),
        }
    }

    /// Equality filter on a projected entry field. A later call replaces an
    /// earlier one.
    pub fn where_equals(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter = Some((field.to_string(), value.into()));
        self
    }

    /// Name an entry field holding a referenced document id. Matching
    /// documents and their counters are prefetched into the session cache
    /// within the same round trip.
    pub fn include(mut self, field: &str) -> Self {
        self.includes.push(field.to_string());
        self
    }

    /// Execute the query (one round trip) and materialize the entries.
    pub async fn to_list<R: DeserializeOwned>(self) -> Result<Vec<R>, StorageError> {
        self.session.bump_request()?;
        let store = self.session.store_handle();
        let filter = self
            .filter
            .as_ref()
            .map(|(field, value)| (field.as_str(), value));
        let entries = store.query_index(self.index, filter).await?;

        for field in &self.includes {
            for entry in &entries {
                let Some(id) = entry.get(field).and_then(|v| v.as_str()) else {
                    continue;
                };
                let id = id.to_string();
                self.session.ingest_include(&id).await?;
            }
        }

        entries
            .into_iter()
            .map(|entry| serde_json::from_value(entry).map_err(Into::into))
            .collect()
    }
}
