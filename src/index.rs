use serde_json::Value;

/// A map index over one collection. `map` projects a document body into the
/// stored index entry (a flat JSON object); returning `None` skips the
/// document.
pub trait IndexDefinition: Send + Sync + 'static {
    const NAME: &'static str;
    const COLLECTION: &'static str;

    fn map(doc: &Value) -> Option<Value>;
}

/// Type-erased catalog row for a registered index.
#[derive(Clone, Copy)]
pub(crate) struct RegisteredIndex {
    pub name: &'static str,
    pub collection: &'static str,
    pub map: fn(&Value) -> Option<Value>,
}

impl RegisteredIndex {
    pub fn of<I: IndexDefinition>() -> Self {
        Self {
            name: I::NAME,
            collection: I::COLLECTION,
            map: I::map,
        }
    }
}

/// Work items for the background indexer task.
pub(crate) enum IndexJob {
    /// A batch committed at `seq`; re-map the listed `(doc_id, collection)`
    /// pairs against every matching index.
    DocsChanged {
        seq: u64,
        docs: Vec<(String, String)>,
    },
    /// Full rescan of one index after registration.
    Rebuild { name: &'static str },
}
