use bincode::{Decode, Encode};

/// Per-document bookkeeping row, kept next to the body under the same key.
/// Survives as a tombstone after the body row is deleted.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct DocMetaV0 {
    pub version: u32,
    pub created_at: u64,
    pub updated_at: u64,
    pub deleted_at: Option<u64>,
    pub collection: String,
}

pub type DocMeta = DocMetaV0;
