use redb::TableDefinition;
use serde_json::Value;

/// Document bodies, keyed by the document id string.
pub static DOCS: TableDefinition<'static, &'static [u8], Vec<u8>> = TableDefinition::new("docs");

/// Per-document metadata (bincode `DocMeta`), same key as `DOCS`.
pub static DOC_META: TableDefinition<'static, &'static [u8], Vec<u8>> =
    TableDefinition::new("docs_meta");

/// Counter values, keyed `doc_id \0 counter_name`.
pub static COUNTERS: TableDefinition<'static, &'static [u8], Vec<u8>> =
    TableDefinition::new("counters");

/// Index entries, keyed `index_name \0 doc_id`, value is the entry JSON.
pub static INDEX_ENTRIES: TableDefinition<'static, &'static [u8], Vec<u8>> =
    TableDefinition::new("index_entries");

/// Equality lookup rows, keyed `index_name \0 field \0 term \0 doc_id`,
/// value is the doc id.
pub static INDEX_TERMS: TableDefinition<'static, &'static [u8], Vec<u8>> =
    TableDefinition::new("index_terms");

// Key separator. Document ids, index names and field names must not contain NUL.
const SEP: u8 = 0;

fn join(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len()).sum::<usize>() + parts.len().saturating_sub(1);
    let mut buf = Vec::with_capacity(len);
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            buf.push(SEP);
        }
        buf.extend_from_slice(p);
    }
    buf
}

pub fn counter_key(doc_id: &str, name: &str) -> Vec<u8> {
    join(&[doc_id.as_bytes(), name.as_bytes()])
}

/// Prefix covering every counter of one document.
pub fn counter_prefix(doc_id: &str) -> Vec<u8> {
    let mut buf = doc_id.as_bytes().to_vec();
    buf.push(SEP);
    buf
}

pub fn entry_key(index: &str, doc_id: &str) -> Vec<u8> {
    join(&[index.as_bytes(), doc_id.as_bytes()])
}

pub fn entry_prefix(index: &str) -> Vec<u8> {
    let mut buf = index.as_bytes().to_vec();
    buf.push(SEP);
    buf
}

// Term text comes from arbitrary projected JSON values, so unlike ids and
// field names it may contain NUL. Escape it before joining: 0x00 -> 0x01 0x01
// and 0x01 -> 0x01 0x02, which is injective and never emits SEP.
fn escape_term(term: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(term.len());
    for &b in term.as_bytes() {
        match b {
            0x00 => out.extend_from_slice(&[0x01, 0x01]),
            0x01 => out.extend_from_slice(&[0x01, 0x02]),
            other => out.push(other),
        }
    }
    out
}

pub fn term_key(index: &str, field: &str, term: &str, doc_id: &str) -> Vec<u8> {
    join(&[
        index.as_bytes(),
        field.as_bytes(),
        &escape_term(term),
        doc_id.as_bytes(),
    ])
}

/// Prefix covering every doc id posted under `(index, field, term)`.
pub fn term_prefix(index: &str, field: &str, term: &str) -> Vec<u8> {
    let mut buf = join(&[index.as_bytes(), field.as_bytes(), &escape_term(term)]);
    buf.push(SEP);
    buf
}

/// Prefix covering every term row of one index.
pub fn term_index_prefix(index: &str) -> Vec<u8> {
    let mut buf = index.as_bytes().to_vec();
    buf.push(SEP);
    buf
}

/// Exclusive upper bound for a prefix range scan. Valid because keys only
/// continue a prefix with SEP (0x00) or id/term bytes, never 0xFF.
pub fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut buf = prefix.to_vec();
    buf.push(0xFF);
    buf
}

/// Canonical text form of a projected value used as an index term.
pub fn term_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
