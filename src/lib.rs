pub mod clock;
pub mod document;
pub mod index;
pub mod meta;
pub mod query;
pub mod rql;
pub mod session;
pub mod storage_error;
pub mod store;
pub mod tables;
pub mod test_driver;

pub use store::*;

pub use redb::TableDefinition;

#[cfg(test)]
pub mod tests;
