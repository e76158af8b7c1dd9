pub mod fixtures;

mod include_counters_test;
mod index_test;
