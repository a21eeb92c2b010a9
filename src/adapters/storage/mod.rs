//! On-disk persistence for runs.

pub mod file_store;

pub use file_store::FileRunStore;
