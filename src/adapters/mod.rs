//! Adapters implementing the domain ports.

pub mod scoring;
pub mod sim;
pub mod storage;
