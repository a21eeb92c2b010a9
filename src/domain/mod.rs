//! Domain layer for the stackbot control loop
//!
//! This module contains the core models and the port traits that the
//! application layer drives.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult, RunError};
