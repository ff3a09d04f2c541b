//! Utility modules for configuration, error handling, and persistence.

pub mod config;
pub mod errors;
pub mod store;

pub use config::*;
pub use errors::*;
pub use store::{FileStore, KeyValueStore, MemoryStore};
