//! Domain Port Interfaces
//!
//! Boundary contracts between the domain and the storage engines.
//! Backends implement [`CacheBackend`]; frontends consume it and nothing
//! else.

/// The storage backend port
pub mod backend;

pub use backend::{CacheBackend, EntryStream};
