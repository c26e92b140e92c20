//! # tagcache-infrastructure
//!
//! Cross-cutting concerns for the tagcache workspace:
//!
//! - [`config`] - configuration types and the Figment-based loader
//!   (defaults, TOML file, `TAGCACHE_*` environment variables)
//! - [`logging`] - tracing-subscriber bootstrap
//! - [`factory`] - construction of bound backends from configuration
//! - [`typed`] - the serde_json frontend wrapper over any backend

/// Configuration types and loader
pub mod config;
/// Backend construction from configuration
pub mod factory;
/// Structured logging bootstrap
pub mod logging;
/// Typed frontend wrapper
pub mod typed;

// Re-export commonly used types for convenience
pub use config::{AppConfig, BackendKind, CacheConfig, ConfigLoader, LoggingConfig};
pub use factory::BackendFactory;
pub use typed::TypedCache;
