//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → shared via Arc to the proxy, sessions and dispatchers
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    CaConfig, CacheConfig, DnsConfig, DnsOverTlsConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, PoolConfig, ProxyConfig, SessionConfig, TimeoutConfig, UpstreamConfig,
};
