//! tablecache Core - Shared Types
//!
//! Identity, error and configuration types used by the object cache and its
//! storage collaborators. This crate contains no caching logic.

pub mod config;
pub mod error;
pub mod identity;

pub use config::{validate_keep_quota, CacheConfig, EvictionStrategy};
pub use error::{CacheError, CacheResult, ConfigError, IndexError, StorageError};
pub use identity::{
    ConnectionId, ObjectId, ScopeKey, Serial, SerialChange, Session, TypeDescriptor,
};
