//! # maskweb-store
//!
//! Durable client-side storage backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle wrapping a
//! `rusqlite::Connection`, a namespaced key-value table used to persist the
//! server registry, and the media cache.

pub mod database;
pub mod kv;
pub mod media_cache;
pub mod migrations;
pub mod models;
pub mod servers;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use media_cache::{cache_key, CacheStats, MediaCache};
pub use models::*;
