//! The remote object store boundary, upstream of the chunk cache. Kept small
//! and opaque: the remote wire protocol itself is out of scope, so callers
//! only ever see `RemoteFileHandle` and the `RemoteClient` trait.

pub(crate) mod client;
pub mod chunk_cache;

pub use chunk_cache::ChunkCache;
pub use client::{HttpRemoteClient, RateGate, RemoteClient};

pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Opaque descriptor returned by the remote store client. The `location`
/// token is whatever the client needs to issue further range reads; callers
/// above the chunk cache never interpret it.
#[derive(Debug, Clone)]
pub struct RemoteFileHandle {
    pub id: i64,
    pub size: u64,
    pub file_name: String,
    pub mime_type: String,
    pub location: String,
}

/// (file id, aligned offset, requested limit) — uniqueness boundary for the
/// in-flight map and the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkCacheKey {
    pub file_id: i64,
    pub aligned_offset: u64,
    pub limit: u32,
}
