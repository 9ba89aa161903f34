//! Sync Module - Offline-First Synchronization
//!
//! Ties the other subsystems together into one offline-first core:
//! - Cache-first reads with stale fallback while offline
//! - Queued writes replayed in FIFO order once connectivity returns
//! - Conflict surfacing for server-rejected replays (HTTP 409)
//! - Best-effort cache refresh for every entity collection
//!
//! Architecture:
//! - One sync pass at a time; duplicate triggers are dropped
//! - Terminal failures (conflicts, exhausted retries) leave the queue
//! - Transient failures keep their place and burn one retry per pass

pub mod manager;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use manager::{
    SubmitOutcome, SyncConflict, SyncError, SyncManager, SyncResult, LAST_SYNC_KEY,
};
