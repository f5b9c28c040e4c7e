//! Chunked Upload Module
//!
//! Resumable, integrity-checked uploads of large files:
//! - Sessions are initiated with a declared size and optional whole-file digest
//! - Chunks are uploaded individually, verified, staged and recorded
//! - An explicit completion assembles the chunks into a content-addressed object
//! - Abandoned sessions are reclaimed by a background reaper
//! - Sessions are journaled to the object store and restored on startup

mod assembly;
mod chunk_store;
mod integrity;
mod journal;
mod reaper;
mod service;
mod session;
mod types;

pub use assembly::AssemblyPipeline;
pub use chunk_store::ChunkStore;
pub use integrity::{compute_hash, normalize_hash, verify, ObjectHasher};
pub use journal::{JournalEntry, SessionJournal, SessionRecord, Tombstone, JOURNAL_PREFIX};
pub use reaper::{SessionReaper, SweepReport};
pub use service::UploadService;
pub use session::{SessionRegistry, SessionState};
pub use types::*;
