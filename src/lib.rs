//! Bookvault
//!
//! Binary-content subsystem for book artifacts: resumable, integrity-checked
//! chunked uploads and a byte-range content server.
//!
//! # Modules
//!
//! - `upload`: session registry, chunk staging, assembly and expiry reaper
//! - `content`: range-addressable retrieval of persisted objects
//! - `storage`: object store boundary (local filesystem, S3-compatible)
//! - `routes`: axum HTTP surface

pub mod cache;
pub mod clock;
pub mod config;
pub mod content;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;

pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
