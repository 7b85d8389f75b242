//! wcengine core library.
//!
//! This crate reconciles a working copy's baseline tree, its pending
//! structural changes and the live directory on disk into one view, and
//! mediates every mutation through a single-writer transaction that is
//! applied all at once. It also turns merge conflicts into per-item choices
//! and records their resolution.

pub mod apply;
pub mod blobstore;
pub mod commit;
pub mod config;
pub mod db;
pub mod errors;
pub mod journal;
pub mod liveview;
pub mod models;
pub mod policy;
pub mod prescan;
pub mod resolve;
pub mod status;
pub mod tx;
pub mod wc;
pub mod workdir;

// Re-exports for convenience.
pub use apply::ApplySummary;
pub use commit::CommitSummary;
pub use config::WcConfig;
pub use db::Database;
pub use errors::WcError;
pub use status::{ConflictAxis, StatusFlags, StatusOptions};
pub use tx::Transaction;
pub use wc::WorkingCopy;
