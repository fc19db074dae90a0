//! Phased, resumable migration of binary repositories between services.
//!
//! The engine copies every file of a source repository onto an empty target
//! repository while the source stays writable. Per repository it runs three
//! phases in order: a full sweep of the tree, a diff pass over files modified
//! since the sweep started, and a retry pass over failures recorded by earlier
//! runs. Progress is persisted after every phase so an interrupted run resumes
//! without repeating completed work.
//!
//! The crate is a library: command-line parsing, progress rendering and log
//! routing belong to the caller, which drives [`runner::TransferRunner`] and
//! subscribes to [`events::TransferEvent`].

pub mod api;
pub mod chunk;
pub mod config;
pub mod delay;
pub mod error;
pub mod events;
pub mod manifest;
pub mod phases;
pub mod pipeline;
pub mod runner;
pub mod state;
pub mod status;
pub mod utils;

pub use config::{ServerDetails, TransferConfig};
pub use error::{Result, TransferError};
pub use runner::{TransferRunner, TransferSummary};

/// Number of file references delivered to the target plugin in one call.
pub const UPLOAD_CHUNK_SIZE: usize = 16;

/// Page limit for source search queries.
pub const SEARCH_PAGE_LIMIT: usize = 10_000;

/// Width of a single diff search window, in minutes.
pub const DIFF_WINDOW_MINUTES: i64 = 15;

/// Name of the server-side plugin the target must have installed.
pub const TARGET_PLUGIN_NAME: &str = "repoTransfer";
