//! HTTP contracts of the source search API and the target transfer plugin.

pub mod client;
pub mod retry;
pub mod source;
pub mod target;
pub mod types;

pub use source::{HttpSourceClient, SourceApi};
pub use target::{HttpTargetClient, TargetApi};
pub use types::{
    ChunkPoll, ChunkToken, FileOutcome, FileRepresentation, FileStatusRecord, ItemType,
    RepoSummary, SearchItem, TargetAuth,
};
