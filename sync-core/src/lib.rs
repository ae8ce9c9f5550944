//! Core library for the media sync daemon: state store, source/sink
//! adapters, the media downloader, the retry helper, and the sync engine
//! and scheduler that wire them together.

pub mod downloader;
pub mod engine;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod state;

pub use engine::{AccountSummary, EngineConfig, RunSummary, SyncEngine};
pub use error::{DownloadError, EngineError, SinkError, SourceError, StateError};
pub use scheduler::Scheduler;
pub use state::StateStore;
