//! Document Mirror Sync
//!
//! Pulls records edited since the last cursor from each source database and
//! upserts them into a local store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    SyncOrchestrator                      │
//! │  ┌────────┐  ┌─────────────┐  ┌────────┐  ┌────────────┐ │
//! │  │ Cursor │─▶│ PageFetcher │─▶│ Mapper │─▶│ Upsert     │ │
//! │  │ (load) │  │ (paced API) │  │        │  │ Writer     │ │
//! │  └────────┘  └─────────────┘  └────────┘  └─────┬──────┘ │
//! │       ▲                                         │        │
//! │       └──────────── advance after commit ───────┘        │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod fetcher;
pub mod mapper;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod writer;

pub use fetcher::{DocumentApi, FetchPolicy, HttpDocumentApi, PageFetcher, QueryPage, QueryRequest};
pub use mapper::{map_record, map_records, MapContext};
pub use models::{EntityKind, MirroredRow, PropertyValue, RawRecord, SyncCursor};
pub use orchestrator::{
    PassOutcome, PassReport, SyncOrchestrator, SyncReport, SyncSource, SyncStats,
};
pub use progress::{ProgressTracker, SyncPhase, SyncProgress};
pub use writer::UpsertWriter;
