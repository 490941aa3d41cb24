//! Vigil Storage Service
//!
//! Detection event store for the Vigil frame pipeline. Processed frames are
//! persisted as [`DetectionEvent`] documents in a time-indexed store and read
//! back through the [`StatisticsEngine`] for per-class statistics, time-window
//! views, export and retention purges.
//!
//! ## Backends
//!
//! - **PostgreSQL** (`postgres://...`): one row per event, nested parts as
//!   JSONB, class statistics computed in SQL
//! - **In-memory** (`memory://`): BTreeMap indexes behind a single lock,
//!   class statistics computed by a streaming reducer
//!
//! ## Architecture
//!
//! ```text
//! vigil-ingest pipelines          Event Store               Readers
//! ┌──────────────┐           ┌──────────────────┐      ┌──────────────┐
//! │ Persistence  │──────────▶│ detection_events │◀─────│ Statistics   │
//! │ Queue        │  persist  │  timestamp desc  │      │ Engine       │
//! └──────────────┘           │  source_id       │      └──────────────┘
//!                            │  frame_number    │         │        │
//!                            │  (source, time)  │         ▼        ▼
//!                            └──────────────────┘   ┌────────┐ ┌─────────────┐
//!                                                   │ Admin  │ │ vigil-query │
//!                                                   │ API    │ │ CLI         │
//!                                                   └────────┘ └─────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod export;
pub mod report;
pub mod statistics;
pub mod store;

pub use api::AppState;
pub use config::{Config, DatabaseConfig};
pub use error::StoreError;
pub use event::{
    BoundingBox, ClassCountSnapshot, Detection, DetectionEvent, EventId, ModelInfo, StoredEvent,
};
pub use export::{write_export, ExportFormat};
pub use statistics::{
    ClassStatistics, PurgeConfirmation, PurgeReport, StatisticsEngine, WindowReport,
};
pub use store::{open_store, CollectionStats, EventStore, MemoryEventStore, PgEventStore};
