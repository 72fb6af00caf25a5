//! Client for an imagery catalog API and an incremental scene sync engine.
//!
//! Requests go through a [`Dispatcher`], a bounded pool of workers that hands
//! back [`Response`] handles immediately. Listings are walked lazily with a
//! [`PagedResultSet`], and [`SyncEngine`] mirrors query results into a local
//! directory, resuming from the watermark in `sync.json`.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod paging;
pub mod sync;
pub mod util;

pub use client::{Client, CompletionHook, SceneCatalog, SceneQuery};
pub use dispatch::{Body, Dispatcher, PendingResult, Response};
pub use error::{ApiError, ConfigurationError, Error, Result, TransportError};
pub use models::{ApiKey, BodyKind, Filters, Page, Payload, Request, Scene};
pub use paging::PagedResultSet;
pub use sync::{SyncEngine, SyncOptions, SyncPhase, SyncState, SyncSummary};
