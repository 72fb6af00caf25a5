//! Incremental scene synchronization
//!
//! Mirrors every scene matching an area of interest into a local directory.
//! Progress across runs is a single watermark, the acquisition time of the
//! newest scene synced so far, stored in `sync.json` next to the scenes.
//!
//! A run goes through [`SyncEngine::init`], which validates the destination
//! and issues the scene query, then [`SyncEngine::sync`], which downloads the
//! results batch by batch (one batch per page) and advances the watermark.

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};
use tracing::{debug, error, info, instrument, warn};

use crate::client::{CompletionHook, SceneCatalog, SceneQuery};
use crate::dispatch::Response;
use crate::error::{ConfigurationError, Error, Result};
use crate::models::{ACQUIRED_AFTER, Filters, Scene};
use crate::paging::PagedResultSet;
use crate::util::{format_timestamp, parse_timestamp};

pub const SYNC_FILE: &str = "sync.json";
pub const AOI_FILE: &str = "aoi.geojson";

const PAGE_SIZE: u32 = 100;
const ORDER_BY: &str = "acquired asc";

/// Persisted state of a destination directory
///
/// Keys other than `latest` are carried through rewrites untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default, with = "watermark", skip_serializing_if = "Option::is_none")]
    pub latest: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl SyncState {
    /// Read the state file. A missing file is an empty state; a file that does
    /// not parse is an error.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&contents).map_err(|source| Error::StateCorruption {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_vec_pretty(self).map_err(io::Error::from)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}

mod watermark {
    use super::{DateTime, Utc, format_timestamp, parse_timestamp};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(when) => serializer.serialize_str(&format_timestamp(when)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse_timestamp(&raw).map_err(de::Error::custom))
            .transpose()
    }
}

/// Where a [`SyncEngine`] is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    Initialized,
    Syncing,
    Done,
    Failed,
}

/// What to sync and where to put it
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub destination: PathBuf,
    /// Area of interest; read from `aoi.geojson` in the destination when absent
    pub aoi: Option<Value>,
    pub scene_type: String,
    pub filters: Filters,
}

impl SyncOptions {
    pub fn new(destination: impl Into<PathBuf>, scene_type: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            aoi: None,
            scene_type: scene_type.into(),
            filters: Filters::new(),
        }
    }

    pub fn aoi(mut self, aoi: Value) -> Self {
        self.aoi = Some(aoi);
        self
    }

    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }
}

/// Totals of a finished [`SyncEngine::sync`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub synced: u64,
    pub transferred: u64,
    pub latest: Option<DateTime<Utc>>,
}

pub struct SyncEngine<C> {
    catalog: C,
    destination: PathBuf,
    aoi: Option<Value>,
    scene_type: String,
    filters: Filters,
    sync_file: PathBuf,
    phase: SyncPhase,
    pages: Option<PagedResultSet>,
    // shared with completion callbacks, which run on dispatcher workers
    remaining: Arc<AtomicI64>,
    synced: u64,
    transferred: u64,
    latest: Option<DateTime<Utc>>,
}

impl<C: SceneCatalog> SyncEngine<C> {
    pub fn new(catalog: C, options: SyncOptions) -> Self {
        let sync_file = options.destination.join(SYNC_FILE);
        Self {
            catalog,
            destination: options.destination,
            aoi: options.aoi,
            scene_type: options.scene_type,
            filters: options.filters,
            sync_file,
            phase: SyncPhase::Uninitialized,
            pages: None,
            remaining: Arc::new(AtomicI64::new(0)),
            synced: 0,
            transferred: 0,
            latest: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Scenes left in the budget of this run.
    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Bytes downloaded in this session.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Newest acquisition time synced in this session.
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.latest
    }

    /// Validate the destination, read the watermark and query the catalog.
    ///
    /// Returns the number of scenes the following [`SyncEngine::sync`] will
    /// fetch: the reported match count, capped at `limit` when given. Nothing
    /// goes over the network if validation fails.
    #[instrument(level = "info", skip(self), fields(destination = ?self.destination))]
    pub async fn init(&mut self, limit: Option<u64>) -> Result<i64> {
        match self.prepare(limit).await {
            Ok(remaining) => {
                self.phase = SyncPhase::Initialized;
                Ok(remaining)
            }
            Err(e) => {
                error!(error = %e, "Sync initialization failed");
                self.phase = SyncPhase::Failed;
                Err(e)
            }
        }
    }

    async fn prepare(&mut self, limit: Option<u64>) -> Result<i64> {
        let aoi = self.resolve_aoi().await?;
        let state = SyncState::load(&self.sync_file).await?;

        let mut filters = self.filters.clone();
        if let Some(latest) = state.latest {
            let after = format_timestamp(&latest);
            info!(after = %after, "Resuming after previous sync");
            filters.insert(ACQUIRED_AFTER, after);
        }

        let query = SceneQuery::new(self.scene_type.clone())
            .intersects(aoi)
            .filters(filters)
            .order_by(ORDER_BY)
            .count(PAGE_SIZE);

        let pages = self.catalog.list_scenes(&query).await?;
        let count = pages.count().await?;
        let budget = limit.map_or(count, |limit| limit.min(count));
        let remaining = i64::try_from(budget).unwrap_or(i64::MAX);

        info!(count, remaining, "Scene query complete");
        self.remaining.store(remaining, Ordering::SeqCst);
        self.pages = Some(pages);
        Ok(remaining)
    }

    async fn resolve_aoi(&mut self) -> Result<Value> {
        let is_dir = tokio::fs::metadata(&self.destination)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(ConfigurationError::DestinationNotDirectory(self.destination.clone()).into());
        }

        if let Some(aoi) = &self.aoi {
            return Ok(aoi.clone());
        }

        let aoi_file = self.destination.join(AOI_FILE);
        let contents = match tokio::fs::read_to_string(&aoi_file).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigurationError::MissingAoi(aoi_file).into());
            }
            Err(e) => return Err(e.into()),
        };
        let aoi: Value = serde_json::from_str(&contents).map_err(|source| {
            ConfigurationError::InvalidAoi {
                path: aoi_file.clone(),
                source,
            }
        })?;

        debug!(path = ?aoi_file, "Loaded area of interest");
        self.aoi = Some(aoi.clone());
        Ok(aoi)
    }

    /// Download every scene the last [`SyncEngine::init`] found.
    ///
    /// `on_item` runs once per stored scene with the scene id and the number
    /// of scenes still to go. It runs on dispatcher workers, so calls within a
    /// batch arrive in completion order.
    ///
    /// If any download in a batch fails, including writing it to disk, the
    /// error is returned once the batch has been drained up to that item. The
    /// batch then counts for nothing: `latest` and `transferred` keep their
    /// values and `sync.json` is left untouched.
    #[instrument(level = "info", skip(self, on_item), fields(destination = ?self.destination))]
    pub async fn sync<F>(&mut self, on_item: F) -> Result<SyncSummary>
    where
        F: Fn(&str, i64) + Send + Sync + 'static,
    {
        let mut pages = match (self.phase, self.pages.take()) {
            (SyncPhase::Initialized, Some(pages)) => pages,
            _ => return Err(Error::NotInitialized),
        };
        self.phase = SyncPhase::Syncing;

        let hook = self.completion_hook(Arc::new(on_item));

        if let Err(e) = self.drive(&mut pages, &hook).await {
            error!(error = %e, "Sync aborted");
            self.phase = SyncPhase::Failed;
            return Err(e);
        }

        if let Some(latest) = self.latest {
            self.persist(latest).await?;
        }

        info!(
            synced = self.synced,
            transferred = %ByteSize::b(self.transferred),
            "Sync complete"
        );
        self.phase = SyncPhase::Done;
        Ok(SyncSummary {
            synced: self.synced,
            transferred: self.transferred,
            latest: self.latest,
        })
    }

    async fn drive(&mut self, pages: &mut PagedResultSet, hook: &CompletionHook) -> Result<()> {
        while self.remaining() > 0 {
            let Some(page) = pages.next_page().await? else {
                break;
            };
            let budget = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
            let batch: Vec<Scene> = page.features.into_iter().take(budget).collect();
            if batch.is_empty() {
                break;
            }

            self.sync_batch(&batch, hook.clone()).await?;
        }
        Ok(())
    }

    async fn sync_batch(&mut self, scenes: &[Scene], hook: CompletionHook) -> Result<()> {
        let ids: Vec<String> = scenes.iter().map(|scene| scene.id().to_string()).collect();
        info!(scenes = ids.len(), "Syncing batch");

        let responses =
            self.catalog
                .download_scenes(&ids, &self.scene_type, &self.destination, hook);

        for scene in scenes {
            let path = self
                .destination
                .join(format!("{}_metadata.json", scene.id()));
            let contents = serde_json::to_vec_pretty(scene.record()).map_err(io::Error::from)?;
            tokio::fs::write(&path, contents).await?;
            debug!(path = ?path, "Wrote scene metadata");
        }

        // ordered drain; the first failure aborts the batch before any of the
        // session counters move
        let mut transferred = 0;
        for (id, response) in ids.iter().zip(&responses) {
            let payload = response.payload().await.inspect_err(|e| {
                error!(scene = %id, error = %e, "Scene failed, aborting batch");
            })?;
            transferred += payload.len();
        }

        self.transferred += transferred;
        self.synced += scenes.len() as u64;
        let recent = scenes.iter().map(Scene::acquired).max();
        self.latest = self.latest.max(recent);

        debug!(
            bytes = %ByteSize::b(transferred),
            latest = ?self.latest,
            "Batch complete"
        );
        Ok(())
    }

    fn completion_hook<F>(&self, on_item: Arc<F>) -> CompletionHook
    where
        F: Fn(&str, i64) + Send + Sync + 'static,
    {
        let remaining = self.remaining.clone();

        Arc::new(move |response: &Response| {
            let id = response.name().unwrap_or_default();
            match response.try_payload() {
                Some(Ok(payload)) => {
                    debug!(scene = %id, path = ?payload.path(), "Scene stored");
                    let left = remaining.fetch_sub(1, Ordering::SeqCst) - 1;
                    on_item(id, left);
                }
                Some(Err(e)) => warn!(scene = %id, error = %e, "Scene download failed"),
                None => {}
            }
        })
    }

    /// Re-read the state file so concurrent edits to other keys survive, then
    /// store the new watermark.
    async fn persist(&self, latest: DateTime<Utc>) -> Result<()> {
        let mut state = SyncState::load(&self.sync_file).await?;
        state.latest = state.latest.max(Some(latest));
        state.save(&self.sync_file).await?;
        info!(latest = %format_timestamp(&latest), "Saved sync watermark");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, Outcome};
    use crate::error::{ApiError, TransportError};
    use crate::models::{BodyKind, Payload, Request};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const LATEST: &str = "2015-01-25T18:29:09.155671+00:00";

    fn scene(id: &str, acquired: &str) -> Value {
        json!({
            "type": "Feature",
            "id": id,
            "geometry": {"type": "Point", "coordinates": [-122.4, 37.7]},
            "properties": {"acquired": acquired}
        })
    }

    fn five_scenes() -> Vec<Value> {
        (0..5)
            .map(|i| scene(&i.to_string(), &format!("2015-0{}-01T00:00:00.000000+00:00", i + 1)))
            .collect()
    }

    fn aoi() -> Value {
        json!({"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]]})
    }

    #[derive(Default)]
    struct Recorded {
        queries: Vec<SceneQuery>,
        downloads: Vec<Vec<String>>,
    }

    struct FakeCatalog {
        dispatcher: Dispatcher,
        page: Mutex<Value>,
        failing: HashSet<String>,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl FakeCatalog {
        fn new(count: u64, features: Vec<Value>) -> Self {
            Self {
                dispatcher: Dispatcher::new(1),
                page: Mutex::new(json!({"count": count, "features": features, "links": {}})),
                failing: HashSet::new(),
                recorded: Arc::default(),
            }
        }

        fn set_page(&self, page: Value) {
            *self.page.lock().unwrap() = page;
        }
    }

    impl SceneCatalog for &FakeCatalog {
        async fn list_scenes(&self, query: &SceneQuery) -> Result<PagedResultSet> {
            self.recorded.lock().unwrap().queries.push(query.clone());
            let page = self.page.lock().unwrap().clone();
            let payload = Payload::new("http://localhost/scenes/ortho", serde_json::to_vec(&page).unwrap());
            let first = Response::ready(Ok(Arc::new(payload)), BodyKind::Paged, None);
            let request = Request::get("http://localhost/scenes/ortho").with_kind(BodyKind::Paged);
            Ok(PagedResultSet::new(self.dispatcher.clone(), request, first))
        }

        fn download_scenes(
            &self,
            ids: &[String],
            _scene_type: &str,
            destination: &Path,
            hook: CompletionHook,
        ) -> Vec<Response> {
            self.recorded.lock().unwrap().downloads.push(ids.to_vec());
            ids.iter()
                .map(|id| {
                    let url = format!("http://localhost/scenes/ortho/{id}/full");
                    let outcome: Outcome = if self.failing.contains(id) {
                        Err(TransportError::Api {
                            url,
                            error: ApiError::from_status(500, "boom".into()),
                        })
                    } else {
                        let body = Payload::new(&url, id.as_bytes().to_vec());
                        match body.write_into(destination, Some(id)) {
                            Ok(path) => Ok(Arc::new(Payload::stored(&url, path, body.len()))),
                            Err(e) => Err(TransportError::storage(&url, &destination.join(id), e)),
                        }
                    };
                    let response = Response::ready(outcome, BodyKind::Raw, Some(id.clone()));
                    let hook = hook.clone();
                    response.on_complete(move |r| hook(r));
                    response
                })
                .collect()
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<(String, i64)>>>, impl Fn(&str, i64) + Send + Sync + 'static) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        (calls, move |id: &str, remaining: i64| {
            sink.lock().unwrap().push((id.to_string(), remaining));
        })
    }

    #[tokio::test]
    async fn test_init_rejects_missing_destination() {
        let catalog = FakeCatalog::new(0, vec![]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new("should-not-exist", "ortho"));

        let err = engine.init(None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::DestinationNotDirectory(_))
        ));
        assert_eq!(engine.phase(), SyncPhase::Failed);
        assert!(catalog.recorded.lock().unwrap().queries.is_empty());
    }

    #[tokio::test]
    async fn test_init_rejects_file_destination() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        let catalog = FakeCatalog::new(0, vec![]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(&file, "ortho").aoi(aoi()));

        assert!(engine.init(None).await.is_err());
        assert!(catalog.recorded.lock().unwrap().queries.is_empty());
    }

    #[tokio::test]
    async fn test_init_requires_aoi() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::new(0, vec![]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho"));

        let err = engine.init(None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::MissingAoi(_))
        ));
        assert!(catalog.recorded.lock().unwrap().queries.is_empty());
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_aoi_file() {
        let dir = tempfile::tempdir().unwrap();
        let aoi_file = dir.path().join(AOI_FILE);
        std::fs::write(&aoi_file, "not geojson").unwrap();
        let catalog = FakeCatalog::new(0, vec![]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho"));

        let err = engine.init(None).await.unwrap_err();
        let expected = format!("{} does not contain valid JSON", aoi_file.display());
        assert!(err.to_string().starts_with(&expected), "{err}");
        assert!(catalog.recorded.lock().unwrap().queries.is_empty());
    }

    #[tokio::test]
    async fn test_init_reads_aoi_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(AOI_FILE), aoi().to_string()).unwrap();
        let catalog = FakeCatalog::new(0, vec![]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho"));

        engine.init(None).await.unwrap();
        let recorded = catalog.recorded.lock().unwrap();
        assert_eq!(recorded.queries[0].intersects, Some(aoi()));
        assert_eq!(recorded.queries[0].order_by.as_deref(), Some("acquired asc"));
        assert_eq!(recorded.queries[0].count, Some(100));
    }

    #[tokio::test]
    async fn test_init_count_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::new(250, vec![]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        assert_eq!(engine.init(None).await.unwrap(), 250);
        assert_eq!(engine.init(Some(10)).await.unwrap(), 10);
        assert_eq!(engine.init(Some(1000)).await.unwrap(), 250);
        assert_eq!(engine.phase(), SyncPhase::Initialized);
    }

    #[tokio::test]
    async fn test_init_uses_watermark() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SYNC_FILE), json!({"latest": LATEST}).to_string()).unwrap();
        let catalog = FakeCatalog::new(0, vec![]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        engine.init(None).await.unwrap();
        let recorded = catalog.recorded.lock().unwrap();
        assert_eq!(recorded.queries[0].filters.get(ACQUIRED_AFTER), Some(LATEST));
    }

    #[tokio::test]
    async fn test_init_rejects_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SYNC_FILE), "{not json").unwrap();
        let catalog = FakeCatalog::new(0, vec![]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        let err = engine.init(None).await.unwrap_err();
        assert!(matches!(err, Error::StateCorruption { .. }));
        assert!(catalog.recorded.lock().unwrap().queries.is_empty());
    }

    #[tokio::test]
    async fn test_sync_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::new(0, vec![]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        let (_, on_item) = recorder();
        assert!(matches!(engine.sync(on_item).await, Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_sync_with_nothing_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::new(5, five_scenes());
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        assert_eq!(engine.init(Some(0)).await.unwrap(), 0);
        let (calls, on_item) = recorder();
        let summary = engine.sync(on_item).await.unwrap();

        assert_eq!(summary.synced, 0);
        assert_eq!(engine.latest(), None);
        assert!(calls.lock().unwrap().is_empty());
        assert!(catalog.recorded.lock().unwrap().downloads.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sync_five_scenes() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::new(5, five_scenes());
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        assert_eq!(engine.init(None).await.unwrap(), 5);
        let (calls, on_item) = recorder();
        let summary = engine.sync(on_item).await.unwrap();

        let expected: Vec<(String, i64)> = (0..5).map(|i| (i.to_string(), 4 - i)).collect();
        assert_eq!(*calls.lock().unwrap(), expected);

        let ids: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        assert_eq!(catalog.recorded.lock().unwrap().downloads, vec![ids.clone()]);
        for id in &ids {
            let metadata = dir.path().join(format!("{id}_metadata.json"));
            let record: Value = serde_json::from_slice(&std::fs::read(&metadata).unwrap()).unwrap();
            assert_eq!(record["id"], id.as_str());
            assert_eq!(std::fs::read(dir.path().join(id)).unwrap(), id.as_bytes());
        }

        assert_eq!(summary.synced, 5);
        assert_eq!(summary.transferred, 5);
        assert_eq!(engine.remaining(), 0);
        assert_eq!(engine.phase(), SyncPhase::Done);

        let state: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(SYNC_FILE)).unwrap()).unwrap();
        assert_eq!(state["latest"], "2015-05-01T00:00:00.000000+00:00");
    }

    #[tokio::test]
    async fn test_sync_truncates_to_budget() {
        let dir = tempfile::tempdir().unwrap();
        let features: Vec<Value> = (0..10)
            .map(|i| scene(&format!("s{i}"), "2015-01-01T00:00:00+00:00"))
            .collect();
        let catalog = FakeCatalog::new(10, vec![]);
        // nothing listens behind the next link, fetching it would fail the sync
        catalog.set_page(json!({
            "count": 10,
            "features": features,
            "links": {"next": "http://127.0.0.1:9/scenes/ortho?page=2"}
        }));
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        assert_eq!(engine.init(Some(3)).await.unwrap(), 3);
        let (calls, on_item) = recorder();
        engine.sync(on_item).await.unwrap();

        assert_eq!(calls.lock().unwrap().len(), 3);
        assert_eq!(
            catalog.recorded.lock().unwrap().downloads,
            vec![vec!["s0".to_string(), "s1".to_string(), "s2".to_string()]]
        );
        assert!(!dir.path().join("s3_metadata.json").exists());
    }

    #[tokio::test]
    async fn test_latest_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::new(1, vec![scene("new", "2015-06-01T00:00:00+00:00")]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        engine.init(None).await.unwrap();
        let (_, on_item) = recorder();
        engine.sync(on_item).await.unwrap();
        let newest = engine.latest().unwrap();

        catalog.set_page(json!({
            "count": 1,
            "features": [scene("old", "2015-01-01T00:00:00+00:00")],
            "links": {}
        }));
        engine.init(None).await.unwrap();
        assert_eq!(
            catalog.recorded.lock().unwrap().queries[1].filters.get(ACQUIRED_AFTER),
            Some("2015-06-01T00:00:00.000000+00:00")
        );
        let (_, on_item) = recorder();
        engine.sync(on_item).await.unwrap();

        assert_eq!(engine.latest(), Some(newest));
        let state = SyncState::load(&dir.path().join(SYNC_FILE)).await.unwrap();
        assert_eq!(state.latest, Some(newest));
    }

    #[tokio::test]
    async fn test_failed_download_aborts_batch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SYNC_FILE), json!({"latest": LATEST}).to_string()).unwrap();
        let mut catalog = FakeCatalog::new(5, five_scenes());
        catalog.failing.insert("2".to_string());
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        engine.init(None).await.unwrap();
        let (calls, on_item) = recorder();
        let err = engine.sync(on_item).await.unwrap_err();

        assert!(matches!(err, Error::Transport(TransportError::Api { .. })));
        assert_eq!(engine.phase(), SyncPhase::Failed);
        assert_eq!(engine.latest(), None);
        // siblings still completed and their metadata stays behind
        assert_eq!(calls.lock().unwrap().len(), 4);
        assert!(dir.path().join("4_metadata.json").exists());

        let state = SyncState::load(&dir.path().join(SYNC_FILE)).await.unwrap();
        assert_eq!(state.latest.map(|t| format_timestamp(&t)).as_deref(), Some(LATEST));
    }

    #[tokio::test]
    async fn test_failed_store_does_not_advance_watermark() {
        let dir = tempfile::tempdir().unwrap();
        // scene 0 cannot be written: its target is a directory
        std::fs::create_dir(dir.path().join("0")).unwrap();
        let catalog = FakeCatalog::new(5, five_scenes());
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        engine.init(None).await.unwrap();
        let (calls, on_item) = recorder();
        let err = engine.sync(on_item).await.unwrap_err();

        assert!(matches!(err, Error::Transport(TransportError::Storage { .. })));
        assert_eq!(engine.latest(), None);
        assert_eq!(engine.transferred(), 0);
        assert_eq!(calls.lock().unwrap().len(), 4);

        // a later successful run in the same session must not persist the
        // failed batch's timestamps
        catalog.set_page(json!({"count": 0, "features": [], "links": {}}));
        engine.init(None).await.unwrap();
        assert_eq!(catalog.recorded.lock().unwrap().queries[1].filters.get(ACQUIRED_AFTER), None);
        let (_, on_item) = recorder();
        engine.sync(on_item).await.unwrap();

        assert_eq!(engine.latest(), None);
        assert!(!dir.path().join(SYNC_FILE).exists());
    }

    #[tokio::test]
    async fn test_state_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SYNC_FILE);
        std::fs::write(&path, json!({"latest": LATEST, "note": "keep me"}).to_string()).unwrap();

        let mut state = SyncState::load(&path).await.unwrap();
        state.latest = Some(parse_timestamp("2016-01-01T00:00:00+00:00").unwrap());
        state.save(&path).await.unwrap();

        let saved: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved["note"], "keep me");
        assert_eq!(saved["latest"], "2016-01-01T00:00:00.000000+00:00");
    }

    #[tokio::test]
    async fn test_watermark_keeps_full_precision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SYNC_FILE);
        let latest = "2015-01-25T18:29:09.155671123+00:00";
        let catalog = FakeCatalog::new(1, vec![scene("fine", latest)]);
        let mut engine = SyncEngine::new(&catalog, SyncOptions::new(dir.path(), "ortho").aoi(aoi()));

        engine.init(None).await.unwrap();
        let (_, on_item) = recorder();
        engine.sync(on_item).await.unwrap();

        let saved: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved["latest"], latest);

        engine.init(None).await.unwrap();
        assert_eq!(
            catalog.recorded.lock().unwrap().queries[1].filters.get(ACQUIRED_AFTER),
            Some(latest)
        );
    }

    #[tokio::test]
    async fn test_missing_state_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = SyncState::load(&dir.path().join(SYNC_FILE)).await.unwrap();
        assert_eq!(state, SyncState::default());
    }
}
