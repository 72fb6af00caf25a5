//! Catalog API client.
//!
//! Thin request builders on top of the [`Dispatcher`]. The sync engine only
//! sees the [`SceneCatalog`] capability, so it can run against a fake catalog.

use serde_json::Value;
use std::{path::Path, sync::Arc};
use tracing::{debug, instrument};
use url::Url;

use crate::config::ClientConfig;
use crate::dispatch::{Dispatcher, Response};
use crate::error::{ConfigurationError, Result};
use crate::models::{ApiKey, BodyKind, Filters, Request};
use crate::paging::PagedResultSet;

/// Called once for every download response as it completes.
pub type CompletionHook = Arc<dyn Fn(&Response) + Send + Sync>;

/// A scene search
#[derive(Debug, Clone)]
pub struct SceneQuery {
    pub scene_type: String,
    /// Geometry the scenes must intersect
    pub intersects: Option<Value>,
    pub filters: Filters,
    pub order_by: Option<String>,
    /// Page size
    pub count: Option<u32>,
}

impl SceneQuery {
    pub fn new(scene_type: impl Into<String>) -> Self {
        Self {
            scene_type: scene_type.into(),
            intersects: None,
            filters: Filters::new(),
            order_by: None,
            count: None,
        }
    }

    pub fn intersects(mut self, geometry: Value) -> Self {
        self.intersects = Some(geometry);
        self
    }

    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Query string for this search. Filter keys are checked here and nowhere else.
    fn params(&self) -> std::result::Result<Vec<(String, String)>, ConfigurationError> {
        self.filters.validate()?;

        let mut params = Vec::new();
        if let Some(order_by) = &self.order_by {
            params.push(("order_by".to_string(), order_by.clone()));
        }
        if let Some(count) = self.count {
            params.push(("count".to_string(), count.to_string()));
        }
        if let Some(geometry) = &self.intersects {
            params.push(("intersects".to_string(), geometry.to_string()));
        }
        params.extend(
            self.filters
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        );
        Ok(params)
    }
}

/// What the sync engine needs from a catalog
pub trait SceneCatalog {
    /// Search for scenes; the first page has been fetched when this returns.
    async fn list_scenes(&self, query: &SceneQuery) -> Result<PagedResultSet>;

    /// Start one download per id into `destination` and return the responses
    /// in id order.
    ///
    /// A response completes once its file is fully written; `hook` runs once
    /// per response at that point.
    fn download_scenes(
        &self,
        ids: &[String],
        scene_type: &str,
        destination: &Path,
        hook: CompletionHook,
    ) -> Vec<Response>;
}

#[derive(Debug, Clone)]
pub struct Client {
    dispatcher: Dispatcher,
    base_url: Url,
    api_key: Option<ApiKey>,
    product: String,
}

impl Client {
    /// Build a client with its own dispatcher on the current runtime.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_dispatcher(
            Dispatcher::new(config.workers),
            &config.base_url,
            config.api_key(),
        )
    }

    pub fn with_dispatcher(
        dispatcher: Dispatcher,
        base_url: &str,
        api_key: Option<ApiKey>,
    ) -> Result<Self> {
        // Url::join drops the last segment unless the base ends with a slash
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url =
            Url::parse(&normalized).map_err(|e| ConfigurationError::InvalidBaseUrl {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            dispatcher,
            base_url,
            api_key,
            product: "visual".to_string(),
        })
    }

    /// Product downloaded by [`SceneCatalog::download_scenes`].
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URLs pass through, anything else is relative to the base URL.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        match self.base_url.join(path) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}{}", self.base_url, path),
        }
    }

    pub fn request(&self, path: &str, kind: BodyKind) -> Request {
        Request::get(self.url(path))
            .with_auth(self.api_key.clone())
            .with_kind(kind)
    }

    /// Dispatch a GET and optionally observe its completion.
    pub fn get(&self, request: Request, hook: Option<CompletionHook>) -> Response {
        let response = self.dispatcher.response(request);
        if let Some(hook) = hook {
            response.on_complete(move |r| hook(r));
        }
        response
    }

    fn download_many(
        &self,
        requests: Vec<Request>,
        hook: CompletionHook,
    ) -> Vec<Response> {
        requests
            .into_iter()
            .map(|request| self.get(request, Some(hook.clone())))
            .collect()
    }

    /// Search scenes, waiting for the first page.
    #[instrument(level = "debug", skip(self, query), fields(scene_type = %query.scene_type))]
    pub async fn get_scenes_list(&self, query: &SceneQuery) -> Result<PagedResultSet> {
        let request = self
            .request(&format!("scenes/{}", query.scene_type), BodyKind::Paged)
            .with_params(query.params()?);

        let first = self.dispatcher.response(request.clone());
        first.page().await?;
        debug!("First page of scenes received");

        Ok(PagedResultSet::new(self.dispatcher.clone(), request, first))
    }

    /// Download full scene products, one response per id in id order.
    ///
    /// With a `destination` the bodies are streamed into that directory,
    /// otherwise they are kept in memory.
    pub fn fetch_scene_geotiffs(
        &self,
        ids: &[String],
        scene_type: &str,
        product: &str,
        destination: Option<&Path>,
        hook: CompletionHook,
    ) -> Vec<Response> {
        let requests = ids
            .iter()
            .map(|id| {
                let request = self
                    .request(&format!("scenes/{scene_type}/{id}/full"), BodyKind::Raw)
                    .with_param("product", product)
                    .with_name(id.clone());
                with_destination(request, destination)
            })
            .collect();
        self.download_many(requests, hook)
    }

    /// Download scene thumbnails, one response per id in id order.
    pub fn fetch_scene_thumbnails(
        &self,
        ids: &[String],
        scene_type: &str,
        size: &str,
        format: &str,
        destination: Option<&Path>,
        hook: CompletionHook,
    ) -> Vec<Response> {
        let requests = ids
            .iter()
            .map(|id| {
                let request = self
                    .request(&format!("scenes/{scene_type}/{id}/thumb"), BodyKind::Raw)
                    .with_param("size", size)
                    .with_param("format", format)
                    .with_name(format!("{id}_thumb.{format}"));
                with_destination(request, destination)
            })
            .collect();
        self.download_many(requests, hook)
    }
}

impl SceneCatalog for Client {
    async fn list_scenes(&self, query: &SceneQuery) -> Result<PagedResultSet> {
        self.get_scenes_list(query).await
    }

    fn download_scenes(
        &self,
        ids: &[String],
        scene_type: &str,
        destination: &Path,
        hook: CompletionHook,
    ) -> Vec<Response> {
        self.fetch_scene_geotiffs(ids, scene_type, &self.product, Some(destination), hook)
    }
}

fn with_destination(request: Request, destination: Option<&Path>) -> Request {
    match destination {
        Some(dir) => request.with_destination(dir),
        None => request,
    }
}
