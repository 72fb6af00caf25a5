//! Data structures shared by the dispatcher, the client and the sync engine
//!
//! This file contains request descriptors, fetched payloads, catalog records
//! and the filter map used to build scene queries.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use crate::error::{ConfigurationError, Error, Result};
use crate::util::parse_timestamp;

/// API key sent as `Authorization: api-key <value>`
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }

    pub(crate) fn header_value(&self) -> String {
        format!("api-key {}", self.0)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// How a response body should be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyKind {
    /// Bytes as delivered, usually written to disk
    Raw,
    /// A JSON document
    #[default]
    Json,
    /// A JSON page of a multi-page listing
    Paged,
}

/// Immutable description of one HTTP exchange
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    auth: Option<ApiKey>,
    params: Vec<(String, String)>,
    body: Option<Value>,
    kind: BodyKind,
    name: Option<String>,
    destination: Option<PathBuf>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            auth: None,
            params: Vec::new(),
            body: None,
            kind: BodyKind::default(),
            name: None,
            destination: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_auth(mut self, auth: Option<ApiKey>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_kind(mut self, kind: BodyKind) -> Self {
        self.kind = kind;
        self
    }

    /// Name of the content this request fetches, e.g. the scene id of a download.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stream a raw body into `dir` instead of keeping it in memory.
    pub fn with_destination(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination = Some(dir.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn auth(&self) -> Option<&ApiKey> {
        self.auth.as_ref()
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Request for a follow-up URL that keeps this request's credentials and decoding.
    pub(crate) fn follow(&self, url: impl Into<String>) -> Self {
        Self::get(url)
            .with_auth(self.auth.clone())
            .with_kind(self.kind)
    }
}

/// A successfully fetched body plus what the transport told us about it
///
/// Bodies are either held in memory or, for downloads with a destination,
/// already on disk; `bytes()` is empty in the latter case.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    url: String,
    bytes: Vec<u8>,
    stored: Option<(PathBuf, u64)>,
    content_length: Option<u64>,
    file_name: Option<String>,
}

impl Payload {
    pub fn new(url: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            bytes: bytes.into(),
            stored: None,
            content_length: None,
            file_name: None,
        }
    }

    /// A body that was streamed to `path`, `written` bytes long.
    pub fn stored(url: impl Into<String>, path: impl Into<PathBuf>, written: u64) -> Self {
        Self {
            url: url.into(),
            bytes: Vec::new(),
            stored: Some((path.into(), written)),
            content_length: None,
            file_name: None,
        }
    }

    pub fn with_content_length(mut self, content_length: Option<u64>) -> Self {
        self.content_length = content_length;
        self
    }

    pub fn with_file_name(mut self, file_name: Option<String>) -> Self {
        self.file_name = file_name;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Where the body was written, for streamed downloads.
    pub fn path(&self) -> Option<&Path> {
        self.stored.as_ref().map(|(path, _)| path.as_path())
    }

    /// Body length, counting bytes written to disk for streamed downloads.
    pub fn len(&self) -> u64 {
        match &self.stored {
            Some((_, written)) => *written,
            None => self.bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content length as reported by the transport, never inferred from the body.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// File name from the Content-Disposition header, if the server sent one.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.bytes).map_err(|source| Error::Decode {
            context: "json body",
            source,
        })
    }

    /// Name to store this payload under inside a directory.
    pub fn target_name(&self, content_name: Option<&str>) -> String {
        target_name(self.file_name.as_deref(), content_name, &self.url)
    }

    /// Write an in-memory body into `dir` and return the path written.
    pub fn write_into(&self, dir: &Path, content_name: Option<&str>) -> std::io::Result<PathBuf> {
        let path = dir.join(self.target_name(content_name));
        std::fs::write(&path, &self.bytes)?;
        tracing::debug!(path = ?path, bytes = self.bytes.len(), "Wrote payload");
        Ok(path)
    }
}

/// File name for a download inside its destination directory.
///
/// Content-Disposition wins, then the caller's content name, then the last
/// path segment of the URL. Only the final component of each candidate is
/// used, so the result never leaves the directory it is joined to.
pub fn target_name(file_name: Option<&str>, content_name: Option<&str>, url: &str) -> String {
    let from_url = url::Url::parse(url).ok().and_then(|url| {
        url.path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .map(str::to_string)
    });

    [file_name, content_name, from_url.as_deref()]
        .into_iter()
        .flatten()
        .find_map(safe_file_name)
        .unwrap_or_else(|| "download.bin".to_string())
}

fn safe_file_name(candidate: &str) -> Option<String> {
    // some servers send windows paths
    let last = candidate.rsplit(['/', '\\']).next()?;
    match Path::new(last).file_name()?.to_str()? {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

/// One catalog item.
///
/// The full record is kept so metadata files are a faithful copy of what the
/// catalog returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Scene {
    id: String,
    acquired: DateTime<Utc>,
    record: Value,
}

impl Scene {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn acquired(&self) -> DateTime<Utc> {
        self.acquired
    }

    pub fn record(&self) -> &Value {
        &self.record
    }
}

impl TryFrom<Value> for Scene {
    type Error = String;

    fn try_from(record: Value) -> std::result::Result<Self, Self::Error> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or("scene record has no id")?
            .to_string();
        let acquired = record
            .pointer("/properties/acquired")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("scene {id} has no properties.acquired"))?;
        let acquired = parse_timestamp(acquired)
            .map_err(|e| format!("scene {id} has a bad acquired timestamp: {e}"))?;

        Ok(Self {
            id,
            acquired,
            record,
        })
    }
}

impl From<Scene> for Value {
    fn from(scene: Scene) -> Self {
        scene.record
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// One chunk of a multi-page scene listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Total number of matches across all pages, as reported by the server
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub features: Vec<Scene>,
    #[serde(default)]
    pub links: Links,
}

impl Page {
    pub fn next_link(&self) -> Option<&str> {
        self.links.next.as_deref().filter(|next| !next.is_empty())
    }
}

/// Filter key for the "acquired after" lower bound.
pub const ACQUIRED_AFTER: &str = "acquired.gt";

const FILTER_OPERATORS: [&str; 6] = ["gt", "gte", "lt", "lte", "eq", "neq"];

/// Ordered filter map, `<property path>.<operator>` to value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters(BTreeMap<String, String>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a filter, returning the value it replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check every key against the `<property path>.<operator>` vocabulary.
    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        match self.0.keys().find(|key| !is_valid_filter_key(key)) {
            Some(key) => Err(ConfigurationError::InvalidFilter(key.clone())),
            None => Ok(()),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Filters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

fn is_valid_filter_key(key: &str) -> bool {
    let Some((path, operator)) = key.rsplit_once('.') else {
        return false;
    };
    FILTER_OPERATORS.contains(&operator)
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
