//! Config module for scenesync

use std::path::PathBuf;

use clap::{Args, Parser};

use crate::dispatch::DEFAULT_WORKERS;
use crate::models::{ApiKey, Filters};

pub const DEFAULT_BASE_URL: &str = "https://api.planet.com/v0/";

#[derive(Args, Debug, Clone)]
pub struct ClientConfig {
    /// API key for the imagery catalog
    #[clap(short = 'k', long = "api-key", env = "SCENESYNC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Base URL of the catalog API
    #[clap(long, env = "SCENESYNC_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Number of requests allowed in flight at once
    #[clap(long, env = "SCENESYNC_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,
}

impl ClientConfig {
    pub fn api_key(&self) -> Option<ApiKey> {
        self.api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(ApiKey::new)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            workers: DEFAULT_WORKERS,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Directory to mirror scenes into, must already exist
    pub destination: PathBuf,

    /// Scene type to sync
    #[clap(long, env = "SCENESYNC_SCENE_TYPE", default_value = "ortho")]
    pub scene_type: String,

    /// Product to download for each scene
    #[clap(long, env = "SCENESYNC_PRODUCT", default_value = "visual")]
    pub product: String,

    /// Stop after this many scenes
    #[clap(long)]
    pub limit: Option<u64>,

    /// Extra catalog filter, e.g. `cloud_cover.estimated.lt=0.1`
    #[clap(long = "filter", value_parser = parse_filter)]
    pub filters: Vec<(String, String)>,
}

impl SyncArgs {
    pub fn filters(&self) -> Filters {
        self.filters.iter().cloned().collect()
    }
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw}"))
}

#[derive(Parser, Debug, Clone)]
#[clap(version, about = "Mirror catalog scenes for an area of interest into a directory")]
pub struct Config {
    #[clap(flatten)]
    pub client: ClientConfig,

    #[clap(flatten)]
    pub sync: SyncArgs,
}

pub fn config() -> Config {
    Config::parse()
}
