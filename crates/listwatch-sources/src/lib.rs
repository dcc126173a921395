//! Listing source contract, search registration bookkeeping and bundled sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use listwatch_core::{Listing, SearchSpec, SourceKind, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "listwatch-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("search {0} is not registered with this source")]
    NotRegistered(Uuid),
    #[error("source {0} is disabled")]
    Disabled(SourceKind),
    #[error("no source configured for {0}")]
    UnknownSource(SourceKind),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("backend error: {0}")]
    Backend(String),
}

/// Contract for anything that can answer "what is new for this search".
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Listings created after `after`, newest first.
    async fn get_listings(
        &self,
        spec: &SearchSpec,
        after: Timestamp,
    ) -> Result<Vec<Listing>, SourceError>;

    /// Marks `spec` as live. Registering the same spec twice is counted.
    fn register_search(&self, spec: &SearchSpec);

    /// Drops one registration of `spec`. Unknown specs are ignored.
    fn remove_search(&self, spec: &SearchSpec);
}

/// Reference-counted set of live searches keyed by [`SearchSpec::key`].
#[derive(Debug, Default)]
pub struct SearchRegistry {
    live: Mutex<HashMap<Uuid, (SearchSpec, usize)>>,
}

impl SearchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: &SearchSpec) {
        let Ok(mut live) = self.live.lock() else {
            return;
        };
        let entry = live.entry(spec.key()).or_insert_with(|| (spec.clone(), 0));
        entry.1 += 1;
        debug!(key = %spec.key(), source = %spec.source, refs = entry.1, "registered search");
    }

    pub fn remove(&self, spec: &SearchSpec) {
        let Ok(mut live) = self.live.lock() else {
            return;
        };
        let key = spec.key();
        if let Some(entry) = live.get_mut(&key) {
            entry.1 -= 1;
            if entry.1 == 0 {
                live.remove(&key);
                debug!(%key, "search no longer live");
            }
        }
    }

    pub fn is_registered(&self, spec: &SearchSpec) -> bool {
        self.live
            .lock()
            .map(|live| live.contains_key(&spec.key()))
            .unwrap_or(false)
    }

    pub fn registrations(&self, spec: &SearchSpec) -> usize {
        self.live
            .lock()
            .ok()
            .and_then(|live| live.get(&spec.key()).map(|e| e.1))
            .unwrap_or(0)
    }

    pub fn live_specs(&self) -> Vec<SearchSpec> {
        self.live
            .lock()
            .map(|live| live.values().map(|(spec, _)| spec.clone()).collect())
            .unwrap_or_default()
    }
}

/// Sorts newest first and keeps only listings created after `after`.
fn newer_than(mut listings: Vec<Listing>, after: Timestamp) -> Vec<Listing> {
    listings.retain(|l| l.created_at > after);
    listings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    listings
}

/// Listings held in memory per search; used for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryListingSource {
    listings: Mutex<HashMap<Uuid, Vec<Listing>>>,
    registry: SearchRegistry,
}

impl InMemoryListingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, spec: &SearchSpec, listing: Listing) {
        if let Ok(mut map) = self.listings.lock() {
            map.entry(spec.key()).or_default().push(listing);
        }
    }

    pub fn registry(&self) -> &SearchRegistry {
        &self.registry
    }
}

#[async_trait]
impl ListingSource for InMemoryListingSource {
    async fn get_listings(
        &self,
        spec: &SearchSpec,
        after: Timestamp,
    ) -> Result<Vec<Listing>, SourceError> {
        let all = self
            .listings
            .lock()
            .map_err(|_| SourceError::Backend("listing store poisoned".to_string()))?
            .get(&spec.key())
            .cloned()
            .unwrap_or_default();
        Ok(newer_than(all, after))
    }

    fn register_search(&self, spec: &SearchSpec) {
        self.registry.register(spec);
    }

    fn remove_search(&self, spec: &SearchSpec) {
        self.registry.remove(spec);
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistryFile {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source: SourceKind,
    pub display_name: String,
    pub enabled: bool,
    /// Directory holding `listings.json`, relative to the workspace root.
    pub fixture_dir: PathBuf,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Source reading crawler output (`listings.json`) from per-source fixture
/// directories declared in `sources.yaml`.
///
/// The file is re-read on every fetch. A `query` param on the spec restricts
/// results to listings whose title or body contains it.
#[derive(Debug)]
pub struct FixtureListingSource {
    root: PathBuf,
    sources: HashMap<SourceKind, SourceConfig>,
    registry: SearchRegistry,
}

impl FixtureListingSource {
    pub fn new(root: impl Into<PathBuf>, sources: Vec<SourceConfig>) -> Self {
        Self {
            root: root.into(),
            sources: sources.into_iter().map(|s| (s.source, s)).collect(),
            registry: SearchRegistry::new(),
        }
    }

    /// Loads `sources.yaml` from `root`.
    pub async fn from_workspace(root: impl AsRef<Path>) -> Result<Self, SourceError> {
        let root = root.as_ref();
        let path = root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .map_err(|source| SourceError::Io {
                path: path.clone(),
                source,
            })?;
        let registry: SourceRegistryFile =
            serde_yaml::from_str(&text).map_err(|e| SourceError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?;
        Ok(Self::new(root, registry.sources))
    }

    pub fn registry(&self) -> &SearchRegistry {
        &self.registry
    }

    pub fn enabled_sources(&self) -> Vec<SourceKind> {
        let mut kinds: Vec<_> = self
            .sources
            .values()
            .filter(|s| s.enabled)
            .map(|s| s.source)
            .collect();
        kinds.sort();
        kinds
    }

    async fn read_listings(&self, config: &SourceConfig) -> Result<Vec<Listing>, SourceError> {
        let path = self.root.join(&config.fixture_dir).join("listings.json");
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SourceError::Io { path, source }),
        };
        serde_json::from_str(&text).map_err(|e| SourceError::Parse {
            path,
            message: e.to_string(),
        })
    }
}

fn matches_query(listing: &Listing, spec: &SearchSpec) -> bool {
    let Some(query) = spec.params.get("query") else {
        return true;
    };
    let query = query.to_lowercase();
    listing.title.to_lowercase().contains(&query) || listing.body.to_lowercase().contains(&query)
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    async fn get_listings(
        &self,
        spec: &SearchSpec,
        after: Timestamp,
    ) -> Result<Vec<Listing>, SourceError> {
        if !self.registry.is_registered(spec) {
            return Err(SourceError::NotRegistered(spec.key()));
        }
        let config = self
            .sources
            .get(&spec.source)
            .ok_or(SourceError::UnknownSource(spec.source))?;
        if !config.enabled {
            return Err(SourceError::Disabled(spec.source));
        }
        let mut listings = self.read_listings(config).await?;
        listings.retain(|l| matches_query(l, spec));
        let listings = newer_than(listings, after);
        debug!(
            source = %spec.source,
            %after,
            found = listings.len(),
            "read fixture listings"
        );
        Ok(listings)
    }

    fn register_search(&self, spec: &SearchSpec) {
        self.registry.register(spec);
    }

    fn remove_search(&self, spec: &SearchSpec) {
        self.registry.remove(spec);
    }
}
