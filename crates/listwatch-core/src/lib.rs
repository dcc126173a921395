//! Core domain model for listwatch: listings, searches, filters and engine state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "listwatch-core";

pub type Timestamp = DateTime<Utc>;

/// Default polling frequency for a fresh engine.
pub const DEFAULT_NOTIFICATION_FREQUENCY_SECS: u64 = 600;

/// Backend a search specification is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Craigslist,
    Marketplace,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Craigslist => "craigslist",
            SourceKind::Marketplace => "marketplace",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unsupported source kind: {0}")]
pub struct UnknownSourceKind(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "craigslist" => Ok(SourceKind::Craigslist),
            "marketplace" => Ok(SourceKind::Marketplace),
            other => Err(UnknownSourceKind(other.to_string())),
        }
    }
}

/// Source-specific query parameters plus the backend they target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchSpec {
    pub source: SourceKind,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl SearchSpec {
    pub fn new(source: SourceKind) -> Self {
        Self {
            source,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Stable identity of the spec. Equal specs always produce the same key.
    pub fn key(&self) -> Uuid {
        let params = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let name = format!("{}:{}", self.source, params);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("expected \"lat,long\", got {0:?}")]
pub struct ParseGeoPointError(pub String);

impl FromStr for GeoPoint {
    type Err = ParseGeoPointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseGeoPointError(s.to_string());
        let (lat, long) = s.split_once(',').ok_or_else(err)?;
        let latitude: f64 = lat.trim().parse().map_err(|_| err())?;
        let longitude: f64 = long.trim().parse().map_err(|_| err())?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(err());
        }
        Ok(GeoPoint::new(latitude, longitude))
    }
}

const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Great-circle distance in miles (haversine).
pub fn distance_miles(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlong = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlong / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * h.sqrt().asin()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub city: Option<String>,
    pub state: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn geo_point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// A single value read off a listing for filter evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Timestamp(Timestamp),
    Missing,
}

impl FieldValue {
    fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Number(_) => "number",
            FieldValue::Text(_) => "text",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Missing => "missing",
        }
    }
}

/// A fetched listing. Immutable apart from `distance_miles` enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub price: f64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub location: Location,
    #[serde(default)]
    pub distance_miles: Option<f64>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    /// Variant-specific fields, e.g. `condition` or `odometer`.
    #[serde(default)]
    pub attributes: BTreeMap<String, FieldValue>,
}

impl Listing {
    /// Looks up a field by name.
    ///
    /// Common fields are present on every listing; `None` optionals resolve to
    /// [`FieldValue::Missing`]. Any other name is present only when the
    /// listing's variant carries it in `attributes`; otherwise `None` is
    /// returned and filters on that field do not apply.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        let text = |v: &Option<String>| {
            v.clone()
                .map(FieldValue::Text)
                .unwrap_or(FieldValue::Missing)
        };
        let value = match name {
            "id" => FieldValue::Text(self.id.clone()),
            "title" => FieldValue::Text(self.title.clone()),
            "body" => FieldValue::Text(self.body.clone()),
            "url" => FieldValue::Text(self.url.clone()),
            "price" => FieldValue::Number(self.price),
            "created_at" => FieldValue::Timestamp(self.created_at),
            "updated_at" => FieldValue::Timestamp(self.updated_at),
            "city" => text(&self.location.city),
            "state" => text(&self.location.state),
            "distance_miles" => self
                .distance_miles
                .map(FieldValue::Number)
                .unwrap_or(FieldValue::Missing),
            other => return self.attributes.get(other).cloned(),
        };
        Some(value)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("{filter} filter cannot evaluate a {found} value")]
    TypeMismatch {
        filter: &'static str,
        found: &'static str,
    },
}

/// Predicate over one listing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    /// Inclusive numeric bounds.
    Numeric {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Case-insensitive substring tests.
    Text {
        #[serde(default)]
        include_any: Vec<String>,
        #[serde(default)]
        exclude_any: Vec<String>,
    },
}

impl Filter {
    pub fn at_most(max: f64) -> Self {
        Filter::Numeric {
            min: None,
            max: Some(max),
        }
    }

    pub fn at_least(min: f64) -> Self {
        Filter::Numeric {
            min: Some(min),
            max: None,
        }
    }

    pub fn test(&self, value: &FieldValue) -> Result<bool, FilterError> {
        match self {
            Filter::Numeric { min, max } => {
                let n = match value {
                    FieldValue::Number(n) => *n,
                    FieldValue::Missing => return Ok(false),
                    other => {
                        return Err(FilterError::TypeMismatch {
                            filter: "numeric",
                            found: other.type_name(),
                        })
                    }
                };
                Ok(min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m))
            }
            Filter::Text {
                include_any,
                exclude_any,
            } => {
                let haystack = match value {
                    FieldValue::Text(s) => s.to_lowercase(),
                    FieldValue::Missing => String::new(),
                    other => {
                        return Err(FilterError::TypeMismatch {
                            filter: "text",
                            found: other.type_name(),
                        })
                    }
                };
                let included = include_any.is_empty()
                    || include_any
                        .iter()
                        .any(|needle| haystack.contains(&needle.to_lowercase()));
                let excluded = exclude_any
                    .iter()
                    .any(|needle| haystack.contains(&needle.to_lowercase()));
                Ok(included && !excluded)
            }
        }
    }
}

/// A search being polled, with the creation time of the newest listing seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSearch {
    pub spec: SearchSpec,
    pub watermark: Timestamp,
}

impl ActiveSearch {
    pub fn new(spec: SearchSpec, watermark: Timestamp) -> Self {
        Self { spec, watermark }
    }

    /// Moves the watermark forward. Returns false if `candidate` is not newer.
    pub fn advance(&mut self, candidate: Timestamp) -> bool {
        if candidate > self.watermark {
            self.watermark = candidate;
            true
        } else {
            false
        }
    }
}

/// Durable state of one notification engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_notification_frequency_seconds")]
    pub notification_frequency_seconds: u64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub active_searches: Vec<ActiveSearch>,
    #[serde(default)]
    pub filters: BTreeMap<String, Filter>,
}

fn default_notification_frequency_seconds() -> u64 {
    DEFAULT_NOTIFICATION_FREQUENCY_SECS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notification_frequency_seconds: DEFAULT_NOTIFICATION_FREQUENCY_SECS,
            paused: false,
            active_searches: Vec::new(),
            filters: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn with_frequency(mut self, seconds: u64) -> Self {
        self.notification_frequency_seconds = seconds;
        self
    }

    /// Inserts or replaces the filter for `field`, returning the previous one.
    pub fn set_filter(&mut self, field: impl Into<String>, filter: Filter) -> Option<Filter> {
        self.filters.insert(field.into(), filter)
    }

    pub fn remove_filter(&mut self, field: &str) -> Option<Filter> {
        self.filters.remove(field)
    }
}
