use std::path::PathBuf;

use chrono::TimeDelta;
use listwatch_core::{GeoPoint, DEFAULT_NOTIFICATION_FREQUENCY_SECS};
use tracing::warn;

/// Runtime knobs of one engine that are not part of its persisted config.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// How far back a new search without an explicit watermark starts.
    pub backdate: TimeDelta,
    /// Origin for `distance_miles` enrichment. Unset leaves distances empty.
    pub home: Option<GeoPoint>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backdate: TimeDelta::hours(24),
            home: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub notification_frequency_secs: u64,
    pub backdate_hours: i64,
    pub home: Option<GeoPoint>,
    pub state_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub discord_webhook_url: Option<String>,
    pub http_timeout_secs: u64,
}

impl NotifierSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            notification_frequency_secs: var("LISTWATCH_NOTIFICATION_FREQUENCY_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_NOTIFICATION_FREQUENCY_SECS),
            backdate_hours: var("LISTWATCH_BACKDATE_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
            home: var("LISTWATCH_HOME_LAT_LONG").and_then(|v| match v.parse() {
                Ok(point) => Some(point),
                Err(err) => {
                    warn!(error = %err, "ignoring LISTWATCH_HOME_LAT_LONG");
                    None
                }
            }),
            state_dir: var("LISTWATCH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state")),
            workspace_root: var("LISTWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            discord_webhook_url: var("LISTWATCH_DISCORD_WEBHOOK_URL").filter(|v| !v.is_empty()),
            http_timeout_secs: var("LISTWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let backdate = TimeDelta::try_hours(self.backdate_hours.max(0)).unwrap_or_else(|| {
            warn!(
                backdate_hours = self.backdate_hours,
                "LISTWATCH_BACKDATE_HOURS out of range; using 24"
            );
            TimeDelta::hours(24)
        });
        EngineSettings {
            backdate,
            home: self.home,
        }
    }
}
