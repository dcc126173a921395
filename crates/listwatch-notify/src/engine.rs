//! The notification engine: owns active searches and drives the
//! poll → filter → deliver cycle on every scheduler tick.
//!
//! All mutable state of one engine lives behind a single async mutex, so a
//! tick is serialized with `create_search`, `pause` and friends. Listings
//! that matched but were not yet delivered sit in an ordered pending queue
//! that survives a failed or interrupted tick; the next tick, or the flush
//! run on cancellation, delivers them first. A listing the sink rejects
//! permanently, or that fails [`MAX_DELIVERY_ATTEMPTS`] times, is dropped so
//! it cannot hold back the listings queued behind it.
//!
//! Watermarks track `created_at`. A listing reposted with a newer
//! `updated_at` but a `created_at` at or before the watermark was already
//! seen and is not delivered again.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use listwatch_core::{distance_miles, ActiveSearch, EngineConfig, Filter, Listing, SearchSpec, Timestamp};
use listwatch_sources::ListingSource;
use listwatch_storage::{ConfigStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::scheduler::{JobCallback, JobFuture, JobHandle, Scheduler, SchedulerError};
use crate::settings::EngineSettings;
use crate::sink::{DeliveryError, Sink};

/// Transient delivery failures tolerated per listing before it is dropped.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Active,
    Paused,
    Removed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub flushed: usize,
    pub failed: usize,
}

impl fmt::Display for FlushOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flushed {}, {} failed", self.flushed, self.failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFailure {
    pub search_key: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub searched: usize,
    pub found: usize,
    pub matched: usize,
    pub delivered: usize,
    /// Listings given up on after a permanent or repeated delivery failure.
    pub dropped: usize,
    pub failed_searches: Vec<SearchFailure>,
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("persisting engine config: {0}")]
    Persist(#[from] StoreError),
    #[error("delivery failed after {delivered} listings, {remaining} still pending: {source}")]
    Delivery {
        delivered: usize,
        remaining: usize,
        #[source]
        source: DeliveryError,
    },
    #[error("tick cancelled after {delivered} deliveries; {flush}")]
    Cancelled { delivered: usize, flush: FlushOutcome },
    #[error("engine has been torn down")]
    TornDown,
}

impl TickError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TickError::Cancelled { .. })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Persist(#[from] StoreError),
    #[error("engine has been torn down")]
    TornDown,
}

/// External collaborators of one engine.
pub struct EngineDeps {
    pub source: Arc<dyn ListingSource>,
    pub sink: Arc<dyn Sink>,
    pub scheduler: Arc<dyn Scheduler>,
    pub store: Arc<dyn ConfigStore>,
}

/// True unless a filter whose field is present on `listing` rejects it.
///
/// A filter that cannot evaluate the field's value rejects the listing.
pub fn should_notify(filters: &BTreeMap<String, Filter>, listing: &Listing) -> bool {
    for (field, filter) in filters {
        let Some(value) = listing.field(field) else {
            continue;
        };
        match filter.test(&value) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                warn!(listing_id = %listing.id, field = %field, error = %err, "filter failed; rejecting listing");
                return false;
            }
        }
    }
    true
}

struct PendingListing {
    listing: Listing,
    attempts: u32,
}

impl PendingListing {
    /// Records a failed send. Returns true if the listing should be dropped.
    fn record_failure(&mut self, err: &DeliveryError) -> bool {
        self.attempts += 1;
        err.is_permanent() || self.attempts >= MAX_DELIVERY_ATTEMPTS
    }
}

struct EngineState {
    config: EngineConfig,
    pending: VecDeque<PendingListing>,
    job: Option<JobHandle>,
    status: ScheduleStatus,
}

struct EngineInner {
    name: String,
    deps: EngineDeps,
    settings: EngineSettings,
    cancel: CancellationToken,
    state: Mutex<EngineState>,
}

#[derive(Clone)]
pub struct NotificationEngine {
    inner: Arc<EngineInner>,
}

impl NotificationEngine {
    /// Registers the config's searches with the source and schedules the
    /// recurring poll. The first poll runs immediately unless `config.paused`.
    pub async fn start(
        name: impl Into<String>,
        deps: EngineDeps,
        settings: EngineSettings,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        for search in &config.active_searches {
            deps.source.register_search(&search.spec);
        }

        let paused = config.paused;
        let interval = Duration::from_secs(config.notification_frequency_seconds.max(1));
        let inner = Arc::new(EngineInner {
            name: name.into(),
            deps,
            settings,
            cancel: CancellationToken::new(),
            state: Mutex::new(EngineState {
                config,
                pending: VecDeque::new(),
                job: None,
                status: if paused {
                    ScheduleStatus::Paused
                } else {
                    ScheduleStatus::Active
                },
            }),
        });

        let callback = tick_callback(Arc::downgrade(&inner));
        let mut state = inner.state.lock().await;
        let job = match inner
            .deps
            .scheduler
            .add_recurring_job(interval, callback, !paused)
            .await
        {
            Ok(job) => job,
            Err(err) => {
                for search in &state.config.active_searches {
                    inner.deps.source.remove_search(&search.spec);
                }
                return Err(err.into());
            }
        };
        state.job = Some(job);
        if paused {
            if let Err(err) = inner.deps.scheduler.pause(job).await {
                inner.teardown_locked(&mut state).await;
                return Err(err.into());
            }
        }
        drop(state);
        info!(notifier = %inner.name, %job, ?interval, paused, "notifier scheduled");

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of the persisted state.
    pub async fn config(&self) -> EngineConfig {
        self.inner.state.lock().await.config.clone()
    }

    pub async fn status(&self) -> ScheduleStatus {
        self.inner.state.lock().await.status
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn job(&self) -> Option<JobHandle> {
        self.inner.state.lock().await.job
    }

    /// Starts polling `spec`. Without `initial_watermark` the search looks
    /// back by the configured backdate window.
    pub async fn create_search(
        &self,
        spec: SearchSpec,
        initial_watermark: Option<Timestamp>,
    ) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        if state.status == ScheduleStatus::Removed {
            return Err(EngineError::TornDown);
        }
        let watermark = initial_watermark.unwrap_or_else(|| {
            Utc::now()
                .checked_sub_signed(self.inner.settings.backdate)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });
        self.inner.deps.source.register_search(&spec);
        info!(notifier = %self.inner.name, key = %spec.key(), source = %spec.source, %watermark, "created search");
        state.config.active_searches.push(ActiveSearch::new(spec, watermark));
        self.inner.deps.store.save(&state.config).await?;
        Ok(())
    }

    pub async fn set_filter(&self, field: impl Into<String>, filter: Filter) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        state.config.set_filter(field, filter);
        self.inner.deps.store.save(&state.config).await?;
        Ok(())
    }

    pub async fn remove_filter(&self, field: &str) -> Result<bool, EngineError> {
        let mut state = self.inner.state.lock().await;
        let removed = state.config.remove_filter(field).is_some();
        if removed {
            self.inner.deps.store.save(&state.config).await?;
        }
        Ok(removed)
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.set_paused(true).await
    }

    /// Resumes polling. The next tick only sees listings past each watermark.
    pub async fn unpause(&self) -> Result<(), EngineError> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        state.config.paused = paused;
        match (state.status, state.job) {
            (ScheduleStatus::Active, Some(job)) if paused => {
                self.inner.deps.scheduler.pause(job).await?;
                state.status = ScheduleStatus::Paused;
            }
            (ScheduleStatus::Paused, Some(job)) if !paused => {
                self.inner.deps.scheduler.resume(job).await?;
                state.status = ScheduleStatus::Active;
            }
            _ => {}
        }
        debug!(notifier = %self.inner.name, paused, status = ?state.status, "pause state changed");
        self.inner.deps.store.save(&state.config).await?;
        Ok(())
    }

    pub async fn should_notify(&self, listing: &Listing) -> bool {
        let state = self.inner.state.lock().await;
        should_notify(&state.config.filters, listing)
    }

    /// Runs one poll cycle now, regardless of the pause state.
    pub async fn run_tick(&self) -> Result<TickReport, TickError> {
        self.inner.tick(false).await
    }

    /// Removes the scheduled job and deregisters every search. Safe to call
    /// more than once.
    pub async fn teardown(&self) {
        let mut state = self.inner.state.lock().await;
        self.inner.teardown_locked(&mut state).await;
    }

    /// Cancels an in-flight delivery loop, waits for its flush, delivers any
    /// listing still pending, then tears the engine down.
    pub async fn shutdown(&self) -> FlushOutcome {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.lock().await;
        let outcome = self.inner.flush(&mut state.pending).await;
        self.inner.teardown_locked(&mut state).await;
        outcome
    }
}

fn tick_callback(engine: Weak<EngineInner>) -> JobCallback {
    Arc::new(move || -> JobFuture {
        let engine = engine.clone();
        Box::pin(async move {
            if let Some(engine) = engine.upgrade() {
                engine.scheduled_tick().await;
            }
        })
    })
}

impl EngineInner {
    async fn scheduled_tick(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.tick(true).await {
            Ok(report) => debug!(
                notifier = %self.name,
                found = report.found,
                matched = report.matched,
                delivered = report.delivered,
                dropped = report.dropped,
                "tick complete"
            ),
            Err(err) if err.is_cancelled() => info!(notifier = %self.name, error = %err, "tick cancelled"),
            Err(err) => error!(notifier = %self.name, error = %err, "tick failed"),
        }
    }

    fn enrich(&self, mut listing: Listing) -> Listing {
        if listing.distance_miles.is_none() {
            if let Some(home) = self.settings.home {
                listing.distance_miles = Some(distance_miles(home, listing.location.geo_point()));
            }
        }
        listing
    }

    async fn tick(&self, only_if_active: bool) -> Result<TickReport, TickError> {
        let mut state = self.state.lock().await;
        match state.status {
            ScheduleStatus::Removed => return Err(TickError::TornDown),
            ScheduleStatus::Paused if only_if_active => return Ok(TickReport::default()),
            _ => {}
        }

        let mut report = TickReport {
            searched: state.config.active_searches.len(),
            ..TickReport::default()
        };
        let mut found = Vec::new();
        for search in state.config.active_searches.iter_mut() {
            let batch = match self.deps.source.get_listings(&search.spec, search.watermark).await {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(notifier = %self.name, key = %search.spec.key(), error = %err, "fetching listings failed");
                    report.failed_searches.push(SearchFailure {
                        search_key: search.spec.key(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            let watermark = search.watermark;
            let batch: Vec<Listing> = batch
                .into_iter()
                .filter(|l| l.created_at > watermark)
                .map(|l| self.enrich(l))
                .collect();
            if let Some(newest) = batch.iter().map(|l| l.created_at).max() {
                search.advance(newest);
                debug!(notifier = %self.name, watermark = %search.watermark, "most recent listing seen");
            }
            found.extend(batch);
        }
        report.found = found.len();
        debug!(
            notifier = %self.name,
            found = found.len(),
            searches = report.searched,
            "collected new listings"
        );

        found.sort_by_key(|l| l.updated_at);
        found.retain(|l| should_notify(&state.config.filters, l));
        report.matched = found.len();
        if report.found > report.matched {
            debug!(
                notifier = %self.name,
                filtered_out = report.found - report.matched,
                remaining = report.matched,
                "applied filters"
            );
        }
        state.pending.extend(
            found
                .into_iter()
                .map(|listing| PendingListing { listing, attempts: 0 }),
        );

        if report.found > 0 {
            self.deps.store.save(&state.config).await?;
        }

        self.deliver_pending(&mut state.pending, &mut report).await?;
        Ok(report)
    }

    /// Delivers the queue front to back, popping each listing once sent.
    ///
    /// A transient failure stops the loop with the listing left at the front.
    /// A permanent failure, or the last allowed attempt, drops it and moves on.
    async fn deliver_pending(
        &self,
        pending: &mut VecDeque<PendingListing>,
        report: &mut TickReport,
    ) -> Result<(), TickError> {
        loop {
            let Some(next) = pending.front() else {
                return Ok(());
            };
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.deps.sink.notify(&next.listing) => Some(result),
            };
            match outcome {
                Some(Ok(())) => {
                    pending.pop_front();
                    report.delivered += 1;
                }
                Some(Err(source)) => {
                    let Some(entry) = pending.front_mut() else {
                        return Ok(());
                    };
                    if entry.record_failure(&source) {
                        warn!(
                            notifier = %self.name,
                            listing_id = %entry.listing.id,
                            attempts = entry.attempts,
                            error = %source,
                            "dropping undeliverable listing"
                        );
                        pending.pop_front();
                        report.dropped += 1;
                        continue;
                    }
                    return Err(TickError::Delivery {
                        delivered: report.delivered,
                        remaining: pending.len(),
                        source,
                    });
                }
                None => {
                    if !pending.is_empty() {
                        info!(
                            notifier = %self.name,
                            remaining = pending.len(),
                            "delivery interrupted; flushing pending listings before cancelling"
                        );
                    }
                    let flush = self.flush(pending).await;
                    return Err(TickError::Cancelled {
                        delivered: report.delivered,
                        flush,
                    });
                }
            }
        }
    }

    /// Attempts every pending listing once, in order. Failures stay queued
    /// unless they are permanent or out of attempts.
    async fn flush(&self, pending: &mut VecDeque<PendingListing>) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let mut failed = VecDeque::new();
        while let Some(mut entry) = pending.pop_front() {
            match self.deps.sink.notify(&entry.listing).await {
                Ok(()) => outcome.flushed += 1,
                Err(err) => {
                    outcome.failed += 1;
                    let drop_it = entry.record_failure(&err);
                    warn!(
                        notifier = %self.name,
                        listing_id = %entry.listing.id,
                        error = %err,
                        dropped = drop_it,
                        "flush delivery failed"
                    );
                    if !drop_it {
                        failed.push_back(entry);
                    }
                }
            }
        }
        *pending = failed;
        outcome
    }

    async fn teardown_locked(&self, state: &mut EngineState) {
        if state.status == ScheduleStatus::Removed {
            return;
        }
        debug!(notifier = %self.name, "cleaning up notifier");
        state.status = ScheduleStatus::Removed;
        if let Some(job) = state.job.take() {
            if let Err(err) = self.deps.scheduler.remove(job).await {
                warn!(notifier = %self.name, %job, error = %err, "removing scheduled job failed");
            }
        }
        for search in &state.config.active_searches {
            self.deps.source.remove_search(&search.spec);
        }
    }
}
