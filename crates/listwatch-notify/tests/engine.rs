use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use listwatch_core::{
    ActiveSearch, EngineConfig, Filter, GeoPoint, Listing, Location, SearchSpec, SourceKind,
};
use listwatch_notify::{
    DeliveryError, EngineDeps, EngineError, EngineSettings, JobCallback, JobHandle,
    ManualScheduler, NotificationEngine, ScheduleStatus, Scheduler, SchedulerError, Sink,
    TickError, MAX_DELIVERY_ATTEMPTS,
};
use listwatch_sources::{ListingSource, SearchRegistry, SourceError};
use listwatch_storage::{ConfigStore, JsonFileConfigStore, MemoryConfigStore};
use tokio::sync::Notify;
use uuid::Uuid;

fn t(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 24, 12, minute, 0)
        .single()
        .unwrap()
}

fn listing(id: &str, price: f64, created: u32, updated: u32) -> Listing {
    Listing {
        id: id.to_string(),
        title: format!("item {id}"),
        body: String::new(),
        url: format!("https://example.org/{id}"),
        price,
        created_at: t(created),
        updated_at: t(updated),
        location: Location {
            city: Some("Portland".into()),
            state: Some("OR".into()),
            latitude: 45.5152,
            longitude: -122.6784,
        },
        distance_miles: None,
        image_urls: vec![],
        thumbnail_url: None,
        attributes: BTreeMap::new(),
    }
}

/// Returns stored listings newer than the watermark in insertion order, which
/// is deliberately not newest-first.
#[derive(Default)]
struct ScriptedSource {
    listings: Mutex<HashMap<Uuid, Vec<Listing>>>,
    failing: Mutex<HashSet<Uuid>>,
    registry: SearchRegistry,
    calls: AtomicUsize,
    /// Also return listings whose `updated_at` is past the watermark.
    match_updated: AtomicBool,
}

impl ScriptedSource {
    fn push(&self, spec: &SearchSpec, listing: Listing) {
        self.listings
            .lock()
            .unwrap()
            .entry(spec.key())
            .or_default()
            .push(listing);
    }

    fn set_failing(&self, spec: &SearchSpec, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(spec.key());
        } else {
            set.remove(&spec.key());
        }
    }
}

#[async_trait]
impl ListingSource for ScriptedSource {
    async fn get_listings(
        &self,
        spec: &SearchSpec,
        after: DateTime<Utc>,
    ) -> Result<Vec<Listing>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&spec.key()) {
            return Err(SourceError::Backend("upstream timed out".into()));
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(&spec.key())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|l| {
                l.created_at > after
                    || (self.match_updated.load(Ordering::SeqCst) && l.updated_at > after)
            })
            .collect())
    }

    fn register_search(&self, spec: &SearchSpec) {
        self.registry.register(spec);
    }

    fn remove_search(&self, spec: &SearchSpec) {
        self.registry.remove(spec);
    }
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<Listing>>,
    fail_once: Mutex<HashSet<String>>,
    fail_always: Mutex<HashSet<String>>,
    reject: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    block_at_call: Option<usize>,
    blocked: AtomicBool,
    blocked_signal: Notify,
}

impl RecordingSink {
    fn blocking_at(call: usize) -> Self {
        Self {
            block_at_call: Some(call),
            ..Self::default()
        }
    }

    fn ids(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|l| l.id.clone())
            .collect()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn notify(&self, listing: &Listing) -> Result<(), DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.block_at_call == Some(call) && !self.blocked.swap(true, Ordering::SeqCst) {
            self.blocked_signal.notify_one();
            std::future::pending::<()>().await;
        }
        if self.reject.lock().unwrap().contains(&listing.id) {
            return Err(DeliveryError::Rejected(format!("embed for {} is invalid", listing.id)));
        }
        if self.fail_always.lock().unwrap().contains(&listing.id) {
            return Err(DeliveryError::Other(format!("channel unavailable for {}", listing.id)));
        }
        if self.fail_once.lock().unwrap().remove(&listing.id) {
            return Err(DeliveryError::Other(format!("channel rejected {}", listing.id)));
        }
        self.delivered.lock().unwrap().push(listing.clone());
        Ok(())
    }
}

struct Harness {
    engine: NotificationEngine,
    scheduler: Arc<ManualScheduler>,
    store: Arc<MemoryConfigStore>,
}

impl Harness {
    async fn fire(&self) -> bool {
        let job = self.engine.job().await.expect("job scheduled");
        self.scheduler.fire(job).await
    }
}

async fn start(
    config: EngineConfig,
    source: Arc<ScriptedSource>,
    sink: Arc<RecordingSink>,
    settings: EngineSettings,
) -> Harness {
    let scheduler = Arc::new(ManualScheduler::new());
    let store = Arc::new(MemoryConfigStore::new());
    let engine = NotificationEngine::start(
        "test",
        EngineDeps {
            source,
            sink,
            scheduler: scheduler.clone(),
            store: store.clone(),
        },
        settings,
        config,
    )
    .await
    .expect("engine starts");
    Harness {
        engine,
        scheduler,
        store,
    }
}

fn craigslist(query: &str) -> SearchSpec {
    SearchSpec::new(SourceKind::Craigslist).with_param("query", query)
}

fn config_with(specs: &[&SearchSpec], watermark: DateTime<Utc>) -> EngineConfig {
    let mut config = EngineConfig::default().with_frequency(60);
    config.active_searches = specs
        .iter()
        .map(|spec| ActiveSearch::new((*spec).clone(), watermark))
        .collect();
    config
}

#[tokio::test]
async fn price_filter_then_oldest_update_first() {
    let spec = craigslist("desk");
    let source = Arc::new(ScriptedSource::default());
    source.push(&spec, listing("p300", 300.0, 10, 20));
    source.push(&spec, listing("p600", 600.0, 11, 15));
    source.push(&spec, listing("p100", 100.0, 12, 30));
    let sink = Arc::new(RecordingSink::default());

    let mut config = config_with(&[&spec], t(0));
    config.set_filter("price", Filter::at_most(500.0));
    let h = start(config, source, sink.clone(), EngineSettings::default()).await;

    let report = h.engine.run_tick().await.unwrap();
    assert_eq!(report.found, 3);
    assert_eq!(report.matched, 2);
    assert_eq!(report.delivered, 2);
    assert_eq!(sink.ids(), vec!["p300", "p100"]);
}

#[tokio::test]
async fn watermark_is_batch_maximum_and_blocks_renotification() {
    let spec = craigslist("bike");
    let source = Arc::new(ScriptedSource::default());
    source.push(&spec, listing("a", 1.0, 5, 5));
    source.push(&spec, listing("b", 1.0, 9, 9));
    source.push(&spec, listing("c", 1.0, 7, 7));
    let sink = Arc::new(RecordingSink::default());
    let h = start(
        config_with(&[&spec], t(0)),
        source.clone(),
        sink.clone(),
        EngineSettings::default(),
    )
    .await;

    assert!(h.fire().await);
    assert_eq!(h.engine.config().await.active_searches[0].watermark, t(9));
    assert_eq!(sink.ids(), vec!["a", "c", "b"]);

    assert!(h.fire().await);
    assert_eq!(sink.ids().len(), 3);

    // Created before the watermark; never surfaces.
    source.push(&spec, listing("late", 1.0, 8, 40));
    source.push(&spec, listing("d", 1.0, 12, 12));
    let mut watermarks = vec![h.engine.config().await.active_searches[0].watermark];
    for _ in 0..3 {
        h.engine.run_tick().await.unwrap();
        watermarks.push(h.engine.config().await.active_searches[0].watermark);
    }
    assert!(watermarks.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(sink.ids(), vec!["a", "c", "b", "d"]);
}

#[tokio::test]
async fn delivery_order_spans_all_searches() {
    let bikes = craigslist("bike");
    let desks = craigslist("desk");
    let source = Arc::new(ScriptedSource::default());
    source.push(&bikes, listing("bike-1", 1.0, 1, 4));
    source.push(&bikes, listing("bike-2", 1.0, 2, 1));
    source.push(&desks, listing("desk-1", 1.0, 3, 3));
    source.push(&desks, listing("desk-2", 1.0, 4, 2));
    let sink = Arc::new(RecordingSink::default());
    let h = start(
        config_with(&[&bikes, &desks], t(0)),
        source,
        sink.clone(),
        EngineSettings::default(),
    )
    .await;

    h.engine.run_tick().await.unwrap();
    assert_eq!(sink.ids(), vec!["bike-2", "desk-2", "desk-1", "bike-1"]);
    let delivered = sink.delivered.lock().unwrap().clone();
    assert!(delivered.windows(2).all(|w| w[0].updated_at <= w[1].updated_at));
}

#[tokio::test]
async fn config_is_persisted_only_when_new_listings_arrive() {
    let spec = craigslist("lamp");
    let source = Arc::new(ScriptedSource::default());
    let sink = Arc::new(RecordingSink::default());
    let h = start(
        config_with(&[&spec], t(0)),
        source.clone(),
        sink,
        EngineSettings::default(),
    )
    .await;

    h.engine.run_tick().await.unwrap();
    h.engine.run_tick().await.unwrap();
    assert_eq!(h.store.save_count(), 0);

    source.push(&spec, listing("lamp-1", 20.0, 3, 3));
    h.engine.run_tick().await.unwrap();
    assert_eq!(h.store.save_count(), 1);
    let saved = h.store.last_saved().unwrap();
    assert_eq!(saved.active_searches[0].watermark, t(3));

    h.engine.run_tick().await.unwrap();
    assert_eq!(h.store.save_count(), 1);
}

#[tokio::test]
async fn fetch_failure_keeps_watermark_and_other_searches_proceed() {
    let flaky = craigslist("flaky");
    let steady = craigslist("steady");
    let source = Arc::new(ScriptedSource::default());
    source.push(&flaky, listing("f1", 1.0, 5, 5));
    source.push(&steady, listing("s1", 1.0, 6, 6));
    source.set_failing(&flaky, true);
    let sink = Arc::new(RecordingSink::default());
    let h = start(
        config_with(&[&flaky, &steady], t(0)),
        source.clone(),
        sink.clone(),
        EngineSettings::default(),
    )
    .await;

    let report = h.engine.run_tick().await.unwrap();
    assert_eq!(report.failed_searches.len(), 1);
    assert_eq!(report.failed_searches[0].search_key, flaky.key());
    assert_eq!(sink.ids(), vec!["s1"]);
    let config = h.engine.config().await;
    assert_eq!(config.active_searches[0].watermark, t(0));
    assert_eq!(config.active_searches[1].watermark, t(6));

    source.set_failing(&flaky, false);
    let report = h.engine.run_tick().await.unwrap();
    assert!(report.failed_searches.is_empty());
    assert_eq!(sink.ids(), vec!["s1", "f1"]);
}

#[tokio::test]
async fn delivery_failure_leaves_rest_pending_for_next_tick() {
    let spec = craigslist("chair");
    let source = Arc::new(ScriptedSource::default());
    for (i, id) in ["c1", "c2", "c3"].iter().enumerate() {
        source.push(&spec, listing(id, 1.0, i as u32 + 1, i as u32 + 1));
    }
    let sink = Arc::new(RecordingSink::default());
    sink.fail_once.lock().unwrap().insert("c2".into());
    let h = start(
        config_with(&[&spec], t(0)),
        source.clone(),
        sink.clone(),
        EngineSettings::default(),
    )
    .await;

    let err = h.engine.run_tick().await.unwrap_err();
    assert!(matches!(
        err,
        TickError::Delivery {
            delivered: 1,
            remaining: 2,
            ..
        }
    ));
    assert_eq!(h.engine.pending_len().await, 2);
    assert_eq!(h.engine.config().await.active_searches[0].watermark, t(3));

    source.push(&spec, listing("c4", 1.0, 4, 4));
    let report = h.engine.run_tick().await.unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(sink.ids(), vec!["c1", "c2", "c3", "c4"]);
    assert_eq!(h.engine.pending_len().await, 0);
}

#[tokio::test]
async fn cancellation_flushes_remaining_listings_in_order() {
    let spec = craigslist("tent");
    let source = Arc::new(ScriptedSource::default());
    for i in 1..=5u32 {
        source.push(&spec, listing(&format!("t{i}"), 1.0, i, i));
    }
    let sink = Arc::new(RecordingSink::blocking_at(2));
    let h = start(
        config_with(&[&spec], t(0)),
        source,
        sink.clone(),
        EngineSettings::default(),
    )
    .await;

    let engine = h.engine.clone();
    let tick = tokio::spawn(async move { engine.run_tick().await });
    sink.blocked_signal.notified().await;
    assert_eq!(sink.ids(), vec!["t1", "t2"]);

    let shutdown = h.engine.shutdown().await;
    assert_eq!(shutdown.flushed, 0);

    let err = tick.await.unwrap().unwrap_err();
    match err {
        TickError::Cancelled { delivered, flush } => {
            assert_eq!(delivered, 2);
            assert_eq!(flush.flushed, 3);
            assert_eq!(flush.failed, 0);
        }
        other => panic!("expected cancellation, got {other}"),
    }
    assert_eq!(sink.ids(), vec!["t1", "t2", "t3", "t4", "t5"]);
    assert_eq!(h.engine.status().await, ScheduleStatus::Removed);
    assert_eq!(h.scheduler.job_count(), 0);
}

#[tokio::test]
async fn paused_engine_does_not_tick_and_unpause_does_not_replay() {
    let spec = craigslist("sofa");
    let source = Arc::new(ScriptedSource::default());
    source.push(&spec, listing("s1", 1.0, 1, 1));
    let sink = Arc::new(RecordingSink::default());
    let mut config = config_with(&[&spec], t(0));
    config.paused = true;
    let h = start(config, source.clone(), sink.clone(), EngineSettings::default()).await;

    let job = h.engine.job().await.unwrap();
    let info = h.scheduler.job(job).unwrap();
    assert!(info.paused);
    assert!(!info.run_immediately);
    assert_eq!(info.interval, std::time::Duration::from_secs(60));
    assert!(!h.fire().await);
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);

    h.engine.unpause().await.unwrap();
    assert_eq!(h.engine.status().await, ScheduleStatus::Active);
    assert!(h.fire().await);
    assert_eq!(sink.ids(), vec!["s1"]);

    h.engine.pause().await.unwrap();
    h.engine
        .create_search(craigslist("armchair"), Some(t(0)))
        .await
        .unwrap();
    assert!(!h.fire().await);
    h.engine.unpause().await.unwrap();
    assert!(h.fire().await);
    assert_eq!(sink.ids(), vec!["s1"]);
    assert!(!h.engine.config().await.paused);
}

#[tokio::test]
async fn new_search_is_backdated_registered_and_persisted() {
    let source = Arc::new(ScriptedSource::default());
    let sink = Arc::new(RecordingSink::default());
    let h = start(
        EngineConfig::default(),
        source.clone(),
        sink,
        EngineSettings::default(),
    )
    .await;

    let spec = craigslist("kayak");
    let before = Utc::now();
    h.engine.create_search(spec.clone(), None).await.unwrap();
    let config = h.engine.config().await;
    let watermark = config.active_searches[0].watermark;
    assert!(watermark <= before - chrono::TimeDelta::hours(24) + chrono::TimeDelta::seconds(5));
    assert!(watermark >= before - chrono::TimeDelta::hours(24) - chrono::TimeDelta::seconds(5));
    assert!(source.registry.is_registered(&spec));
    assert_eq!(h.store.last_saved(), Some(config));
}

#[tokio::test]
async fn distance_is_computed_only_when_missing() {
    let spec = craigslist("grill");
    let source = Arc::new(ScriptedSource::default());
    source.push(&spec, listing("near", 1.0, 1, 1));
    let mut preset = listing("preset", 1.0, 2, 2);
    preset.distance_miles = Some(3.0);
    source.push(&spec, preset);
    let sink = Arc::new(RecordingSink::default());
    let settings = EngineSettings {
        home: Some(GeoPoint::new(47.6062, -122.3321)),
        ..EngineSettings::default()
    };
    let mut config = config_with(&[&spec], t(0));
    config.set_filter("distance_miles", Filter::at_most(200.0));
    let h = start(config, source, sink.clone(), settings).await;

    h.engine.run_tick().await.unwrap();
    let delivered = sink.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 2);
    let near = delivered[0].distance_miles.unwrap();
    assert!((140.0..150.0).contains(&near), "got {near}");
    assert_eq!(delivered[1].distance_miles, Some(3.0));
    assert_eq!(h.engine.pending_len().await, 0);
}

#[tokio::test]
async fn restored_engine_reproduces_searches_and_filters() {
    let dir = tempfile::tempdir().unwrap();
    let file_store = JsonFileConfigStore::for_notifier(dir.path(), "bikes").unwrap();

    let a = craigslist("bike");
    let b = SearchSpec::new(SourceKind::Marketplace).with_param("query", "bike");
    let mut config = config_with(&[&a, &b], t(3));
    config.set_filter("price", Filter::at_most(800.0));
    config.set_filter(
        "title",
        Filter::Text {
            include_any: vec!["road".into()],
            exclude_any: vec!["kids".into()],
        },
    );
    file_store.save(&config).await.unwrap();

    let loaded = file_store.load().await.unwrap().unwrap();
    let source = Arc::new(ScriptedSource::default());
    let h = start(
        loaded,
        source.clone(),
        Arc::new(RecordingSink::default()),
        EngineSettings::default(),
    )
    .await;
    assert_eq!(h.engine.config().await, config);
    assert_eq!(source.registry.registrations(&a), 1);
    assert_eq!(source.registry.registrations(&b), 1);
}

#[tokio::test]
async fn teardown_is_idempotent_and_terminal() {
    let spec = craigslist("rug");
    let source = Arc::new(ScriptedSource::default());
    let h = start(
        config_with(&[&spec], t(0)),
        source.clone(),
        Arc::new(RecordingSink::default()),
        EngineSettings::default(),
    )
    .await;
    assert_eq!(h.scheduler.job_count(), 1);

    h.engine.teardown().await;
    h.engine.teardown().await;
    assert_eq!(h.engine.status().await, ScheduleStatus::Removed);
    assert_eq!(h.scheduler.job_count(), 0);
    assert!(!source.registry.is_registered(&spec));
    assert!(matches!(h.engine.run_tick().await, Err(TickError::TornDown)));
    assert!(h.engine.create_search(craigslist("mat"), None).await.is_err());

    h.engine.pause().await.unwrap();
    assert!(h.engine.config().await.paused);
    assert_eq!(h.engine.status().await, ScheduleStatus::Removed);
}

#[tokio::test]
async fn filters_can_be_replaced_and_removed() {
    let spec = craigslist("tv");
    let source = Arc::new(ScriptedSource::default());
    source.push(&spec, listing("tv-1", 250.0, 1, 1));
    let sink = Arc::new(RecordingSink::default());
    let h = start(
        config_with(&[&spec], t(0)),
        source,
        sink,
        EngineSettings::default(),
    )
    .await;

    h.engine.set_filter("price", Filter::at_most(100.0)).await.unwrap();
    assert!(!h.engine.should_notify(&listing("x", 250.0, 1, 1)).await);
    h.engine.set_filter("price", Filter::at_most(300.0)).await.unwrap();
    assert_eq!(h.engine.config().await.filters.len(), 1);
    assert!(h.engine.should_notify(&listing("x", 250.0, 1, 1)).await);

    assert!(h.engine.remove_filter("price").await.unwrap());
    assert!(!h.engine.remove_filter("price").await.unwrap());
    assert!(h.engine.config().await.filters.is_empty());
    assert_eq!(h.store.save_count(), 3);
}

#[tokio::test]
async fn rejected_listing_is_dropped_and_later_listings_still_arrive() {
    let spec = craigslist("dresser");
    let source = Arc::new(ScriptedSource::default());
    source.push(&spec, listing("bad", 1.0, 1, 1));
    source.push(&spec, listing("good-0", 1.0, 2, 2));
    let sink = Arc::new(RecordingSink::default());
    sink.reject.lock().unwrap().insert("bad".into());
    let h = start(
        config_with(&[&spec], t(0)),
        source.clone(),
        sink.clone(),
        EngineSettings::default(),
    )
    .await;

    let report = h.engine.run_tick().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(report.delivered, 1);

    for i in 1..5u32 {
        source.push(&spec, listing(&format!("good-{i}"), 1.0, 2 + i, 2 + i));
        let report = h.engine.run_tick().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 0);
    }
    assert_eq!(
        sink.ids(),
        vec!["good-0", "good-1", "good-2", "good-3", "good-4"]
    );
    assert_eq!(h.engine.pending_len().await, 0);
}

#[tokio::test]
async fn repeatedly_failing_listing_is_dropped_after_attempt_limit() {
    let spec = craigslist("piano");
    let source = Arc::new(ScriptedSource::default());
    source.push(&spec, listing("stuck", 1.0, 1, 1));
    source.push(&spec, listing("next", 1.0, 2, 2));
    let sink = Arc::new(RecordingSink::default());
    sink.fail_always.lock().unwrap().insert("stuck".into());
    let h = start(
        config_with(&[&spec], t(0)),
        source,
        sink.clone(),
        EngineSettings::default(),
    )
    .await;

    for _ in 1..MAX_DELIVERY_ATTEMPTS {
        let err = h.engine.run_tick().await.unwrap_err();
        assert!(matches!(err, TickError::Delivery { remaining: 2, .. }));
        assert!(sink.ids().is_empty());
    }
    let report = h.engine.run_tick().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(sink.ids(), vec!["next"]);
    assert_eq!(h.engine.pending_len().await, 0);
}

#[tokio::test]
async fn cancellation_flush_keeps_listing_the_sink_refused() {
    let spec = craigslist("canoe");
    let source = Arc::new(ScriptedSource::default());
    for i in 1..=5u32 {
        source.push(&spec, listing(&format!("t{i}"), 1.0, i, i));
    }
    let sink = Arc::new(RecordingSink::blocking_at(2));
    sink.fail_always.lock().unwrap().insert("t4".into());
    let h = start(
        config_with(&[&spec], t(0)),
        source,
        sink.clone(),
        EngineSettings::default(),
    )
    .await;

    let engine = h.engine.clone();
    let tick = tokio::spawn(async move { engine.run_tick().await });
    sink.blocked_signal.notified().await;

    let shutdown = h.engine.shutdown().await;
    assert_eq!(shutdown.flushed, 0);
    assert_eq!(shutdown.failed, 1);

    match tick.await.unwrap().unwrap_err() {
        TickError::Cancelled { delivered, flush } => {
            assert_eq!(delivered, 2);
            assert_eq!(flush.flushed, 2);
            assert_eq!(flush.failed, 1);
        }
        other => panic!("expected cancellation, got {other}"),
    }
    assert_eq!(sink.ids(), vec!["t1", "t2", "t3", "t5"]);
    assert_eq!(h.engine.pending_len().await, 1);
}

#[tokio::test]
async fn oversized_backdate_clamps_to_earliest_timestamp() {
    let source = Arc::new(ScriptedSource::default());
    let settings = EngineSettings {
        backdate: chrono::TimeDelta::hours(4_000_000_000),
        ..EngineSettings::default()
    };
    let h = start(
        EngineConfig::default(),
        source,
        Arc::new(RecordingSink::default()),
        settings,
    )
    .await;

    h.engine
        .create_search(craigslist("anvil"), None)
        .await
        .unwrap();
    assert_eq!(
        h.engine.config().await.active_searches[0].watermark,
        DateTime::<Utc>::MIN_UTC
    );
}

/// Hands out jobs from a [`ManualScheduler`] but refuses to pause them.
struct PauseRefusingScheduler {
    inner: ManualScheduler,
}

#[async_trait]
impl Scheduler for PauseRefusingScheduler {
    async fn add_recurring_job(
        &self,
        interval: std::time::Duration,
        callback: JobCallback,
        run_immediately: bool,
    ) -> Result<JobHandle, SchedulerError> {
        self.inner
            .add_recurring_job(interval, callback, run_immediately)
            .await
    }

    async fn pause(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        Err(SchedulerError::UnknownJob(handle))
    }

    async fn resume(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        self.inner.resume(handle).await
    }

    async fn remove(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        self.inner.remove(handle).await
    }
}

#[tokio::test]
async fn failed_start_removes_job_and_registrations() {
    let spec = craigslist("loom");
    let source = Arc::new(ScriptedSource::default());
    let scheduler = Arc::new(PauseRefusingScheduler {
        inner: ManualScheduler::new(),
    });
    let mut config = config_with(&[&spec], t(0));
    config.paused = true;

    let result = NotificationEngine::start(
        "loom",
        EngineDeps {
            source: source.clone(),
            sink: Arc::new(RecordingSink::default()),
            scheduler: scheduler.clone(),
            store: Arc::new(MemoryConfigStore::new()),
        },
        EngineSettings::default(),
        config,
    )
    .await;

    assert!(matches!(result, Err(EngineError::Scheduler(_))));
    assert_eq!(scheduler.inner.job_count(), 0);
    assert!(!source.registry.is_registered(&spec));
}

#[tokio::test]
async fn reposted_listing_is_not_delivered_twice() {
    let spec = craigslist("bookshelf");
    let source = Arc::new(ScriptedSource::default());
    source.match_updated.store(true, Ordering::SeqCst);
    source.push(&spec, listing("shelf", 1.0, 5, 5));
    let sink = Arc::new(RecordingSink::default());
    let h = start(
        config_with(&[&spec], t(0)),
        source.clone(),
        sink.clone(),
        EngineSettings::default(),
    )
    .await;

    h.engine.run_tick().await.unwrap();
    source.push(&spec, listing("shelf-bumped", 1.0, 5, 30));
    let report = h.engine.run_tick().await.unwrap();
    assert_eq!(report.found, 0);
    assert_eq!(sink.ids(), vec!["shelf"]);
    assert_eq!(h.engine.config().await.active_searches[0].watermark, t(5));
}
