//! Recurring-job scheduling contract and its implementations.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::debug;
use uuid::Uuid;

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type JobCallback = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(pub Uuid);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cron scheduler error: {0:?}")]
    Cron(JobSchedulerError),
    #[error("unknown job {0}")]
    UnknownJob(JobHandle),
}

impl From<JobSchedulerError> for SchedulerError {
    fn from(err: JobSchedulerError) -> Self {
        SchedulerError::Cron(err)
    }
}

/// Runs one callback on a fixed interval, with pause/resume/remove per job.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn add_recurring_job(
        &self,
        interval: Duration,
        callback: JobCallback,
        run_immediately: bool,
    ) -> Result<JobHandle, SchedulerError>;

    async fn pause(&self, handle: JobHandle) -> Result<(), SchedulerError>;

    async fn resume(&self, handle: JobHandle) -> Result<(), SchedulerError>;

    async fn remove(&self, handle: JobHandle) -> Result<(), SchedulerError>;
}

/// [`Scheduler`] backed by `tokio-cron-scheduler`.
///
/// Pausing does not unschedule the job; firings are skipped while the job's
/// flag is set.
pub struct CronScheduler {
    inner: JobScheduler,
    paused: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl CronScheduler {
    pub async fn start() -> Result<Self, SchedulerError> {
        let inner = JobScheduler::new().await?;
        inner.start().await?;
        Ok(Self {
            inner,
            paused: Mutex::new(HashMap::new()),
        })
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.clone();
        inner.shutdown().await?;
        Ok(())
    }

    fn flag(&self, handle: JobHandle) -> Result<Arc<AtomicBool>, SchedulerError> {
        self.paused
            .lock()
            .ok()
            .and_then(|map| map.get(&handle.0).cloned())
            .ok_or(SchedulerError::UnknownJob(handle))
    }
}

#[async_trait]
impl Scheduler for CronScheduler {
    async fn add_recurring_job(
        &self,
        interval: Duration,
        callback: JobCallback,
        run_immediately: bool,
    ) -> Result<JobHandle, SchedulerError> {
        let paused = Arc::new(AtomicBool::new(false));
        let flag = paused.clone();
        let job_callback = callback.clone();
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let flag = flag.clone();
            let callback = job_callback.clone();
            Box::pin(async move {
                if !flag.load(Ordering::SeqCst) {
                    callback().await;
                }
            })
        })?;
        let id = self.inner.add(job).await?;
        if let Ok(mut map) = self.paused.lock() {
            map.insert(id, paused.clone());
        }

        if run_immediately {
            tokio::spawn(async move {
                if !paused.load(Ordering::SeqCst) {
                    callback().await;
                }
            });
        }
        debug!(job = %id, ?interval, "added recurring job");
        Ok(JobHandle(id))
    }

    async fn pause(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        self.flag(handle)?.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        self.flag(handle)?.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        let known = self
            .paused
            .lock()
            .map(|mut map| map.remove(&handle.0).is_some())
            .unwrap_or(false);
        if !known {
            return Err(SchedulerError::UnknownJob(handle));
        }
        self.inner.remove(&handle.0).await?;
        debug!(job = %handle, "removed recurring job");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualJobInfo {
    pub interval: Duration,
    pub run_immediately: bool,
    pub paused: bool,
}

struct ManualJob {
    info: ManualJobInfo,
    callback: JobCallback,
}

/// Deterministic [`Scheduler`] whose jobs only run when [`ManualScheduler::fire`]
/// is called. Useful for embedding the engine in a host that owns its own
/// clock, and for tests.
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<HashMap<Uuid, ManualJob>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, handle: JobHandle) -> Option<ManualJobInfo> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(&handle.0).map(|j| j.info))
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    /// Runs the job once unless it is paused or removed. Returns whether it ran.
    pub async fn fire(&self, handle: JobHandle) -> bool {
        let callback = self.jobs.lock().ok().and_then(|jobs| {
            jobs.get(&handle.0)
                .filter(|j| !j.info.paused)
                .map(|j| j.callback.clone())
        });
        match callback {
            Some(callback) => {
                callback().await;
                true
            }
            None => false,
        }
    }

    /// Fires every unpaused job once. Returns how many ran.
    pub async fn fire_all(&self) -> usize {
        let handles: Vec<_> = self
            .jobs
            .lock()
            .map(|jobs| jobs.keys().copied().map(JobHandle).collect())
            .unwrap_or_default();
        let mut ran = 0;
        for handle in handles {
            if self.fire(handle).await {
                ran += 1;
            }
        }
        ran
    }

    fn set_paused(&self, handle: JobHandle, paused: bool) -> Result<(), SchedulerError> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| SchedulerError::UnknownJob(handle))?;
        let job = jobs
            .get_mut(&handle.0)
            .ok_or(SchedulerError::UnknownJob(handle))?;
        job.info.paused = paused;
        Ok(())
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn add_recurring_job(
        &self,
        interval: Duration,
        callback: JobCallback,
        run_immediately: bool,
    ) -> Result<JobHandle, SchedulerError> {
        let id = Uuid::new_v4();
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(
                id,
                ManualJob {
                    info: ManualJobInfo {
                        interval,
                        run_immediately,
                        paused: false,
                    },
                    callback,
                },
            );
        }
        Ok(JobHandle(id))
    }

    async fn pause(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        self.set_paused(handle, true)
    }

    async fn resume(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        self.set_paused(handle, false)
    }

    async fn remove(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        let removed = self
            .jobs
            .lock()
            .map(|mut jobs| jobs.remove(&handle.0).is_some())
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(SchedulerError::UnknownJob(handle))
        }
    }
}
