//! Notification engine, sinks and scheduling for listwatch.

pub mod engine;
pub mod scheduler;
pub mod settings;
pub mod sink;

pub use engine::{
    should_notify, EngineDeps, EngineError, FlushOutcome, NotificationEngine, ScheduleStatus,
    SearchFailure, TickError, TickReport, MAX_DELIVERY_ATTEMPTS,
};
pub use scheduler::{
    CronScheduler, JobCallback, JobFuture, JobHandle, ManualJobInfo, ManualScheduler, Scheduler,
    SchedulerError,
};
pub use settings::{EngineSettings, NotifierSettings};
pub use sink::{embed_for, ChannelEmbed, ChannelSink, DeliveryError, EmbedImage, LogSink, Sink};

pub const CRATE_NAME: &str = "listwatch-notify";
