use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use listwatch_core::{ActiveSearch, EngineConfig, Filter, SearchSpec, SourceKind};
use listwatch_notify::{
    ChannelSink, CronScheduler, EngineDeps, LogSink, NotificationEngine, NotifierSettings, Sink,
};
use listwatch_sources::FixtureListingSource;
use listwatch_storage::{ConfigStore, HttpClientConfig, JsonFileConfigStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "listwatch-cli")]
#[command(about = "Listing watch notifier command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll and deliver for the given notifiers (all saved ones by default) until Ctrl-C.
    Run {
        #[arg(long = "notifier")]
        notifiers: Vec<String>,
    },
    Search {
        #[command(subcommand)]
        command: SearchCommand,
    },
    Filter {
        #[command(subcommand)]
        command: FilterCommand,
    },
    Pause {
        name: String,
    },
    Unpause {
        name: String,
    },
    /// Print a notifier's saved config as JSON.
    Show {
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum SearchCommand {
    Add {
        name: String,
        #[arg(long)]
        source: SourceKind,
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Initial watermark. Defaults to now minus the backdate window.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Subcommand)]
enum FilterCommand {
    Set {
        name: String,
        field: String,
        #[arg(long)]
        min: Option<f64>,
        #[arg(long)]
        max: Option<f64>,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
    },
    Remove {
        name: String,
        field: String,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

fn build_filter(
    min: Option<f64>,
    max: Option<f64>,
    include: Vec<String>,
    exclude: Vec<String>,
) -> Result<Filter> {
    let numeric = min.is_some() || max.is_some();
    let text = !include.is_empty() || !exclude.is_empty();
    match (numeric, text) {
        (true, false) => {
            if let (Some(lo), Some(hi)) = (min, max) {
                if lo > hi {
                    bail!("--min {lo} is greater than --max {hi}");
                }
            }
            Ok(Filter::Numeric { min, max })
        }
        (false, true) => Ok(Filter::Text {
            include_any: include,
            exclude_any: exclude,
        }),
        (true, true) => bail!("use either --min/--max or --include/--exclude, not both"),
        (false, false) => bail!("a filter needs --min, --max, --include or --exclude"),
    }
}

struct Notifier {
    store: JsonFileConfigStore,
    config: EngineConfig,
}

impl Notifier {
    async fn open(settings: &NotifierSettings, name: &str) -> Result<Self> {
        let store = JsonFileConfigStore::for_notifier(&settings.state_dir, name)?;
        let config = store.load().await?.unwrap_or_else(|| {
            EngineConfig::default().with_frequency(settings.notification_frequency_secs)
        });
        Ok(Self { store, config })
    }

    async fn save(&self) -> Result<()> {
        self.store
            .save(&self.config)
            .await
            .with_context(|| format!("saving {}", self.store.path().display()))
    }
}

async fn saved_notifiers(state_dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(state_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", state_dir.display())),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if !stem.starts_with('.') {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn build_sink(settings: &NotifierSettings) -> Result<Arc<dyn Sink>> {
    match settings.discord_webhook_url.as_deref() {
        Some(url) => {
            let http = HttpClientConfig {
                timeout: Duration::from_secs(settings.http_timeout_secs),
                user_agent: Some(format!("listwatch/{}", env!("CARGO_PKG_VERSION"))),
                ..HttpClientConfig::default()
            };
            Ok(Arc::new(ChannelSink::new(url, http)?))
        }
        None => Ok(Arc::new(LogSink)),
    }
}

async fn run(settings: NotifierSettings, mut names: Vec<String>) -> Result<()> {
    if names.is_empty() {
        names = saved_notifiers(&settings.state_dir).await?;
    }
    if names.is_empty() {
        bail!(
            "no notifiers saved under {}; add one with `search add`",
            settings.state_dir.display()
        );
    }

    let source = Arc::new(FixtureListingSource::from_workspace(&settings.workspace_root).await?);
    info!(sources = ?source.enabled_sources(), "loaded source registry");
    let scheduler = Arc::new(CronScheduler::start().await?);
    let sink = build_sink(&settings)?;

    let mut engines = Vec::with_capacity(names.len());
    for name in &names {
        let notifier = Notifier::open(&settings, name).await?;
        let deps = EngineDeps {
            source: source.clone(),
            sink: sink.clone(),
            scheduler: scheduler.clone(),
            store: Arc::new(notifier.store),
        };
        let engine =
            NotificationEngine::start(name.clone(), deps, settings.engine_settings(), notifier.config)
                .await
                .with_context(|| format!("starting notifier {name}"))?;
        engines.push(engine);
    }
    info!(notifiers = engines.len(), "running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for engine in &engines {
        let outcome = engine.shutdown().await;
        if outcome.failed > 0 {
            warn!(notifier = engine.name(), %outcome, "listings left undelivered");
        } else {
            info!(notifier = engine.name(), %outcome, "notifier stopped");
        }
    }
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = NotifierSettings::from_env();

    match cli.command.unwrap_or(Commands::Run { notifiers: vec![] }) {
        Commands::Run { notifiers } => run(settings, notifiers).await?,
        Commands::Search {
            command:
                SearchCommand::Add {
                    name,
                    source,
                    params,
                    since,
                },
        } => {
            let mut notifier = Notifier::open(&settings, &name).await?;
            let spec = params
                .into_iter()
                .fold(SearchSpec::new(source), |spec, (k, v)| spec.with_param(k, v));
            let watermark = since.unwrap_or_else(|| Utc::now() - settings.engine_settings().backdate);
            println!("added search {} to {name} (since {watermark})", spec.key());
            notifier
                .config
                .active_searches
                .push(ActiveSearch::new(spec, watermark));
            notifier.save().await?;
        }
        Commands::Filter {
            command:
                FilterCommand::Set {
                    name,
                    field,
                    min,
                    max,
                    include,
                    exclude,
                },
        } => {
            let filter = build_filter(min, max, include, exclude)?;
            let mut notifier = Notifier::open(&settings, &name).await?;
            let replaced = notifier.config.set_filter(field.clone(), filter).is_some();
            notifier.save().await?;
            println!(
                "{} filter on {field} for {name}",
                if replaced { "replaced" } else { "set" }
            );
        }
        Commands::Filter {
            command: FilterCommand::Remove { name, field },
        } => {
            let mut notifier = Notifier::open(&settings, &name).await?;
            if notifier.config.remove_filter(&field).is_none() {
                bail!("{name} has no filter on {field}");
            }
            notifier.save().await?;
            println!("removed filter on {field} for {name}");
        }
        Commands::Pause { name } => {
            let mut notifier = Notifier::open(&settings, &name).await?;
            notifier.config.paused = true;
            notifier.save().await?;
            println!("paused {name}");
        }
        Commands::Unpause { name } => {
            let mut notifier = Notifier::open(&settings, &name).await?;
            notifier.config.paused = false;
            notifier.save().await?;
            println!("unpaused {name}");
        }
        Commands::Show { name } => {
            let notifier = Notifier::open(&settings, &name).await?;
            println!("{}", serde_json::to_string_pretty(&notifier.config)?);
        }
    }

    Ok(())
}
