use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use canceler::activities::TaskActivities;
use canceler::client::{HttpTaskClient, InMemoryTaskClient, TaskClient};
use canceler::codec::{OversizeCodec, Payload, PayloadCodec};
use canceler::config::Settings;
use canceler::runtime::child::{ChildLauncher, ChildSpec, ParentClosePolicy, Signal};
use canceler::runtime::clock::SystemClock;
use canceler::runtime::dispatch::Dispatcher;
use canceler::runtime::launcher::LocalLauncher;
use canceler::runtime::redis_storage::RedisBlobStore;
use canceler::runtime::storage::{BlobStore, FileBlobStore};
use canceler::runtime::task::TaskId;
use canceler::workflows::{BulkCancelConfig, BulkCancelWorkflow, CancelOutcome, SpawnTreeBody, SpawnTreeConfig};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML settings file; the environment is used when omitted
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Terminate every running task with the workload tag via the task API
    Cancel {
        /// Overrides WORKLOAD_ID
        #[arg(long)]
        workload: Option<String>,
    },

    /// Run a spawn tree on the local runtime until interrupted
    Spawn {
        #[arg(long, default_value_t = 2000)]
        children: u32,

        #[arg(long, default_value_t = 500)]
        grandchildren: u32,
    },

    /// Spawn a small local tree, then bulk-cancel it, all in memory
    Demo {
        #[arg(long, default_value_t = 20)]
        children: u32,

        #[arg(long, default_value_t = 5)]
        grandchildren: u32,
    },

    /// Rewrite a JSON array of payloads through the oversize codec
    Codec {
        #[command(subcommand)]
        action: CodecAction,
    },
}

#[derive(Subcommand)]
enum CodecAction {
    Encode {
        #[arg(long, short)]
        input: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
    },
    Decode {
        #[arg(long, short)]
        input: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
    },
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::from_file(path)?,
        None => Settings::from_env()?,
    };
    Ok(settings)
}

fn dispatcher(client: Arc<dyn TaskClient>, settings: &Settings) -> Arc<Dispatcher> {
    let activities = TaskActivities::from_settings(client, settings);
    Arc::new(Dispatcher::new(
        Arc::new(activities),
        settings.retry_policy(),
        settings.operation_timeouts(),
    ))
}

fn blob_store(settings: &Settings) -> Result<Arc<dyn BlobStore>> {
    Ok(match &settings.payload_redis_url {
        Some(url) => Arc::new(RedisBlobStore::open(url).context("opening redis blob store")?),
        None => Arc::new(FileBlobStore::new(settings.payload_path.clone())),
    })
}

async fn run_cancel(settings: Settings, workload: Option<String>) -> Result<()> {
    let mut config = BulkCancelConfig::from_settings(&settings);
    if let Some(tag) = workload {
        config.tag = tag.into();
    }
    let client: Arc<dyn TaskClient> = Arc::new(HttpTaskClient::connect(&settings)?);
    let mut workflow = BulkCancelWorkflow::new(dispatcher(client, &settings), Arc::new(SystemClock), config);

    match workflow.run().await? {
        CancelOutcome::Success { attempts } => info!(attempts, "workload cancelled"),
        CancelOutcome::Exhausted { attempts } => bail!("workload still running after {attempts} reconciliation attempts"),
    }
    Ok(())
}

fn local_tree(
    settings: &Settings,
    children: u32,
    grandchildren: u32,
    park_interval: Option<Duration>,
) -> (InMemoryTaskClient, LocalLauncher, Arc<Dispatcher>, SpawnTreeConfig) {
    let registry = InMemoryTaskClient::new(Arc::new(SystemClock));
    let dispatcher = dispatcher(Arc::new(registry.clone()), settings);
    let mut config = SpawnTreeConfig {
        children,
        grandchildren,
        ..SpawnTreeConfig::from_settings(settings)
    };
    if let Some(interval) = park_interval {
        config.park_interval = interval;
    }
    let body = Arc::new(SpawnTreeBody::new(config.clone(), dispatcher.clone()));
    let launcher = LocalLauncher::new(registry.clone(), body);
    (registry, launcher, dispatcher, config)
}

fn root_spec(config: &SpawnTreeConfig) -> ChildSpec {
    ChildSpec {
        id: TaskId::from("cancelable-workflow"),
        parent: None,
        sequence: None,
        tag: config.tag.clone(),
        spawn: true,
        parent_close_policy: ParentClosePolicy::Terminate,
    }
}

async fn run_spawn(settings: Settings, children: u32, grandchildren: u32) -> Result<()> {
    let (registry, launcher, _, config) = local_tree(&settings, children, grandchildren, None);
    let root = launcher.start_child(root_spec(&config)).await?;
    info!(task_id = %root.id(), "spawn tree started; ctrl-c to cancel");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    root.signal(Signal::Cancel).await?;
    if let Err(e) = root.wait_result().await {
        warn!(error = %e, "root closed abnormally");
    }
    info!(running = registry.running_count(&config.tag), "spawn tree stopped");
    Ok(())
}

async fn run_demo(settings: Settings, children: u32, grandchildren: u32) -> Result<()> {
    let settings = Settings {
        confirm_timeout_seconds: 2,
        confirm_poll_seconds: 1,
        poll_interval_seconds: 1,
        max_polls: 5,
        ..settings
    };
    let (registry, launcher, dispatcher, config) =
        local_tree(&settings, children, grandchildren, Some(Duration::from_secs(1)));

    launcher.start_child(root_spec(&config)).await?;
    let expected = 1 + children as usize * (1 + grandchildren as usize);
    while registry.running_count(&config.tag) < expected {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(running = expected, "spawn tree is up");

    let mut workflow = BulkCancelWorkflow::new(
        dispatcher,
        Arc::new(SystemClock),
        BulkCancelConfig::from_settings(&settings),
    );
    let outcome = workflow.run().await?;
    info!(?outcome, running = registry.running_count(&config.tag), "demo finished");
    if !outcome.is_success() {
        bail!("demo workload did not drain");
    }
    Ok(())
}

async fn run_codec(settings: Settings, action: CodecAction) -> Result<()> {
    let codec = OversizeCodec::new(blob_store(&settings)?, settings.payload_min_bytes);
    let (input, output, encode) = match action {
        CodecAction::Encode { input, output } => (input, output, true),
        CodecAction::Decode { input, output } => (input, output, false),
    };

    let raw = tokio::fs::read(&input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let payloads: Vec<Payload> = serde_json::from_slice(&raw).context("input must be a JSON array of payloads")?;
    let rewritten = if encode {
        codec.encode(&payloads).await?
    } else {
        codec.decode(&payloads).await?
    };
    tokio::fs::write(&output, serde_json::to_vec_pretty(&rewritten)?)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    info!(count = rewritten.len(), output = %output.display(), "payloads written");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Cancel { workload } => run_cancel(settings, workload).await,
        Commands::Spawn { children, grandchildren } => run_spawn(settings, children, grandchildren).await,
        Commands::Demo { children, grandchildren } => run_demo(settings, children, grandchildren).await,
        Commands::Codec { action } => run_codec(settings, action).await,
    }
}
