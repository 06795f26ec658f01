use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use spindle_core::app::{AppBuilder, Background};
use spindle_core::config::SpindleConfig;
use spindle_core::domain::Task;
use spindle_core::impls::RedisStore;
use spindle_core::inspector::ContainerKind;
use spindle_core::runtime::handler_fn;
use spindle_core::{Broker, Client, EnqueueOptions, HandlerError, Inspector};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(about = "Enqueue, run, and inspect background tasks")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// JSON config file; flags below override it.
    #[arg(short, long, env = "SPINDLE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "SPINDLE_REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Key prefix shared by producers and workers.
    #[arg(long, env = "SPINDLE_NAMESPACE", global = true)]
    pub namespace: Option<String>,

    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue one task.
    Enqueue(EnqueueArgs),

    /// Print container sizes.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// List the tasks in one container.
    #[command(alias = "list")]
    Ls {
        /// enqueued, in_progress, scheduled, retry or dead
        state: String,

        #[arg(long)]
        json: bool,
    },

    /// Run a worker with the demo handlers `echo` and `flaky`.
    Work(WorkArgs),
}

#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Task type, e.g. `echo`.
    pub task_type: String,

    /// JSON payload.
    #[arg(short, long, default_value = "{}")]
    pub payload: String,

    #[arg(short, long, default_value = "default")]
    pub queue: String,

    #[arg(long, default_value_t = 25)]
    pub max_retry: u32,

    /// Per-attempt timeout in seconds; 0 disables it.
    #[arg(long, default_value_t = 1800)]
    pub timeout_secs: u64,

    /// Delay before the task becomes ready.
    #[arg(long)]
    pub in_secs: Option<u64>,

    /// Reject the task while another one with this key is alive.
    #[arg(long)]
    pub unique: Option<String>,

    #[arg(long, default_value_t = 86_400)]
    pub unique_ttl_secs: u64,
}

#[derive(Parser, Debug)]
pub struct WorkArgs {
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Queues in priority order, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Failure probability of the `flaky` handler.
    #[arg(long, default_value_t = 0.5)]
    pub flaky_rate: f64,

    /// Re-queue tasks left in progress by a crashed worker before starting.
    /// Only one worker per namespace should pass this.
    #[arg(long)]
    pub restore: bool,
}

/// Payload of the demo `echo` task.
#[derive(Debug, Serialize, Deserialize)]
struct Echo {
    message: String,
}

impl spindle_core::typed::Task for Echo {
    const TYPE: &'static str = "echo";
}

struct EchoHandler;

#[async_trait]
impl spindle_core::typed::Handler<Echo> for EchoHandler {
    async fn handle(&self, task: Echo) -> Result<(), HandlerError> {
        info!(message = %task.message, "echo");
        Ok(())
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SpindleConfig> {
    let mut config = match &cli.config {
        Some(path) => SpindleConfig::from_path(path)?,
        None => SpindleConfig::default(),
    };
    if let Some(url) = &cli.redis_url {
        config.store.redis_url = url.clone();
    }
    if let Some(namespace) = &cli.namespace {
        config.store.namespace = namespace.clone();
    }
    Ok(config)
}

async fn connect(config: &SpindleConfig) -> anyhow::Result<Broker> {
    let store = RedisStore::connect(&config.store.redis_url)
        .await
        .with_context(|| format!("connecting to {}", config.store.redis_url))?;
    Ok(Broker::new(Arc::new(store))
        .with_namespace(config.store.namespace.clone())
        .with_retention(config.store.dead_retention)
        .with_unique_ttl(config.store.unique_ttl))
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let broker = connect(&config).await?;

    match cli.command {
        Command::Enqueue(args) => enqueue(broker, args).await,
        Command::Stats { json } => stats(&broker, json).await,
        Command::Ls { state, json } => list(&broker, &state, json).await,
        Command::Work(args) => work(broker, config, args).await,
    }
}

async fn enqueue(broker: Broker, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;
    let task = Task::from_json(args.task_type.as_str(), payload);

    let mut opts = EnqueueOptions::new()
        .queue(args.queue)
        .max_retry(args.max_retry)
        .timeout(Duration::from_secs(args.timeout_secs));
    if let Some(secs) = args.in_secs {
        opts = opts.process_in(Duration::from_secs(secs));
    }
    if let Some(key) = args.unique {
        opts = opts.unique(key, Duration::from_secs(args.unique_ttl_secs));
    }

    let id = Client::new(broker).enqueue(task, opts).await?;
    println!("{id}");
    Ok(())
}

async fn stats(broker: &Broker, json: bool) -> anyhow::Result<()> {
    let stats = Inspector::for_broker(broker).current_stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("queued       {}", stats.queued);
        println!("in_progress  {}", stats.in_progress);
        println!("scheduled    {}", stats.scheduled);
        println!("retry        {}", stats.retry);
        println!("dead         {}", stats.dead);
    }
    Ok(())
}

async fn list(broker: &Broker, state: &str, json: bool) -> anyhow::Result<()> {
    let kind: ContainerKind = state.parse()?;
    let messages = Inspector::for_broker(broker).list_messages(kind).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    for msg in &messages {
        println!(
            "{}  {:<16} queue={} retried={}/{} payload={}{}",
            msg.id,
            msg.task_type,
            msg.queue,
            msg.retried,
            msg.max_retry,
            serde_json::Value::Object(msg.payload.clone()),
            msg.error_msg
                .as_deref()
                .map(|e| format!(" error={e:?}"))
                .unwrap_or_default(),
        );
    }
    println!("{} task(s) in {kind}", messages.len());
    Ok(())
}

async fn work(broker: Broker, config: SpindleConfig, args: WorkArgs) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&args.flaky_rate) {
        bail!("--flaky-rate must be between 0 and 1");
    }
    let flaky_rate = args.flaky_rate;

    let runtime = AppBuilder::new()
        .register::<Echo, _>(EchoHandler)?
        .handle(
            "flaky",
            Arc::new(handler_fn(move |task: Task| async move {
                if rand::random::<f64>() < flaky_rate {
                    return Err(HandlerError::failed("flaky handler failed on purpose"));
                }
                info!(payload = ?task.payload(), "flaky succeeded");
                Ok(())
            })),
        )?
        .expect_tasks(&["echo", "flaky"])
        .build()?;

    let mut processor = config.processor;
    if let Some(concurrency) = args.concurrency {
        processor = processor.with_concurrency(concurrency);
    }
    if !args.queues.is_empty() {
        processor = processor.with_queues(args.queues);
    }
    if args.restore {
        processor = processor.with_restore_on_start(true);
    }

    Background::new(broker, runtime)
        .with_processor_config(processor)
        .with_scheduler_config(config.scheduler)
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "could not listen for ctrl-c");
            }
        })
        .await?;
    Ok(())
}
