use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cdc_client::{CdcConfig, CdcSubscriber, ChangeEvent, DeliveryGuarantee};
use clap::{Args, Parser, Subcommand, ValueEnum};
use realtime_stream::{
    ActiveSessionsTopic, AlertsTopic, BackoffPolicy, EventHandlers, FileTokenStore, StaticToken,
    StreamClient, StreamConfig, StreamEndpoint, SystemMetricsTopic, TokenProvider,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// RustyDB realtime stream tool
///
/// Tails the metrics and monitoring streams, follows CDC subscriptions, and
/// polls or acknowledges change events over the REST change feed.
#[derive(Parser, Debug)]
#[command(name = "rustydb-stream")]
#[command(about = "Tail RustyDB realtime streams and CDC subscriptions")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// WebSocket base URL
    #[arg(long, env = "RUSTYDB_WS_URL", default_value = "ws://localhost:8080", global = true)]
    pub ws_url: String,

    /// CDC REST API root
    #[arg(
        long,
        env = "RUSTYDB_API_URL",
        default_value = cdc_client::DEFAULT_API_BASE_URL,
        global = true
    )]
    pub api_url: String,

    /// Bearer token; takes precedence over the token file
    #[arg(long, env = "RUSTYDB_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// JSON auth file holding the token, re-read on every connect
    #[arg(long, env = "RUSTYDB_TOKEN_FILE", global = true)]
    pub token_file: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "RUSTYDB_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Give up after this many reconnection attempts
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Retry every 5 seconds instead of backing off exponentially
    #[arg(long, global = true)]
    pub fixed_retry: bool,

    /// Reconnect when no heartbeat arrives for this many seconds
    #[arg(long, global = true)]
    pub heartbeat_timeout: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print payloads from the metrics or monitoring stream
    Tail {
        #[arg(value_enum)]
        stream: StreamKind,

        /// Channels to subscribe to; defaults depend on the stream
        #[arg(short, long = "channel")]
        channels: Vec<String>,

        /// Print decoded summaries for the built-in channels
        #[arg(long)]
        summary: bool,
    },

    /// Follow a CDC subscription, catching up over REST on every connect
    Cdc {
        subscription_id: Uuid,

        #[arg(long, value_enum, default_value_t = GuaranteeArg::AtLeastOnce)]
        guarantee: GuaranteeArg,

        /// Acknowledge pending events every this many seconds
        #[arg(long)]
        ack_every: Option<u64>,
    },

    /// Fetch change events over REST
    Poll {
        subscription_id: Uuid,

        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Continuation token from a previous page
        #[arg(long)]
        next_token: Option<String>,

        /// Follow continuation tokens until the feed is empty
        #[arg(long)]
        all: bool,

        /// Acknowledge the fetched events
        #[arg(long)]
        ack: bool,
    },

    /// Acknowledge change events by id
    Ack {
        subscription_id: Uuid,

        #[arg(required = true)]
        event_ids: Vec<Uuid>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Metrics,
    Monitoring,
}

impl StreamKind {
    fn default_channels(self) -> Vec<String> {
        let channels: &[&str] = match self {
            StreamKind::Metrics => &["system_metrics"],
            StreamKind::Monitoring => &["active_sessions", "alerts"],
        };
        channels.iter().map(|c| c.to_string()).collect()
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuaranteeArg {
    AtLeastOnce,
    AtMostOnce,
    ExactlyOnce,
}

impl From<GuaranteeArg> for DeliveryGuarantee {
    fn from(arg: GuaranteeArg) -> Self {
        match arg {
            GuaranteeArg::AtLeastOnce => DeliveryGuarantee::AtLeastOnce,
            GuaranteeArg::AtMostOnce => DeliveryGuarantee::AtMostOnce,
            GuaranteeArg::ExactlyOnce => DeliveryGuarantee::ExactlyOnce,
        }
    }
}

impl GlobalArgs {
    /// Validate command line arguments
    pub fn validate(&self) -> Result<()> {
        match self.log_level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
                    self.log_level
                ));
            }
        }

        if self.heartbeat_timeout == Some(0) {
            return Err(anyhow::anyhow!("Heartbeat timeout must be positive"));
        }

        Ok(())
    }

    /// Stream configuration for `endpoint` with the retry flags applied.
    pub fn stream_config(&self, endpoint: StreamEndpoint) -> Result<StreamConfig> {
        let mut config = match &endpoint {
            StreamEndpoint::Metrics => StreamConfig::metrics(),
            StreamEndpoint::Cdc(id) => StreamConfig::cdc(*id),
            _ => StreamConfig::monitoring(),
        }
        .with_endpoint(endpoint)
        .with_base_url(self.ws_url.clone());

        if self.fixed_retry {
            config = config.with_backoff(BackoffPolicy::fixed(Duration::from_secs(5)));
        }
        if let Some(max) = self.max_retries {
            config = config.with_max_reconnect_attempts(max);
        }
        if let Some(secs) = self.heartbeat_timeout {
            config = config.with_heartbeat_timeout(Duration::from_secs(secs));
        }

        config.validate().context("Invalid stream configuration")?;
        Ok(config)
    }

    /// Token source: explicit token, then token file, then the default auth file.
    pub fn token_provider(&self) -> Arc<dyn TokenProvider> {
        if let Some(token) = &self.token {
            return Arc::new(StaticToken::new(token.clone()));
        }
        if let Some(path) = &self.token_file {
            return Arc::new(FileTokenStore::new(path.clone()));
        }
        match FileTokenStore::at_default_location() {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!("Connecting without a token: {}", e);
                Arc::new(StaticToken::none())
            }
        }
    }

    fn cdc_config(&self, subscription_id: Uuid) -> Result<CdcConfig> {
        let config = CdcConfig::new(subscription_id)
            .with_api_base_url(self.api_url.clone())
            .with_stream(self.stream_config(StreamEndpoint::Cdc(subscription_id))?);
        config.validate().context("Invalid CDC configuration")?;
        Ok(config)
    }
}

/// Initialize tracing/logging with the specified log level
fn init_tracing(log_level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_lowercase()));

    let result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };

    result.map_err(|e| anyhow::anyhow!("Failed to install subscriber: {}", e))
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to encode output: {}", e),
    }
}

fn connection_handlers() -> EventHandlers {
    EventHandlers::new()
        .on_state_change(|state| info!("Connection {}", state))
        .on_disconnect(|reason| warn!("Disconnected: {}", reason))
        .on_error(|e| error!("{}", e))
}

async fn run_tail(
    global: &GlobalArgs,
    stream: StreamKind,
    channels: Vec<String>,
    summary: bool,
) -> Result<()> {
    let endpoint = match stream {
        StreamKind::Metrics => StreamEndpoint::Metrics,
        StreamKind::Monitoring => StreamEndpoint::Monitoring,
    };
    let client = StreamClient::builder(global.stream_config(endpoint)?)
        .token_provider(global.token_provider())
        .handlers(connection_handlers())
        .build()
        .context("Failed to create stream client")?;

    let channels = if channels.is_empty() {
        stream.default_channels()
    } else {
        channels
    };

    let mut handles = Vec::with_capacity(channels.len());
    for channel in channels {
        let handle = match channel.as_str() {
            "system_metrics" if summary => client.subscribe_topic::<SystemMetricsTopic, _>(|m| {
                println!(
                    "cpu {:.1}%  mem {:.1}%  disk {:.1}%  conns {}  qps {:.1}",
                    m.cpu_usage,
                    m.memory_usage,
                    m.disk_usage,
                    m.active_connections,
                    m.queries_per_second
                );
            }),
            "active_sessions" if summary => {
                client.subscribe_topic::<ActiveSessionsTopic, _>(|s| {
                    println!("{} active session(s)", s.total);
                })
            }
            "alerts" if summary => client.subscribe_topic::<AlertsTopic, _>(|a| {
                println!("[{:?}] {}: {}", a.severity, a.title, a.message);
            }),
            _ => {
                let name = channel.clone();
                client.subscribe(channel.clone(), move |payload| {
                    print_json(&serde_json::json!({"channel": name, "payload": payload}));
                })
            }
        };
        handles.push(handle);
    }

    client.connect();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    for handle in &handles {
        handle.unsubscribe();
    }
    client.disconnect();
    Ok(())
}

async fn catch_up(subscriber: &CdcSubscriber) {
    match subscriber.drain_changes().await {
        Ok(events) => {
            if !events.is_empty() {
                info!("Recovered {} change event(s) from the feed", events.len());
            }
            for event in &events {
                print_json(event);
            }
        }
        Err(e) => warn!("Failed to poll the change feed: {}", e),
    }
}

async fn run_cdc(
    global: &GlobalArgs,
    subscription_id: Uuid,
    guarantee: GuaranteeArg,
    ack_every: Option<u64>,
) -> Result<()> {
    if ack_every == Some(0) {
        return Err(anyhow::anyhow!("Acknowledgment interval must be positive"));
    }
    let config = global
        .cdc_config(subscription_id)?
        .with_guarantee(guarantee.into());

    let (connected_tx, mut connected) = mpsc::unbounded_channel();
    let handlers = connection_handlers().on_connect(move || {
        let _ = connected_tx.send(());
    });

    let subscriber = CdcSubscriber::builder(config)
        .token_provider(global.token_provider())
        .handlers(handlers)
        .on_change(|event: &ChangeEvent| print_json(event))
        .build()
        .context("Failed to create CDC subscriber")?;
    subscriber.connect();

    let mut ack_tick = tokio::time::interval(Duration::from_secs(ack_every.unwrap_or(60)));
    // the first tick completes immediately
    ack_tick.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(()) = connected.recv() => catch_up(&subscriber).await,
            _ = ack_tick.tick(), if ack_every.is_some() => {
                match subscriber.acknowledge_pending().await {
                    Ok(0) => {}
                    Ok(n) => info!("Acknowledged {} event(s)", n),
                    Err(e) => warn!("Acknowledgment failed: {}", e),
                }
            }
        }
    }

    info!("Shutting down");
    if ack_every.is_some() {
        if let Err(e) = subscriber.acknowledge_pending().await {
            warn!("Final acknowledgment failed: {}", e);
        }
    }
    subscriber.disconnect();
    Ok(())
}

async fn run_poll(
    global: &GlobalArgs,
    subscription_id: Uuid,
    limit: usize,
    next_token: Option<String>,
    all: bool,
    ack: bool,
) -> Result<()> {
    let config = global.cdc_config(subscription_id)?.with_poll_limit(limit);
    let subscriber = CdcSubscriber::builder(config)
        .token_provider(global.token_provider())
        .build()
        .context("Failed to create CDC subscriber")?;

    let events = if all {
        subscriber.drain_changes().await?
    } else {
        let page = subscriber.poll_changes(limit, next_token).await?;
        if page.has_more {
            info!(
                "More events available; continue with --next-token {}",
                page.next_token.as_deref().unwrap_or("<none>")
            );
        }
        page.events
    };

    for event in &events {
        print_json(event);
    }

    if ack {
        let ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let acknowledged = subscriber
            .acknowledge(&ids)
            .await
            .context("Failed to acknowledge events")?;
        info!("Acknowledged {} event(s)", acknowledged);
    }
    Ok(())
}

async fn run_ack(global: &GlobalArgs, subscription_id: Uuid, event_ids: Vec<Uuid>) -> Result<()> {
    let subscriber = CdcSubscriber::builder(global.cdc_config(subscription_id)?)
        .token_provider(global.token_provider())
        .build()
        .context("Failed to create CDC subscriber")?;

    // the feed acknowledges by id whether or not this process saw the events
    subscriber
        .tracker()
        .acknowledge(&event_ids)
        .await
        .context("Failed to acknowledge events")?;
    info!("Acknowledged {} event(s)", event_ids.len());
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Command::Tail {
            stream,
            channels,
            summary,
        } => run_tail(&global, stream, channels, summary).await,
        Command::Cdc {
            subscription_id,
            guarantee,
            ack_every,
        } => run_cdc(&global, subscription_id, guarantee, ack_every).await,
        Command::Poll {
            subscription_id,
            limit,
            next_token,
            all,
            ack,
        } => run_poll(&global, subscription_id, limit, next_token, all, ack).await,
        Command::Ack {
            subscription_id,
            event_ids,
        } => run_ack(&global, subscription_id, event_ids).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.global.validate()?;

    init_tracing(&cli.global.log_level, cli.global.json_logs)
        .context("Failed to initialize logging")?;

    run(cli).await
}
