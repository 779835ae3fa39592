//! stomp-jsonrpc - issue JSON-RPC calls and watch events over a STOMP broker.
//!
//! Usage:
//!   stomp-jsonrpc call <METHOD> [PARAMS] [OPTIONS]
//!   stomp-jsonrpc events [FILTER] [OPTIONS]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stomp_jsonrpc::config::ClientConfig;
use stomp_jsonrpc::events::{Event, EventSubscriber, Subscription, SUBSCRIPTION_ALL};
use stomp_jsonrpc::rpc::{JsonRpcRequest, ResponseDecomposer};
use stomp_jsonrpc::ClientError;

#[derive(Parser)]
#[command(name = "stomp-jsonrpc")]
#[command(about = "JSON-RPC 2.0 over STOMP")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $STOMP_JSONRPC_CONFIG or the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Broker URL, e.g. stomp://localhost:61613
    #[arg(short, long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response
    Call {
        /// Remote method name
        method: String,

        /// Parameters as JSON
        #[arg(default_value = "{}")]
        params: String,

        /// Request id (a fresh one is generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Send as a notification and do not wait for a response
        #[arg(long)]
        notify: bool,
    },

    /// Print events matching a subscription id
    Events {
        /// Subscription id, four `|`-separated segments
        #[arg(default_value = SUBSCRIPTION_ALL)]
        filter: String,

        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "stomp_jsonrpc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run() {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<bool> {
    let cli = Cli::parse();

    let mut config = ClientConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = cli.url {
        config.url = url;
    }
    let client = config.open(None).context("Failed to create client")?;
    info!("Starting stomp-jsonrpc v{} against {}", env!("CARGO_PKG_VERSION"), config.url);

    let outcome = match cli.command {
        Commands::Call {
            method,
            params,
            id,
            notify,
        } => {
            let params: Value = serde_json::from_str(&params).context("Parameters are not valid JSON")?;
            if notify {
                // Nothing tracks a notification, so it must not sit in the
                // outbox when close() tears the session down.
                client.connect().context("Failed to connect")?;
                client
                    .notify(JsonRpcRequest::notification(method, params))
                    .context("Failed to send notification")?;
                Ok(true)
            } else {
                let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let handle = client
                    .call(JsonRpcRequest::new(method, params, id))
                    .context("Failed to issue call")?;
                let response = handle.wait(None).context("Call failed")?;
                let decomposer = ResponseDecomposer::new(&response);
                let output = if decomposer.is_error() {
                    Value::Object(decomposer.decompose_error())
                } else {
                    response.result().cloned().unwrap_or(Value::Null)
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
                Ok(!decomposer.is_error())
            }
        }
        Commands::Events {
            filter,
            count,
            duration,
        } => {
            client.connect().context("Failed to connect")?;
            watch_events(&config, &filter, count, duration.map(Duration::from_secs))
        }
    };

    client.close().context("Failed to close client")?;
    stomp_jsonrpc::reactor::shared::shutdown();
    outcome
}

struct Printer(SyncSender<Event>);

impl EventSubscriber for Printer {
    fn on_subscribe(&self, subscription: Subscription) {
        subscription.request(u64::MAX);
    }

    fn on_next(&self, event: Event) {
        let _ = self.0.send(event);
    }

    fn on_error(&self, error: ClientError) {
        eprintln!("Subscriber error: {}", error);
    }

    fn on_complete(&self) {}
}

fn watch_events(
    config: &ClientConfig,
    filter: &str,
    count: Option<u64>,
    duration: Option<Duration>,
) -> Result<bool> {
    let worker = stomp_jsonrpc::reactor::shared::response_worker(config.parallelism, config.event_retention())
        .context("Failed to start response worker")?;
    let (tx, events) = sync_channel(64);
    let subscription = worker
        .publisher()
        .subscribe(filter, std::sync::Arc::new(Printer(tx)))
        .with_context(|| format!("Invalid subscription id {}", filter))?;

    let deadline = duration.map(|d| Instant::now() + d);
    let mut seen = 0u64;
    while count.map_or(true, |limit| seen < limit) {
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => break,
            },
            None => Duration::from_secs(1),
        };
        match events.recv_timeout(wait) {
            Ok(event) => {
                seen += 1;
                println!(
                    "{}",
                    json!({
                        "id": event.id().as_str(),
                        "received_at": event.received_at().to_rfc3339(),
                        "params": event.params(),
                    })
                );
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    subscription.cancel();
    Ok(true)
}
