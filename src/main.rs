use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use rose_bridge::{
    services::{FilePortStore, HttpPortProbe, PortCache, PortResolver},
    BridgeClient, BridgeConfig, ConnectionNotice, ConnectionState, EmitTransport,
};
use serde_json::{json, Value};
use tokio::{sync::broadcast::error::RecvError, time::timeout};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rose-bridge", version, about = "Talk to the local Rose mod bridge")]
struct Cli {
    /// Port cache file (defaults to the platform data directory).
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Resolve the bridge port and print it.
    Discover,
    /// Send JSON events over the WebSocket bridge.
    Send {
        #[arg(required = true)]
        payloads: Vec<String>,
        /// Give up on undelivered events after this many seconds.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Print inbound bridge messages and connection changes as JSON lines.
    Watch,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    };
    if let Some(store) = cli.store {
        config.store_path = Some(store);
    }

    let code = match cli.command {
        CliCommand::Discover => discover(config).await,
        CliCommand::Send {
            payloads,
            timeout_secs,
        } => send(config, payloads, Duration::from_secs(timeout_secs)).await,
        CliCommand::Watch => watch(config).await,
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn discover(config: BridgeConfig) -> i32 {
    let Some(store_path) = config.store_path.clone() else {
        eprintln!("no port store path available; pass --store");
        return 1;
    };

    let config = Arc::new(config);
    let resolver = PortResolver::new(
        Arc::clone(&config),
        Arc::new(HttpPortProbe::new(config.host.clone())),
        PortCache::new(Arc::new(FilePortStore::new(store_path))),
    );

    match resolver.resolve().await {
        Some(resolution) => {
            println!(
                "{}",
                json!({
                    "port": resolution.endpoint.port,
                    "url": resolution.endpoint.url,
                    "source": format!("{:?}", resolution.source).to_lowercase(),
                })
            );
            0
        }
        None => {
            eprintln!(
                "no bridge answered on {}:{}..={}",
                config.host, config.discovery_start, config.discovery_end
            );
            1
        }
    }
}

async fn send(mut config: BridgeConfig, payloads: Vec<String>, wait: Duration) -> i32 {
    let mut events = Vec::with_capacity(payloads.len());
    for raw in &payloads {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => events.push(value),
            Err(error) => {
                eprintln!("invalid JSON payload {raw:?}: {error}");
                return 1;
            }
        }
    }

    config.emit_transport = EmitTransport::Socket;
    let client = match BridgeClient::start(config) {
        Ok(client) => client,
        Err(error) => {
            eprintln!("{error}");
            return 1;
        }
    };

    for event in &events {
        if let Err(error) = client.emit(event) {
            eprintln!("{error}");
            client.stop().await;
            return 1;
        }
    }

    let drained = timeout(wait, async {
        let mut state = client.watch_state();
        loop {
            if *state.borrow_and_update() == ConnectionState::Open
                && client.pending().await.map(|p| p.is_empty()).unwrap_or(false)
            {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok();

    let undelivered = client.pending().await.map(|p| p.len()).unwrap_or(0);
    client.stop().await;

    if drained && undelivered == 0 {
        0
    } else {
        eprintln!("{undelivered} event(s) not delivered within {}s", wait.as_secs());
        1
    }
}

async fn watch(config: BridgeConfig) -> i32 {
    let client = match BridgeClient::start(config) {
        Ok(client) => client,
        Err(error) => {
            eprintln!("{error}");
            return 1;
        }
    };
    let mut inbound = client.subscribe();
    let mut state = client.watch_state();

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Ok(message) => println!("{}", message.to_value()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "inbound messages skipped");
                }
                Err(RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let notice = ConnectionNotice::now(*state.borrow_and_update());
                match serde_json::to_string(&notice) {
                    Ok(line) => println!("{line}"),
                    Err(error) => eprintln!("failed to serialize notice: {error}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.stop().await;
    0
}
