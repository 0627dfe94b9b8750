/// ksync - live key-value sync server and command line client
///
/// Usage:
///   ksync serve [--port 8800]         - Run a sync server
///   ksync get <key>                   - Read a key or glob
///   ksync set <key> <value>           - Publish a JSON value
///   ksync del <key>                   - Delete a key or glob
///   ksync keys                        - List stored keys
///   ksync watch <key>                 - Follow a key or glob live
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use koru_sync::client::{self, Meta};
use koru_sync::config::DEFAULT_PORT;
use koru_sync::http::{HttpServer, PublishResponse};
use koru_sync::storage::Stats;
use koru_sync::{CancellationToken, Filters, Server, ServerConfig};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::signal;

// ============================================================================
// HTTP Client for Remote Operations
// ============================================================================

/// HTTP client for a remote sync server.
struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    /// Websocket base for subscriptions.
    fn ws_base(&self) -> String {
        if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        }
    }

    async fn get(&self, key: &str) -> Result<JsonValue> {
        let response = self.client.get(self.url(key)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Key not found: {}", key);
        }
        Ok(response.error_for_status()?.json().await?)
    }

    async fn set(&self, key: &str, value: JsonValue) -> Result<String> {
        let body = serde_json::json!({ "data": value });
        let response = self.client.post(self.url(key)).json(&body).send().await?;
        let published: PublishResponse = response.error_for_status()?.json().await?;
        Ok(published.index)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let response = self.client.delete(self.url(key)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Key not found: {}", key);
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let response = self.client.get(&self.base_url).send().await?;
        let stats: Stats = response.error_for_status()?.json().await?;
        Ok(stats.keys)
    }
}

/// ksync - live key-value sync
///
/// Subscribe to keys or glob patterns and receive every change as a
/// snapshot or a JSON Patch.
#[derive(Parser)]
#[command(name = "ksync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server URL for client commands
    #[arg(short, long, global = true, default_value = "http://localhost:8800")]
    url: String,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    silence: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync server with in-memory storage
    ///
    /// Examples:
    ///   ksync serve
    ///   ksync serve --port 9000 --workers 12
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Address to bind
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        /// Workers draining storage events
        #[arg(short, long, default_value_t = koru_sync::config::DEFAULT_WORKERS)]
        workers: usize,

        /// Always send patches, even when larger than the snapshot
        #[arg(long)]
        force_patch: bool,

        /// Only serve keys opened with --open
        #[arg(long = "static")]
        static_mode: bool,

        /// Keys or globs to open in static mode
        #[arg(long)]
        open: Vec<String>,

        /// Clock interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        tick_ms: u64,
    },

    /// Read a key or glob
    ///
    /// Examples:
    ///   ksync get settings
    ///   ksync get devices/*
    Get {
        /// Key or glob pattern
        key: String,
    },

    /// Publish a JSON value
    ///
    /// A key ending in /* appends to a list.
    ///
    /// Examples:
    ///   ksync set settings '{"theme": "dark"}'
    ///   ksync set devices/* '{"name": "sensor"}'
    Set {
        /// Key, or list pattern ending in /*
        key: String,

        /// Value to store (JSON format)
        value: String,
    },

    /// Delete a key or glob
    Del {
        /// Key or glob pattern
        key: String,
    },

    /// List stored keys
    Keys,

    /// Follow a key or glob, printing every new state
    Watch {
        /// Key or glob pattern
        key: String,
    },
}

fn init_logging(silence: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if silence { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.silence);

    let remote = HttpClient::new(&cli.url);
    match cli.command {
        Commands::Serve {
            port,
            bind,
            workers,
            force_patch,
            static_mode,
            open,
            tick_ms,
        } => {
            let config = ServerConfig::new()
                .workers(workers)
                .force_patch(force_patch)
                .static_mode(static_mode)
                .tick(Duration::from_millis(tick_ms));
            let filters = open
                .into_iter()
                .fold(Filters::new(), |filters, path| filters.open_filter(path));
            run_server(config, filters, &bind, port).await
        }

        Commands::Get { key } => {
            let value = remote.get(&key).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }

        Commands::Set { key, value } => {
            let value: JsonValue = serde_json::from_str(&value)
                .with_context(|| format!("Invalid JSON value: {}", value))?;
            let index = remote.set(&key, value).await.context("Failed to publish")?;
            println!("{}", "OK".green().bold());
            println!("  Published: {}", key.cyan());
            println!("  Index: {}", index.bright_black());
            Ok(())
        }

        Commands::Del { key } => {
            remote.del(&key).await?;
            println!("{}", "OK".green().bold());
            println!("  Deleted: {}", key.cyan());
            Ok(())
        }

        Commands::Keys => {
            let keys = remote.keys().await?;
            if keys.is_empty() {
                println!("{}", "No keys found".yellow());
            } else {
                println!("{}", "Keys:".bold());
                for key in keys {
                    println!("  {} {}", "*".cyan(), key);
                }
            }
            Ok(())
        }

        Commands::Watch { key } => {
            let cancel = CancellationToken::new();
            let stop = cancel.clone();
            tokio::spawn(async move {
                signal::ctrl_c().await.ok();
                stop.cancel();
            });

            println!("{} {}", "Watching".bold().cyan(), key);
            client::subscribe(&remote.ws_base(), &key, cancel, |state: Vec<Meta<JsonValue>>| {
                println!("{}", "Update:".bold());
                for item in state {
                    println!(
                        "  {} {} {}",
                        "*".cyan(),
                        item.index.bright_black(),
                        item.data
                    );
                }
            })
            .await
            .context("Subscription failed")?;
            Ok(())
        }
    }
}

/// Run a sync server until Ctrl+C.
async fn run_server(config: ServerConfig, filters: Filters, bind: &str, port: u16) -> Result<()> {
    let bind_addr = format!("{}:{}", bind, port);
    let server = Server::builder()
        .config(config)
        .filters(filters)
        .start()
        .await
        .context("Failed to start server")?;

    println!("{}", "Starting ksync server...".bold().cyan());
    println!();
    println!("  {} {}", "Bind:".bright_white(), bind_addr);
    println!();
    println!("  {}", "Endpoints:".bright_black());
    println!("    GET    /           - List keys (websocket: clock)");
    println!("    GET    /:key       - Read (websocket: subscribe)");
    println!("    POST   /:key       - Publish {{\"data\": ...}}");
    println!("    DELETE /:key       - Delete");
    println!();
    println!("{}", "Server is running. Press Ctrl+C to stop.".green());
    println!();

    let closer = server.clone();
    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        println!();
        println!("{}", "Shutting down...".yellow());
        closer.close().await;
    });

    HttpServer::new(server)
        .bind(&bind_addr)
        .await
        .context("Server error")?;
    Ok(())
}
