use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use toolbridge::agent_core::ChatContext;
use toolbridge::config::{find_config_path, load_config};
use toolbridge::inference::CompletionClient;
use toolbridge::{data_dir, init_tracing, LogTarget, ToolBridge};

#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(about = "Bridge a chat completion service to a JSON-RPC tool worker", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: $TOOLBRIDGE_CONFIG or toolbridge.yaml upward from cwd)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log to stderr instead of the rotated log file
    #[arg(long, global = true)]
    log_stderr: bool,
    /// Seconds to wait for the worker handshake
    #[arg(long, global = true, default_value_t = 30)]
    wait_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker, wait for the handshake and print status as JSON
    Status,
    /// Print the tool catalog
    Tools,
    /// Interactive chat over stdin
    Chat {
        #[arg(long, default_value = "local")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_target = if cli.log_stderr {
        LogTarget::Stderr
    } else {
        LogTarget::File(data_dir())
    };
    init_tracing(log_target).context("failed to initialize logging")?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().context("cannot read current directory")?;
            find_config_path(&cwd)?
        }
    };
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let completion = CompletionClient::from_config(config.model.clone())
        .context("failed to build completion client")?;
    let bridge = ToolBridge::new(config, Arc::new(completion));

    bridge.start().await.context("failed to start worker")?;
    if !bridge.wait_for_catalog(Duration::from_secs(cli.wait_secs)).await {
        tracing::warn!(wait_secs = cli.wait_secs, "worker catalog not ready in time");
    }

    let result = match cli.command {
        Command::Status => print_status(&bridge),
        Command::Tools => print_tools(&bridge),
        Command::Chat { user } => chat(&bridge, &user).await,
    };

    bridge.shutdown().await;
    result
}

fn print_status(bridge: &ToolBridge) -> Result<()> {
    let status = serde_json::to_string_pretty(&bridge.status())?;
    println!("{status}");
    Ok(())
}

fn print_tools(bridge: &ToolBridge) -> Result<()> {
    let snapshot = bridge.supervisor().catalog().snapshot();
    println!("{} ({:?})", snapshot.capability_summary(), snapshot.source());
    Ok(())
}

async fn chat(bridge: &ToolBridge, user: &str) -> Result<()> {
    let ctx = ChatContext::new_chat(user);
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout
        .write_all(b"Type a message, /status, /restart or /quit.\n")
        .await?;
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/status" => {
                print_status(bridge)?;
                continue;
            }
            "/restart" => {
                bridge.restart().await.context("restart failed")?;
                println!("worker restarting");
                continue;
            }
            _ => {}
        }

        match bridge.handle_message(&ctx, line, &[], None).await {
            Ok(outcome) => {
                println!("{}", outcome.final_text);
                let cost = outcome
                    .usage
                    .estimated_cost
                    .map(|c| format!("${c:.4}"))
                    .unwrap_or_else(|| "n/a".to_string());
                println!(
                    "[tools: {} | tokens: {} | cost: {}]",
                    if outcome.tools_used.is_empty() {
                        "none".to_string()
                    } else {
                        outcome.tools_used.join(", ")
                    },
                    outcome.usage.total_tokens(),
                    cost
                );
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}
