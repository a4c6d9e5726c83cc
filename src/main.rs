use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mindcall_lib::logger::init_logging;
use mindcall_lib::peer::{RtcTransportFactory, SyntheticMediaSource};
use mindcall_lib::{CallConfig, CallState, ClientContext, MemoryStore, VideoCall};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "mindcall", version, about = "Document-store signalled WebRTC calls")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "MINDCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect two in-process peers through an in-memory store
    Loopback {
        /// Seconds to wait for both sides to connect
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Print the effective configuration as JSON
    Config,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CallConfig> {
    let config = match path {
        Some(path) => CallConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CallConfig::from_env()?,
    };
    Ok(config)
}

async fn wait_connected(mut rx: watch::Receiver<CallState>) -> anyhow::Result<()> {
    loop {
        let state = *rx.borrow_and_update();
        match state {
            CallState::Connected => return Ok(()),
            CallState::Failed(kind) => bail!("call failed: {kind}"),
            CallState::Closed => bail!("call closed before connecting"),
            _ => {}
        }
        rx.changed().await?;
    }
}

async fn print_states(side: &'static str, mut rx: watch::Receiver<CallState>) {
    loop {
        let state = *rx.borrow_and_update();
        println!("{side}: {state}");
        if rx.changed().await.is_err() {
            break;
        }
    }
}

async fn loopback(config: CallConfig, timeout: Duration) -> anyhow::Result<()> {
    let ctx = ClientContext::initialize(
        config.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(SyntheticMediaSource),
        Arc::new(RtcTransportFactory::new(&config)),
    )?;

    let caller = VideoCall::new(ctx.clone());
    let callee = VideoCall::new(ctx.clone());
    let printers = [
        tokio::spawn(print_states("caller", caller.subscribe())),
        tokio::spawn(print_states("callee", callee.subscribe())),
    ];

    caller.start_media().await?;
    callee.start_media().await?;

    let session = caller.call().await?;
    println!("session id: {session}");
    callee.answer(session.as_str()).await?;

    let both = async {
        tokio::try_join!(
            wait_connected(caller.subscribe()),
            wait_connected(callee.subscribe())
        )
    };
    let outcome = tokio::time::timeout(timeout, both).await;

    caller.hang_up().await;
    callee.hang_up().await;
    ctx.shutdown();
    for printer in printers {
        printer.abort();
    }

    match outcome {
        Ok(Ok(_)) => {
            info!("loopback connected");
            println!("connected");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => bail!("peers did not connect within {} s", timeout.as_secs()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_logging(&config.logging);

    match cli.command {
        Command::Loopback { timeout } => loopback(config, Duration::from_secs(timeout)).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
