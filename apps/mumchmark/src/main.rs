use std::{io::BufRead, path::PathBuf, sync::Arc, thread};

use anyhow::{Context, Result};
use clap::Parser;
use fleet_core::Fleet;
use shared::domain::TlsPolicy;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voice_integration::{LoopbackServer, WavSourceOpener};

mod config;
mod operator;
mod repl;

use crate::{
    config::Settings,
    operator::{Flow, Operator},
};

/// Load test a voice chat server with a fleet of scripted clients.
#[derive(Parser, Debug)]
#[command(name = "mumchmark", version)]
struct Args {
    /// TOML settings file (defaults to ./mumchmark.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Server address. Validated and resolved at startup; sessions connect
    /// through the in-process loopback server, which stands in for it.
    #[arg(long)]
    address: Option<String>,
    /// Number of clients spawned at startup.
    #[arg(long)]
    clients: Option<usize>,
    /// `skip` or `strict` certificate verification. `strict` needs
    /// `loopback_trusted_certificate = true` in loopback runs.
    #[arg(long)]
    tls: Option<TlsPolicy>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    max_connects: Option<usize>,
    #[arg(long)]
    command_timeout_ms: Option<u64>,
    #[arg(long)]
    audio: Option<PathBuf>,
    /// Print reports as JSON lines.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(address) = &self.address {
            settings.address = address.clone();
        }
        if let Some(clients) = self.clients {
            settings.clients = clients;
        }
        if let Some(tls) = self.tls {
            settings.tls = tls;
        }
        if let Some(password) = &self.password {
            settings.password = Some(password.clone());
        }
        if let Some(max_connects) = self.max_connects {
            settings.max_concurrent_connects = max_connects;
        }
        if let Some(timeout) = self.command_timeout_ms {
            settings.command_timeout_ms = timeout;
        }
        if let Some(audio) = &self.audio {
            settings.audio_source = audio.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings(args.config.as_deref())?;
    args.apply(&mut settings);
    settings.validate().context("invalid configuration")?;
    let address = settings.server_address()?;
    config::resolve_address(&address).await?;

    let server = LoopbackServer::new(settings.loopback_options());
    let fleet = Fleet::new(
        Arc::new(server.connector()),
        Arc::new(WavSourceOpener::new(settings.frame_duration())),
        settings.connect_timeout(),
    );
    info!(
        %address,
        tls = %settings.tls,
        clients = settings.clients,
        "mumchmark: starting against loopback server"
    );

    let shutdown_deadline = settings.shutdown_deadline();
    let initial_clients = settings.clients;
    let operator = Operator::new(fleet, settings, address, args.json);
    operator.spawn(initial_clients).await?;
    println!("{}", repl::HELP);

    run_operator_loop(&operator).await?;

    let report = operator
        .fleet()
        .supervisor()
        .drain_all(shutdown_deadline)
        .await;
    operator.emit(&report)?;
    Ok(())
}

/// Operator input comes from a plain thread so a pending read never holds up
/// runtime shutdown after Ctrl-C.
fn stdin_lines() -> ReceiverStream<std::io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Reads commands from stdin until `quit`, end of input, or Ctrl-C.
async fn run_operator_loop(operator: &Operator) -> Result<()> {
    let mut lines = stdin_lines();
    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("mumchmark: interrupted; draining fleet");
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        let line = line.context("failed to read operator input")?;

        match repl::parse_command(&line) {
            Ok(command) => {
                if operator.execute(command).await? == Flow::Quit {
                    println!("Quitting");
                    return Ok(());
                }
            }
            Err(err) => {
                warn!(error = %err, "mumchmark: rejected operator input");
                println!("{err}");
            }
        }
    }
}
