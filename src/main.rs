//! gpuwatch - GPU availability monitor for remote servers
//!
//! Holds one SSH session to a GPU box, polls `nvidia-smi -q -x` on a fixed
//! cadence, and raises a desktop notification (plus optional sound) exactly
//! once when the configured number of GPUs becomes available:
//! - Idle-count mode: GPUs with zero used memory
//! - Free-memory mode (`--min-ram`): GPUs with more than that much free MiB
//! - Single-shot: the first qualifying check alerts and the process exits

mod alert;
mod channel;
mod config;
mod monitor;
mod policy;
mod status;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::alert::{alert_message, alert_title, AlertSink, DesktopAlert};
use crate::channel::{SshAuth, SshChannel};
use crate::config::MonitorConfig;
use crate::monitor::{Outcome, PollLoop};

/// GPU monitor for remote servers
#[derive(Parser, Debug)]
#[command(name = "gpuwatch", version, about)]
struct Args {
    /// User name, or user@host when --host is omitted
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Host name
    #[arg(short = 'd', long)]
    host: Option<String>,

    /// Port number
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Path to the private key file; prompts for a password when omitted
    #[arg(short = 'k', long)]
    key: Option<PathBuf>,

    /// Period in seconds between checks
    #[arg(long)]
    step: Option<u64>,

    /// Alert when at least this number of GPUs is available
    #[arg(long)]
    min_gpus: Option<u32>,

    /// Consider GPUs with more than this much free RAM (in MiB) as
    /// available; when omitted, only fully idle GPUs count
    #[arg(long)]
    min_ram: Option<u64>,

    /// Path to an alert sound file
    #[arg(long)]
    alert_sound: Option<PathBuf>,

    /// Remote status query command
    #[arg(long)]
    command: Option<String>,

    /// Per-check timeout for the remote command, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Stop after this many checks instead of polling forever
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Test the notification mechanism and exit, without connecting
    #[arg(long)]
    debug: bool,
}

impl Args {
    /// Command-line flags override whatever the config file set.
    fn apply(&self, config: &mut MonitorConfig) {
        if let Some(user) = &self.user {
            config.connection.user = Some(user.clone());
        }
        if let Some(host) = &self.host {
            config.connection.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.connection.port = port;
        }
        if let Some(key) = &self.key {
            config.connection.key = Some(key.clone());
        }
        if let Some(step) = self.step {
            config.monitor.step_secs = step;
        }
        if let Some(min_gpus) = self.min_gpus {
            config.monitor.min_gpus = min_gpus;
        }
        if let Some(min_ram) = self.min_ram {
            config.monitor.min_ram_mib = Some(min_ram);
        }
        if let Some(sound) = &self.alert_sound {
            config.monitor.alert_sound = Some(sound.clone());
        }
        if let Some(command) = &self.command {
            config.monitor.query_command = command.clone();
        }
        if let Some(timeout) = self.timeout {
            config.monitor.exec_timeout_secs = timeout;
        }
        if let Some(max_ticks) = self.max_ticks {
            config.monitor.max_ticks = Some(max_ticks);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gpuwatch=info")),
        )
        .init();

    let mut config = MonitorConfig::load()
        .await
        .context("Failed to load configuration")?;
    args.apply(&mut config);

    let rule = config.monitor.rule()?;

    if args.debug {
        // Exercise the alert path only; no connection is made.
        let sink = DesktopAlert;
        sink.notify(&alert_title("user@example.com"), &alert_message(&rule))
            .await
            .context("Notification test failed")?;
        if let Some(sound) = &config.monitor.alert_sound {
            sink.play(sound).await.context("Sound test failed")?;
        }
        return Ok(());
    }

    let target = config.connection.resolve()?;

    let auth = match &target.key {
        Some(key) => SshAuth::KeyFile(key.clone()),
        None => {
            let password =
                rpassword::prompt_password(format!("Password for \"{}\": ", target.addr()))
                    .context("Failed to read password")?;
            SshAuth::Password(password)
        }
    };

    let channel = SshChannel::connect(&target.host, target.port, &target.user, auth)
        .await
        .context("Connection error")?;

    println!("Connected to \"{}\"!", target.addr());
    println!(
        "Listening for {} GPU(s) every {} seconds...",
        rule.min_devices, config.monitor.step_secs
    );

    let poll = PollLoop::new(
        channel,
        DesktopAlert,
        target.addr(),
        rule,
        &config.monitor,
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    match poll.run(shutdown).await? {
        Outcome::Alerted { ticks } => {
            info!(ticks, "availability detected, monitor done");
        }
        Outcome::Cancelled => {
            println!("\nMonitor terminated by user.");
        }
        Outcome::Exhausted { ticks } => {
            println!("No availability after {ticks} checks.");
        }
    }

    Ok(())
}
