//! `odin-data` command line entry point.
//!
//! ```bash
//! odin-data receiver --config config/odin-data.toml
//! odin-data --log-level debug --log-format json processor --config config/odin-data.toml
//! ```
//!
//! Each subcommand loads the settings, applies them as `configure` messages
//! and serves its control channel until `shutdown` or Ctrl-C.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use odin_common::{IpcMessage, MsgType};
use odin_data::{config::Settings, logging, OutputFormat};
use odin_processor::FrameProcessorController;
use odin_receiver::FrameReceiverController;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "odin-data")]
#[command(about = "Detector frame receiver and frame processor", version)]
struct Cli {
    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive UDP packets into shared memory frames
    Receiver {
        /// Settings file
        #[arg(long, default_value = odin_data::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Run frames from a receiver through a plugin chain
    Processor {
        /// Settings file
        #[arg(long, default_value = odin_data::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

impl Commands {
    fn config_path(&self) -> &PathBuf {
        match self {
            Self::Receiver { config } | Self::Processor { config } => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(cli.command.config_path())
        .with_context(|| format!("loading {}", cli.command.config_path().display()))?;
    if let Some(level) = cli.log_level {
        settings.log.level = level;
    }
    if let Some(format) = cli.log_format {
        settings.log.format = format;
    }
    settings.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_settings(&settings.log).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Receiver { .. } => run_receiver(&settings).await,
        Commands::Processor { .. } => run_processor(&settings).await,
    }
}

/// Fail on a nacked startup configuration.
fn check_reply(reply: &IpcMessage) -> Result<()> {
    if reply.msg_type() == MsgType::Nack {
        let reason: String = reply.get_param("error").unwrap_or_default();
        return Err(anyhow!("configuration rejected: {reason}"));
    }
    Ok(())
}

async fn run_receiver(settings: &Settings) -> Result<()> {
    let mut controller = FrameReceiverController::new()?;
    let msg = settings.receiver.configure_message();
    let mut reply = IpcMessage::reply_to(&msg, MsgType::Ack);
    controller.configure(&msg, &mut reply)?;
    check_reply(&reply)?;
    info!(
        ctrl_endpoint = %settings.receiver.config.ctrl_endpoint,
        ports = %settings.receiver.config.rx_port_list(),
        "Frame receiver configured"
    );

    let stop = controller.stop_handle();
    let mut task = tokio::task::spawn_blocking(move || controller.run());
    let result = tokio::select! {
        result = &mut task => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping frame receiver");
            stop.stop();
            task.await
        }
    };
    result.context("receiver control loop panicked")??;
    Ok(())
}

async fn run_processor(settings: &Settings) -> Result<()> {
    let mut controller = FrameProcessorController::new()?;
    for msg in settings.processor.configure_messages() {
        let mut reply = IpcMessage::reply_to(&msg, MsgType::Ack);
        controller
            .configure(&msg, &mut reply)
            .with_context(|| format!("applying {msg}"))?;
        check_reply(&reply)?;
    }
    info!(
        ctrl_endpoint = %settings.processor.ctrl_endpoint,
        plugins = ?controller.plugin_names(),
        "Frame processor configured"
    );

    let stop = controller.stop_handle();
    let mut task = tokio::task::spawn_blocking(move || controller.run());
    let result = tokio::select! {
        result = &mut task => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping frame processor");
            stop.stop();
            task.await
        }
    };
    result.context("processor control loop panicked")??;
    Ok(())
}
