//! Command-line access to a configured SCPI-style instrument.
//!
//! ```text
//! daq-props --config bench.toml --device psu idn
//! daq-props --config bench.toml --device psu send "VOLT 5"
//! daq-props --config bench.toml --device psu send "MEAS:VOLT?"
//! daq-props --config bench.toml --device psu watch --samples 5
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use daq_props::{logging, AppResult, DaqPropsConfig, Device, GenericScpiDriver};
use tracing::error;

#[derive(Parser)]
#[command(name = "daq-props")]
#[command(about = "Talk to a configured instrument over its message channel", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "daq-props.toml")]
    config: PathBuf,

    /// Device name from the configuration
    #[arg(long)]
    device: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the identification string
    Idn,
    /// Reset the instrument
    Reset,
    /// Clear the status registers
    Clear,
    /// Send one command and print the normalized reply
    Send {
        /// Command text, e.g. "VOLT 5" or "MEAS:VOLT?"
        command: String,
    },
    /// Poll readable properties at the configured interval and print them
    Watch {
        /// Number of snapshots to print
        #[arg(long, default_value_t = 10)]
        samples: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match DaqPropsConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(&config, &cli).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &DaqPropsConfig, cli: &Cli) -> AppResult<String> {
    let device = config.build_device(&cli.device, Arc::new(GenericScpiDriver))?;
    device.connect().await?;

    let result = execute(&device, &cli.command).await;
    let closed = device.disconnect().await;
    let output = result?;
    closed?;
    Ok(output)
}

async fn execute(device: &Device, command: &Commands) -> AppResult<String> {
    match command {
        Commands::Idn => device.get_identifier().await,
        Commands::Reset => device.reset().await.map(|()| String::new()),
        Commands::Clear => device.clear_status().await.map(|()| String::new()),
        Commands::Send { command } => device.message_channel().send_message(command).await,
        Commands::Watch { samples } => {
            watch(device, *samples).await;
            Ok(String::new())
        }
    }
}

async fn watch(device: &Device, samples: usize) {
    let updater = device.auto_update();
    let mut ticker = tokio::time::interval(device.property_defaults().auto_update_interval);
    for _ in 0..samples {
        ticker.tick().await;
        let snapshot: serde_json::Map<String, serde_json::Value> = device
            .properties()
            .iter()
            .filter(|(_, p)| p.can_get())
            .map(|(name, p)| (name.to_string(), p.value_json()))
            .collect();
        println!("{}", serde_json::Value::Object(snapshot));
    }
    updater.stop().await;
}
