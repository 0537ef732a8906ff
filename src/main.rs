//! Light Wizard - command-line front end
//!
//! Usage:
//!   light-wizard [--simulate] scan     - Find the Light Wizard and read its switch
//!   light-wizard [--simulate] status   - Print device and switch state as JSON
//!   light-wizard [--simulate] toggle   - Flip the switch once
//!   light-wizard [--simulate] run      - Interactive session (toggle, read, status, scan, quit)
//!   light-wizard config [--save]       - Show (or write out) the configuration

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{Level, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use light_wizard_lib::commands;
use light_wizard_lib::config::AppConfig;
use light_wizard_lib::logging::UiLogger;
use light_wizard_lib::setup_logging;
use light_wizard_lib::state::AppState;

#[derive(Parser)]
#[command(name = "light-wizard")]
#[command(about = "Control a Light Wizard light switch over Bluetooth LE")]
struct Cli {
    /// Talk to a simulated Light Wizard instead of the Bluetooth radio
    #[arg(long, global = true)]
    simulate: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Scan timeout in seconds, overrides the configuration
    #[arg(long, global = true)]
    scan_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for the Light Wizard and read the switch
    Scan,
    /// Print the device and switch state as JSON
    Status,
    /// Flip the switch
    Toggle,
    /// Interactive session
    Run,
    /// Show the configuration
    Config {
        /// Write the effective configuration to the config directory
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let logger = setup_logging(cli.log_level);

    let mut config = AppConfig::load().await?;
    if let Some(secs) = cli.scan_timeout {
        config.wizard.scan_timeout_secs = secs;
    }

    if let Commands::Config { save } = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        if save {
            let path = config.wizard.save_config().await?;
            println!("Saved to {}", path.display());
        }
        return Ok(());
    }

    let state = build_state(cli.simulate, config).await?;
    match cli.command {
        Commands::Scan => {
            let switch = commands::start_scan(&state).await.map_err(anyhow::Error::msg)?;
            if let Some(device) = commands::get_device(&state).await {
                println!("Found {}", device);
                if let Some(address) = device.address() {
                    println!("Address: {}", address);
                }
            }
            println!("Switch is {}", switch);
        }
        Commands::Status => {
            // a failed bootstrap still has a status worth printing
            let _ = commands::start_scan(&state).await;
            print_status(&state).await?;
        }
        Commands::Toggle => {
            commands::start_scan(&state).await.map_err(anyhow::Error::msg)?;
            let switch = commands::toggle_switch(&state).await.map_err(anyhow::Error::msg)?;
            println!("Switch is now {}", switch);
        }
        Commands::Run => run_interactive(&state, logger).await?,
        Commands::Config { .. } => {}
    }

    commands::disconnect(&state).await.map_err(anyhow::Error::msg)?;
    Ok(())
}

async fn build_state(simulate: bool, config: AppConfig) -> Result<AppState> {
    if simulate {
        return Ok(AppState::simulated(config));
    }
    system_state(config).await
}

#[cfg(feature = "bluest")]
async fn system_state(config: AppConfig) -> Result<AppState> {
    AppState::new(config).await
}

#[cfg(not(feature = "bluest"))]
async fn system_state(_config: AppConfig) -> Result<AppState> {
    anyhow::bail!("built without Bluetooth support, rerun with --simulate")
}

async fn print_status(state: &AppState) -> Result<()> {
    let status = serde_json::json!({
        "bluetooth_enabled": commands::is_bluetooth_enabled(state).await,
        "device": commands::get_device(state).await,
        "status": commands::get_status(state),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Prints warnings and errors between prompts instead of letting stderr interleave with them.
fn forward_problems(logger: &'static UiLogger) {
    logger.set_echo(false);
    let mut rx = logger.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) if message.level == "WARN" || message.level == "ERROR" => {
                    println!("[{}] {}", message.level, message.message);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    println!("({} log messages skipped)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run_interactive(state: &AppState, logger: Option<&'static UiLogger>) -> Result<()> {
    if let Some(logger) = logger {
        forward_problems(logger);
    }
    println!("Bluetooth Enabled: {}", commands::is_bluetooth_enabled(state).await);
    report(commands::start_scan(state).await);
    println!("Commands: toggle, read, status, scan, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "toggle" | "t" => report(commands::toggle_switch(state).await),
            "read" | "r" => report(commands::get_switch_state(state).await),
            "status" | "s" => print_status(state).await?,
            "scan" => report(commands::start_scan(state).await),
            "quit" | "q" | "exit" => break,
            "" => {}
            other => println!("Unknown command: {}", other),
        }
    }
    info!("Leaving interactive session");
    Ok(())
}

fn report(result: Result<light_wizard_lib::core::bluetooth::SwitchState, String>) {
    match result {
        Ok(switch) => println!("Switch is {}", switch),
        Err(e) => println!("Error: {}", e),
    }
}
