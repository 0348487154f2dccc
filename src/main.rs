mod cli;
mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use spreadarb_core::config::types::AppConfig;
use spreadarb_core::logger::init_logger;

use runner::EngineRunner;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding `default.toml` and the optional `local.toml`.
    #[arg(long, default_value = "config", global = true)]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against paper exchanges (default)
    Run,
    /// Check configuration health
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Doctor => cli::doctor::run_doctor(&cli.config_dir),
        Commands::Run => {
            let _logguard = init_logger();
            let app_config = match AppConfig::load_from(&cli.config_dir) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to load configuration: {e}");
                    eprintln!("Run `spreadarb-bot doctor` to check your configuration.");
                    std::process::exit(1);
                }
            };
            EngineRunner::new(app_config)
                .run()
                .await
                .map_err(anyhow::Error::from)
        }
    }
}
