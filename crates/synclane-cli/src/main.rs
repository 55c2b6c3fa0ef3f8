mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "synclane",
    version,
    about = "Replays connector messages through the synclane replication core"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync attempt
    Run {
        /// Path to sync YAML file
        sync: PathBuf,
        /// Exit code the replayed source reports once drained
        #[arg(long, default_value_t = 0)]
        source_exit_code: i32,
        /// Heartbeat the workload service while the attempt runs
        #[arg(long)]
        workload_heartbeat: bool,
    },
    /// Validate sync configuration and source messages
    Check {
        /// Path to sync YAML file
        sync: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            sync,
            source_exit_code,
            workload_heartbeat,
        } => commands::run::execute(&sync, source_exit_code, workload_heartbeat).await,
        Commands::Check { sync } => commands::check::execute(&sync),
    }
}
