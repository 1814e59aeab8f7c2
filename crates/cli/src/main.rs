use clap::{Parser, Subcommand};

mod commands;
mod venues;

#[derive(Parser)]
#[command(name = "delta-hedge")]
#[command(about = "Delta-neutral hedge control loop", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hedge controller
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Run the liveness watchdog (intended as a separate process)
    Watchdog {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Inspect or clear the persisted controller state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Print the persisted snapshot and heartbeat
    Show {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Delete the persisted snapshot (operator action)
    Clear {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => commands::run(&config).await,
        Commands::Watchdog { config } => commands::watchdog(&config).await,
        Commands::State { action } => match action {
            StateAction::Show { config } => commands::state_show(&config).await,
            StateAction::Clear { config } => commands::state_clear(&config).await,
        },
    }
}
