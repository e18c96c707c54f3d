use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aswarm_system", about = "A-SWARM evolution core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autonomous evolution loop (default).
    Run,
    /// Load and validate the environment configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenvy::dotenv().is_err() {
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let _ = dotenvy::from_path(dir.join(".env"));
            }
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        None | Some(Command::Run) => aswarm_core::run_system().await,
        Some(Command::CheckConfig) => {
            let config = aswarm_core::config::EvolutionConfig::load()?;
            println!(
                "configuration ok: cluster_id={} tick={}s queue={}",
                config.cluster_id, config.tick_interval_secs, config.event_queue_capacity
            );
            Ok(())
        }
    }
}
