use std::sync::Arc;

use anyhow::Context;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gator::commands::{Commands, State};
use gator::config::Config;
use gator::db::Database;
use gator::scraper::Shutdown;

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout is for command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(err) = run().await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let name = args
        .next()
        .context("not enough arguments: expected a command name")?;
    let rest: Vec<String> = args.collect();

    // Load configuration
    let config_path = Config::default_path()?;
    let config = Config::load(&config_path)?;

    // Initialize database
    let db = Database::new(&config.db_url)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_url))?;
    db.initialize().await?;
    debug!("Database initialized");

    // Ctrl-C stops the aggregation loop between ticks
    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = trigger.send(true);
        }
    });

    let mut state = State::new(Arc::new(db), config, config_path, shutdown);
    let commands = Commands::default();
    commands
        .run(&mut state, &name, &rest, &mut std::io::stdout())
        .await
        .with_context(|| format!("{} failed", name))?;

    Ok(())
}
