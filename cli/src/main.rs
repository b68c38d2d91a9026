mod commands;
mod config;
mod shutdown;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    Context, convert::ConvertStoreCommand, get::GetCommand, list::ListCommand, prune::PruneCommand,
    remove::RemoveCommand, start::StartCommand, sync::SyncCommand,
};
use config::Config;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "coldstash",
    about = "Encrypted backups to cold archival storage",
    long_about = "Coldstash archives a set of paths, encrypts them and keeps them in an Amazon Glacier vault, tracking every backup in a local store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "COLDSTASH_CONFIG", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "COLDSTASH_BACKUP_SECRET", hide_env_values = true, help = "Backup secret")]
    secret: Option<String>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Back up the configured paths now")]
    Sync(SyncCommand),

    #[command(about = "Retrieve a backup and restore its files")]
    Get(GetCommand),

    #[command(about = "Remove backups from the vault and the local store")]
    Remove(RemoveCommand),

    #[command(about = "List backups")]
    List(ListCommand),

    #[command(about = "Remove all but the most recent backups")]
    Prune(PruneCommand),

    #[command(about = "Run backups and maintenance on fixed intervals")]
    Start(StartCommand),

    #[command(about = "Copy backup records from one store backend to another")]
    ConvertStore(ConvertStoreCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = run(&cli).await;
    if let Err(e) = &result {
        match e.downcast_ref::<coldstash_core::Error>() {
            Some(err) => error!(kind = %err.kind(), error = %err, "Command failed"),
            None => error!(error = %e, "Command failed"),
        }
    }
    result
}

async fn run(cli: &Cli) -> Result<()> {
    if let Commands::ConvertStore(cmd) = &cli.command {
        init_tracing(cli.verbose, cli.quiet, None);
        return cmd.run().await;
    }

    let mut config = Config::load(cli.config.as_deref())?;
    init_tracing(cli.verbose, cli.quiet, config.log.level.as_deref());

    if let Commands::Get(cmd) = &cli.command {
        if let Some(root) = &cmd.restore_root {
            config.jobs.restore_root = Some(root.clone());
        }
    }

    info!("Starting coldstash");
    let ctx = Context::open(cli, config).await?;

    match &cli.command {
        Commands::Sync(cmd) => cmd.run(&ctx).await,
        Commands::Get(cmd) => cmd.run(&ctx).await,
        Commands::Remove(cmd) => cmd.run(&ctx).await,
        Commands::List(cmd) => cmd.run(&ctx).await,
        Commands::Prune(cmd) => cmd.run(&ctx).await,
        Commands::Start(cmd) => cmd.run(&ctx).await,
        Commands::ConvertStore(cmd) => cmd.run().await,
    }
}

fn init_tracing(verbose: bool, quiet: bool, level: Option<&str>) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        level.unwrap_or("info")
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("coldstash={}", level)));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }
}
