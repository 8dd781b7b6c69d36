use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{ClearArgs, EnsureArgs, ProbeArgs, ValidateArgs};

#[derive(Parser)]
#[command(name = "ferry", version, about = "Fetch, verify and cache runtime and model assets")]
struct Cli {
    /// Asset manifest (TOML)
    #[arg(long, global = true, env = "FERRY_CONFIG", default_value = "configs/ferry.toml")]
    config: PathBuf,
    /// Override the persistent cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Run the cache coordinator as a child process instead of in-process
    #[arg(long, global = true)]
    worker: bool,
    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve assets to verified bytes, fetching as needed
    Ensure(EnsureArgs),
    /// Loader and cache status after an optional warm-up
    Status(EnsureArgs),
    /// Remove entries from the persistent cache
    Clear(ClearArgs),
    /// Check whether a source url would be admitted
    Validate(ValidateArgs),
    /// Check reachability of every source of an asset without downloading
    Probe(ProbeArgs),
    /// Print the manifest JSON schema
    Schema,
    /// Serve the cache protocol on stdin/stdout (used by --worker)
    CacheWorker,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let directive = match cli.verbose {
        0 => "info",
        1 => "ferry=debug,info",
        _ => "trace",
    };
    ferry_otel::init_with_default(directive);

    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let global = commands::Global {
        config: cli.config,
        cache_dir: cli.cache_dir,
        worker: cli.worker,
        json: cli.json,
    };
    match cli.command {
        Commands::Ensure(args) => commands::load::ensure(&global, args).await,
        Commands::Status(args) => commands::load::status(&global, args).await,
        Commands::Clear(args) => commands::cache::clear(&global, args).await,
        Commands::Validate(args) => commands::inspect::validate(&global, args),
        Commands::Probe(args) => commands::inspect::probe(&global, args).await,
        Commands::Schema => commands::inspect::schema(),
        Commands::CacheWorker => commands::cache::worker(&global).await,
    }
}
