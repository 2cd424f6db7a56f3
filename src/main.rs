use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use commands::{DiffArgs, PrArgs, PrsArgs, QueryArgs, ReposArgs, Session, Settings};

mod cache;
mod commands;
mod config;
mod debug_log;
mod diff;
mod dispatch;
mod error;
mod path;
mod query;
mod remote;
mod table;
mod vcs;

#[derive(Parser)]
#[command(name = "reposcope")]
#[command(version)]
#[command(about = "Query a source-control service from the command line")]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Always call the service, ignoring cached responses
    #[arg(long, global = true)]
    no_cache: bool,

    /// Cache lifetime in seconds for this run
    #[arg(long, global = true, value_name = "SECS")]
    ttl: Option<i64>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Call an operation and reshape, filter and join its result
    Query(QueryArgs),
    /// List repositories
    Repos(ReposArgs),
    /// List pull requests for a repository
    Prs(PrsArgs),
    /// Show one pull request with its changes, diffs and review comments
    Pr(PrArgs),
    /// Diff two local files
    Diff(DiffArgs),
    /// Show the current repository, branch and last commit
    Status,
    /// Manage the response cache
    Cache(CacheArgs),
    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    subcommand: CacheSubcommands,
}

#[derive(Subcommand)]
enum CacheSubcommands {
    /// Delete all cached responses
    Clear,
    /// Show entry count and size
    Stats,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    subcommand: ConfigSubcommands,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Create default configuration file
    Init {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key (endpoint, api-token, timeout-seconds, cache-ttl, cache-dir, concurrency, protected-branches, color)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    debug_log::init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if let Commands::Config(config_args) = &cli.command {
        return handle_config_subcommand(&mut out, config_args);
    }

    let config = match &cli.command {
        Commands::Diff(_) | Commands::Status => config::Config::resolve_lenient(),
        _ => config::Config::resolve()?,
    };
    let mut settings = Settings::from_config(&config);
    if let Some(ttl) = cli.ttl {
        settings.ttl_seconds = ttl;
    }
    if cli.no_cache {
        settings.ttl_seconds = 0;
    }
    if cli.no_color {
        settings.color = false;
    }

    match &cli.command {
        Commands::Query(args) => {
            let session = connect(&config, settings)?;
            commands::run_query(&session, &mut out, args).await?;
        }
        Commands::Repos(args) => {
            let session = connect(&config, settings)?;
            commands::run_repos(&session, &mut out, args).await?;
        }
        Commands::Prs(args) => {
            let session = connect(&config, settings)?;
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            commands::run_prs(&session, &mut out, args, &cwd).await?;
        }
        Commands::Pr(args) => {
            let session = connect(&config, settings)?;
            commands::run_pr(&session, &mut out, args).await?;
        }
        Commands::Diff(args) => commands::run_diff(&mut out, args, settings.color)?,
        Commands::Status => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            commands::run_status(&mut out, &cwd, &settings.protected_branches)?;
        }
        Commands::Cache(cache_args) => {
            let cache = cache::ResponseCache::new(&settings.cache_dir);
            match cache_args.subcommand {
                CacheSubcommands::Clear => commands::run_cache_clear(&mut out, &cache)?,
                CacheSubcommands::Stats => commands::run_cache_stats(&mut out, &cache)?,
            }
        }
        Commands::Config(_) => {}
    }

    out.flush()?;
    Ok(())
}

fn connect(config: &config::Config, settings: Settings) -> Result<Session> {
    let service = remote::HttpService::new(
        &config.service.endpoint,
        config.api_token(),
        Duration::from_secs(config.service.timeout_seconds),
    )?;
    Ok(Session::new(Arc::new(service), settings))
}

fn handle_config_subcommand(out: &mut dyn Write, config_args: &ConfigArgs) -> Result<()> {
    match &config_args.subcommand {
        ConfigSubcommands::Init { overwrite } => {
            config::create_default_config(out, *overwrite).context("Failed to create config")
        }
        ConfigSubcommands::Show => config::show_config(out).context("Failed to show config"),
        ConfigSubcommands::Set { key, value } => {
            config::set_config_value(out, key, value).context("Failed to set config")
        }
    }
}
