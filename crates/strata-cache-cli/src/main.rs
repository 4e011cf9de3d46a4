//! Strata Cache CLI entrypoint: a thin wrapper over `strata_cache::CacheEngine`
//! for driving the cache from a shell or a CI step directly, without a
//! runner integration in front of it.

use clap::{Parser, Subcommand};
use strata_cache::{CacheConfig, CacheEngine, CompressionPolicy};

mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "strata-cache")]
#[command(author, version, about = "Content-addressed build-artifact cache", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    owner: Option<String>,
    #[arg(long, global = true)]
    repo: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save paths under a key.
    Save {
        key: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Look up a key, falling back to restore-key prefixes.
    Resolve {
        key: String,
        #[arg(long = "restore-key")]
        restore_keys: Vec<String>,
    },
    /// Resolve a key and extract its archive into a target directory.
    Restore {
        key: String,
        #[arg(long = "restore-key")]
        restore_keys: Vec<String>,
        #[arg(long, default_value = ".")]
        target: String,
    },
    /// Check whether a key has a live entry.
    Exists { key: String },
    /// Show the current index.
    Index,
    /// Print or set persisted CLI configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved configuration.
    Show,
    /// Set the repository scope used when `--owner`/`--repo` are omitted.
    SetScope { owner: String, repo: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cli_config = CliConfig::load().unwrap_or_default();

    if let Commands::Config { command } = cli.command {
        return run_config_command(cli_config, command);
    }

    let owner = cli
        .owner
        .or(cli_config.owner.clone())
        .ok_or("owner not set: pass --owner or run `strata-cache config set-scope`")?;
    let repo = cli
        .repo
        .or(cli_config.repo.clone())
        .ok_or("repo not set: pass --repo or run `strata-cache config set-scope`")?;
    let engine = CacheEngine::local(CacheConfig::local(owner, repo, cli_config.base_path))?;

    match cli.command {
        Commands::Save { key, paths } => {
            let entry = engine.save(&key, &paths, None, CompressionPolicy::default()).await?;
            println!("saved {} ({} bytes)", entry.key, entry.size_bytes);
        }
        Commands::Resolve { key, restore_keys } => {
            let result = engine.resolve(&key, &restore_keys).await?;
            match result.entry {
                Some(entry) => println!(
                    "hit: {} (exact={}, archive={})",
                    entry.key, result.is_exact_match, entry.archive_path
                ),
                None => println!("miss"),
            }
        }
        Commands::Restore { key, restore_keys, target } => {
            let result = engine.resolve(&key, &restore_keys).await?;
            match result.entry {
                Some(entry) => {
                    engine.restore(&entry, std::path::Path::new(&target)).await?;
                    println!("restored {} into {target}", entry.key);
                }
                None => println!("miss, nothing to restore"),
            }
        }
        Commands::Exists { key } => {
            println!("{}", engine.exists(&key).await?);
        }
        Commands::Index => {
            let index = engine.get_index().await?;
            println!("{}", serde_json::to_string_pretty(&index)?);
        }
        Commands::Config { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn run_config_command(
    mut config: CliConfig,
    command: ConfigCommands,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match command {
        ConfigCommands::Show => {
            println!("{}", serde_yaml::to_string(&config)?);
        }
        ConfigCommands::SetScope { owner, repo } => {
            config.owner = Some(owner);
            config.repo = Some(repo);
            config.save()?;
            println!("scope saved");
        }
    }
    Ok(())
}
