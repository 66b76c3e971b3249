//! graphcache - Normalized GraphQL response cache
//!
//! Main entry point for the graphcache CLI, which inspects and maintains the
//! persistent SQLite cache.

use clap::{Parser, Subcommand};
use graphcache::cache::{NormalizedCache, SqliteCache, SqliteCacheConfig};
use graphcache::{CacheConfig, CacheError, CacheHeaders, CacheKey, Record};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

/// graphcache - Inspect and maintain a normalized GraphQL cache
#[derive(Parser, Debug)]
#[command(name = "graphcache")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/graphcache/config.yaml)
    #[arg(short, long, env = "GRAPHCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database to operate on (overrides the config file)
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Print stored records as JSON
    Dump {
        /// Only records whose key matches this glob pattern
        #[arg(short, long)]
        pattern: Option<String>,
    },

    /// Print one record as JSON
    Get {
        /// Record key (e.g., Human:1000, QUERY_ROOT)
        key: String,
    },

    /// Remove a record
    Remove {
        key: String,

        /// Also remove records only reachable through this one
        #[arg(long)]
        cascade: bool,
    },

    /// Remove every record whose key matches a glob pattern
    RemoveMatching {
        /// Glob pattern (*, ?, [..])
        pattern: String,
    },

    /// Remove every record
    Clear,

    /// Show cache statistics
    Stats,

    /// Print cache metrics in Prometheus text format
    Metrics,
}

fn main() {
    // Initialize logging
    if let Err(e) = graphcache::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> graphcache::Result<()> {
    if let Commands::Init = cli.command {
        return handle_init_command(cli.config);
    }

    let cache = SqliteCache::open(sqlite_config(&cli)?)?;

    match cli.command {
        Commands::Dump { pattern } => {
            let matcher = pattern
                .as_deref()
                .map(glob::Pattern::new)
                .transpose()?;
            let records: BTreeMap<CacheKey, Record> = cache
                .dump()?
                .into_values()
                .flatten()
                .filter(|(key, _)| matcher.as_ref().map_or(true, |m| m.matches(key.as_str())))
                .collect();
            println!("{}", serde_json::to_string_pretty(&records)?);
        }

        Commands::Get { key } => {
            let key = CacheKey::new(key);
            match cache.load_record(&key, &CacheHeaders::NONE)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => {
                    return Err(CacheError::Miss(graphcache::CacheMiss::record(
                        key,
                        Vec::new(),
                    )))
                }
            }
        }

        Commands::Remove { key, cascade } => {
            if cache.remove(&CacheKey::new(key.clone()), cascade)? {
                println!("Removed {}", key);
            } else {
                println!("No record for {}", key);
            }
        }

        Commands::RemoveMatching { pattern } => {
            let removed = cache.remove_matching(&pattern)?;
            println!("Removed {} records matching {}", removed, pattern);
        }

        Commands::Clear => {
            cache.clear_all()?;
            println!("Cache cleared successfully");
        }

        Commands::Stats => {
            let stats = cache.stats()?;
            println!("Cache Statistics:");
            println!();
            println!("  Database:         {}", stats.path.display());
            println!("  Records:          {}", stats.record_count);
            match stats.last_written_at {
                Some(at) => println!("  Last written:     {}", at.to_rfc3339()),
                None => println!("  Last written:     never"),
            }
        }

        Commands::Metrics => {
            // Sets the stored-records gauge; counters only cover this process
            cache.stats()?;
            print!("{}", graphcache::metrics::encode_metrics()?);
        }

        Commands::Init => {
            unreachable!("Init is handled before opening the cache")
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> graphcache::Result<CacheConfig> {
    match path {
        Some(path) => CacheConfig::load(path),
        None => match CacheConfig::load_default() {
            Ok(config) => Ok(config),
            Err(CacheError::Config(msg)) if msg.contains("Config file not found") => {
                tracing::debug!("No configuration file, using defaults");
                Ok(CacheConfig::default())
            }
            Err(e) => Err(e),
        },
    }
}

fn sqlite_config(cli: &Cli) -> graphcache::Result<SqliteCacheConfig> {
    if let Some(database) = &cli.database {
        return Ok(SqliteCacheConfig::new(database));
    }
    let config = load_config(cli.config.as_ref())?;
    Ok(config.sqlite.unwrap_or_default())
}

fn handle_init_command(config_path: Option<PathBuf>) -> graphcache::Result<()> {
    let config_file = config_path.unwrap_or_else(CacheConfig::default_path);

    if config_file.exists() {
        println!("Configuration already exists at {}", config_file.display());
        return Ok(());
    }

    let mut config = CacheConfig::new();
    config.sqlite = Some(SqliteCacheConfig::default());
    config.save(&config_file)?;

    println!("Created configuration at {}", config_file.display());
    Ok(())
}
