//! blobcache CLI
//!
//! Resolves paths in a B2 bucket through the local disk cache.

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use std::env;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use blobcache::{BlobFileProvider, FileInfo, LookupOptions, ProviderConfig};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Print metadata of one file
    Stat { path: String, lookup: LookupArgs },
    /// List objects under a prefix
    List { prefix: String },
    /// Write a file's content to stdout
    Cat { path: String, lookup: LookupArgs },
    /// Show help
    Help,
}

/// Cache bypass requested on the command line
#[derive(Debug, Default, Clone)]
struct LookupArgs {
    ignore_cache: bool,
    query: Option<String>,
}

#[derive(Debug)]
struct Invocation {
    config: Option<PathBuf>,
    command: Command,
}

fn print_help() {
    eprintln!(
        r#"blobcache - Read-through local cache for Backblaze B2

USAGE:
    blobcache [--config <file>] stat <path> [--ignore-cache | --query <query>]
    blobcache [--config <file>] ls [prefix]
    blobcache [--config <file>] cat <path> [--ignore-cache | --query <query>]
    blobcache help

COMMANDS:
    stat    Print size, modification time and cache source of a file
    ls      List objects whose name starts with the prefix
    cat     Write a file's content to stdout
    help    Show this help message

OPTIONS:
    --config <file>     JSON config file (default: environment)
    --ignore-cache      Bypass the local cache for this lookup
    --query <query>     Raw request query string, e.g. "ignoreCache=true"
                        (the key follows ignoreCacheQueryKey)

ENVIRONMENT:
    BLOBCACHE_CONTAINER_NAME         Bucket name
    BLOBCACHE_CONTAINER_ID           Bucket id (token auth)
    BLOBCACHE_CONNECTION_STRING      KeyId=<id>;ApplicationKey=<key>
    BLOBCACHE_SERVICE_URI            API URL (token auth)
    BLOBCACHE_TOKEN                  Authorization token (token auth)
    BLOBCACHE_LOCAL_CACHE_ROOT       Local cache directory
    BLOBCACHE_LOCAL_CACHE_TIMEOUT    Trust window in seconds (default 300)
    BLOBCACHE_IGNORE_CACHE_QUERY_KEY Bypass query key (default ignoreCache)
    BLOBCACHE_LOOKUP_MODE            exact | prefix (default exact)
    RUST_LOG                         Log filter (trace, debug, info, warn, error)
"#
    );
}

fn take_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next().ok_or_else(|| anyhow!("{} requires a value", flag))
}

fn parse_args(args: Vec<String>) -> Result<Invocation> {
    let mut config = None;
    let mut lookup = LookupArgs::default();
    let mut positional = Vec::new();

    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(take_value(&mut args, "--config")?)),
            "--ignore-cache" => lookup.ignore_cache = true,
            "--query" => lookup.query = Some(take_value(&mut args, "--query")?),
            "help" | "--help" | "-h" => {
                return Ok(Invocation {
                    config,
                    command: Command::Help,
                })
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("stat") => Command::Stat {
            path: positional
                .next()
                .ok_or_else(|| anyhow!("Usage: blobcache stat <path>"))?,
            lookup: lookup.clone(),
        },
        Some("cat") => Command::Cat {
            path: positional
                .next()
                .ok_or_else(|| anyhow!("Usage: blobcache cat <path>"))?,
            lookup: lookup.clone(),
        },
        Some("ls") => Command::List {
            prefix: positional.next().unwrap_or_default(),
        },
        Some(other) => return Err(anyhow!("Unknown command: {}", other)),
        None => Command::Help,
    };

    Ok(Invocation { config, command })
}

fn load_config(path: Option<&PathBuf>) -> Result<ProviderConfig> {
    let config = match path {
        Some(path) => ProviderConfig::from_file(path)?,
        None => ProviderConfig::from_env()?,
    };
    Ok(config)
}

fn options_for(provider: &BlobFileProvider, lookup: &LookupArgs) -> LookupOptions {
    if lookup.ignore_cache {
        return LookupOptions { ignore_cache: true };
    }
    lookup
        .query
        .as_deref()
        .map(|q| provider.lookup_options(q))
        .unwrap_or_default()
}

fn describe(info: &FileInfo) -> String {
    let modified = info
        .last_modified()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|| "-".to_string());
    let source = match info.physical_path() {
        Some(path) => format!("cache:{}", path.display()),
        None => "remote".to_string(),
    };
    format!("{}\t{}\t{}\t{}", info.name(), info.len(), modified, source)
}

async fn run(config: ProviderConfig, command: Command) -> Result<()> {
    let provider = BlobFileProvider::connect(&config)
        .await
        .context("Failed to start provider")?;

    match command {
        Command::Stat { path, lookup } => {
            let options = options_for(&provider, &lookup);
            let info = provider.get_file_info_with(&path, options).await?;
            if !info.exists() {
                return Err(anyhow!("Not found: {}", path));
            }
            println!("{}", describe(&info));
        }
        Command::Cat { path, lookup } => {
            let options = options_for(&provider, &lookup);
            let info = provider.get_file_info_with(&path, options).await?;
            let mut content = info.open_read().await?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = content.try_next().await? {
                stdout.write_all(&chunk).await?;
            }
            stdout.flush().await?;
        }
        Command::List { prefix } => {
            let listing = provider.get_directory_contents(&prefix).await?;
            for info in &listing {
                println!("{}", describe(info));
            }
            info!(prefix = %prefix, count = listing.len(), "Listing complete");
        }
        Command::Help => print_help(),
    }

    provider.log_metrics();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so `cat` output stays clean
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let invocation = match parse_args(env::args().collect()) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = invocation.command {
        print_help();
        return Ok(());
    }

    let config = load_config(invocation.config.as_ref())?;
    if let Err(e) = run(config, invocation.command).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("blobcache")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_stat_with_flags() {
        let inv = parse_args(args(&["--config", "c.json", "stat", "a/b.txt", "--ignore-cache"])).unwrap();
        assert_eq!(inv.config, Some(PathBuf::from("c.json")));
        match inv.command {
            Command::Stat { path, lookup } => {
                assert_eq!(path, "a/b.txt");
                assert!(lookup.ignore_cache);
                assert!(lookup.query.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_ls_defaults_to_root() {
        let inv = parse_args(args(&["ls"])).unwrap();
        assert!(matches!(inv.command, Command::List { prefix } if prefix.is_empty()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(args(&["stat"])).is_err());
        assert!(parse_args(args(&["frobnicate"])).is_err());
        assert!(parse_args(args(&["--config"])).is_err());
        assert!(matches!(parse_args(args(&[])).unwrap().command, Command::Help));
    }
}
