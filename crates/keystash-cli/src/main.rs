use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use keystash_core::paths::config_path;
use keystash_core::{
    EntryPersistence, FileAuthState, KeyData, KeyPrimitives, KeyStore, KeyType, KeyedMutex,
    KeystashConfig, StoreError,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Lock key guarding the credential counters.
const CREDS_LOCK: &str = "creds";

#[derive(Parser, Debug)]
#[command(name = "keystash")]
#[command(about = "Manage protocol client auth state on disk", long_about = None)]
struct Cli {
    /// Path to a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log everything
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create credentials unless the directory already holds some
    Init {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Print the public parts of the stored credentials
    Show {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Generate and store a batch of one-time pre-keys
    NextPreKeys {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(short, long, default_value = "30")]
        count: u32,
        /// Write pre-keys to disk regardless of the configured persistence
        #[arg(long)]
        persist: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_file = match &cli.config {
        Some(path) => path.clone(),
        None => config_path()?,
    };
    let config = KeystashConfig::load(&config_file)
        .with_context(|| format!("cannot load config from {}", config_file.display()))?;

    match cli.command {
        Commands::Init { dir } => {
            let dir = resolve_dir(dir, &config)?;
            let summary = init_command(&dir, &config).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Show { dir } => {
            let dir = resolve_dir(dir, &config)?;
            let summary = show_command(&dir, &config).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::NextPreKeys {
            dir,
            count,
            persist,
        } => {
            let dir = resolve_dir(dir, &config)?;
            let mut config = config;
            if persist {
                config.persistence = EntryPersistence::Durable;
            }
            let (first, next) = next_pre_keys_command(&dir, &config, count).await?;
            println!("Generated pre-keys {}..{}", first, next);
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_dir(dir: Option<PathBuf>, config: &KeystashConfig) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => Ok(config.auth_dir()?),
    }
}

async fn open(dir: &Path, config: &KeystashConfig) -> Result<FileAuthState> {
    FileAuthState::open(dir, config.file_store_options())
        .await
        .with_context(|| format!("cannot open auth state at {}", dir.display()))
}

fn summary(state: &FileAuthState) -> serde_json::Value {
    let creds = state.creds();
    serde_json::json!({
        "dir": state.root().display().to_string(),
        "registered": creds.registered,
        "registrationId": creds.registration_id,
        "identityKey": creds.signed_identity_key.public_b64(),
        "identityFingerprint": creds.signed_identity_key.fingerprint(),
        "identityId": hex::encode(&creds.identity_id),
        "deviceId": creds.device_id,
        "nextPreKeyId": creds.next_pre_key_id,
        "firstUnuploadedPreKeyId": creds.first_unuploaded_pre_key_id,
    })
}

async fn init_command(dir: &Path, config: &KeystashConfig) -> Result<serde_json::Value> {
    let state = open(dir, config).await?;
    if state.bootstrapped() {
        state.save_creds().await?;
        info!(dir = %dir.display(), "created credentials");
    } else {
        info!(dir = %dir.display(), "credentials already present");
    }
    Ok(summary(&state))
}

async fn show_command(dir: &Path, config: &KeystashConfig) -> Result<serde_json::Value> {
    let state = open(dir, config).await?;
    if state.bootstrapped() {
        return Err(anyhow!(
            "no credentials at {}, run `keystash init` first",
            dir.display()
        ));
    }
    Ok(summary(&state))
}

/// Returns the first generated id and the next free id.
async fn next_pre_keys_command(
    dir: &Path,
    config: &KeystashConfig,
    count: u32,
) -> Result<(u32, u32)> {
    if count == 0 {
        return Err(anyhow!("count must be at least 1"));
    }
    let state = open(dir, config).await?;
    if state.bootstrapped() {
        return Err(anyhow!(
            "no credentials at {}, run `keystash init` first",
            dir.display()
        ));
    }
    let options = config.file_store_options();
    let store = state.signal_key_store(config.signal_cache_ttl(), config.transaction);
    let locks = KeyedMutex::new();

    let first = locks
        .mutex(CREDS_LOCK, || async {
            let first = store
                .transaction(|| async {
                    let first = state.update_creds(|c| c.reserve_pre_key_ids(count));
                    let mut data = KeyData::new();
                    for id in first..first + count {
                        let pair = options.primitives.generate_key_pair()?;
                        data.entry(KeyType::PreKey)
                            .or_default()
                            .insert(id.to_string(), Some(Bytes::from(serde_json::to_vec(&pair)?)));
                    }
                    store.set(data).await?;
                    Ok::<_, StoreError>(first)
                })
                .await?;
            state.save_creds().await?;
            Ok::<_, StoreError>(first)
        })
        .await?;

    if config.persistence == EntryPersistence::Ephemeral {
        info!("pre-keys were kept in memory only, pass --persist to write them");
    }
    Ok((first, first + count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        let config = KeystashConfig::default();

        let first = init_command(dir.path(), &config).await.unwrap();
        let second = init_command(dir.path(), &config).await.unwrap();
        assert_eq!(first["identityKey"], second["identityKey"]);
        assert_eq!(first["nextPreKeyId"], 1);
    }

    #[tokio::test]
    async fn show_requires_init() {
        let dir = tempdir().unwrap();
        let config = KeystashConfig::default();
        assert!(show_command(dir.path(), &config).await.is_err());
        // The failed show does not create credentials.
        assert!(!dir.path().join("creds.json").exists());

        init_command(dir.path(), &config).await.unwrap();
        let shown = show_command(dir.path(), &config).await.unwrap();
        assert_eq!(shown["registered"], false);
    }

    #[tokio::test]
    async fn pre_keys_advance_counter_and_persist() {
        let dir = tempdir().unwrap();
        let config = KeystashConfig {
            persistence: EntryPersistence::Durable,
            ..Default::default()
        };
        init_command(dir.path(), &config).await.unwrap();

        assert_eq!(next_pre_keys_command(dir.path(), &config, 3).await.unwrap(), (1, 4));
        assert_eq!(next_pre_keys_command(dir.path(), &config, 2).await.unwrap(), (4, 6));
        for id in 1..6 {
            assert!(dir.path().join(format!("pre-key.{}.json", id)).is_file());
        }

        let shown = show_command(dir.path(), &config).await.unwrap();
        assert_eq!(shown["nextPreKeyId"], 6);
    }

    #[tokio::test]
    async fn zero_pre_keys_is_rejected() {
        let dir = tempdir().unwrap();
        let config = KeystashConfig::default();
        init_command(dir.path(), &config).await.unwrap();
        assert!(next_pre_keys_command(dir.path(), &config, 0).await.is_err());
    }
}
