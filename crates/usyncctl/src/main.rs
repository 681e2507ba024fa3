//! usyncctl: command-line front end over the UsenetSync operations facade.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::error::Kinded;
use common::{EngineConfig, FolderId, ItemState, SegmentPolicy, ServerProfile, UserId};
use engine::{AccessSpec, Credentials, Handle, Recipient, UsenetSync};
use store::{SqliteStore, Store};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let format = std::env::var("USYNC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

        if format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .flatten_event(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
    });
}

#[derive(Debug, Deserialize)]
struct Config {
    /// Path of the embedded metadata store.
    #[serde(default = "default_store_path")]
    store: String,
    server: ServerProfile,
    #[serde(default)]
    policy: SegmentPolicy,
    #[serde(default)]
    engine: Option<EngineConfig>,
}

fn default_store_path() -> String {
    "usenetsync.db".to_string()
}

#[derive(Parser)]
#[command(name = "usyncctl")]
#[command(about = "UsenetSync publish/retrieve control utility", long_about = None)]
struct Cli {
    /// TOML configuration with server profile and policy.
    #[arg(long, default_value = "usenetsync.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a user identity; prints the secret key once.
    CreateUser { name: String },
    /// Register a local folder for publishing.
    AddFolder {
        path: String,
        /// Owner user name.
        #[arg(long)]
        owner: String,
    },
    /// Scan a folder and reconcile its file records.
    Index { folder_id: String },
    /// Post all pending segments of an indexed folder.
    Upload { folder_id: String },
    /// Build, post, and share the core index of an uploaded folder.
    Publish {
        folder_id: String,
        /// public, protected, or private
        #[arg(long, default_value = "public")]
        access: String,
        #[arg(long)]
        passphrase: Option<String>,
        /// user_id:public_key hex pairs for private shares.
        #[arg(long)]
        recipient: Vec<String>,
        /// Unix timestamp after which the share is refused.
        #[arg(long)]
        expires_at: Option<u64>,
    },
    /// Fetch a share into a destination directory.
    Download {
        token: String,
        dest: PathBuf,
        #[arg(long)]
        passphrase: Option<String>,
        /// Hex user id, for private shares.
        #[arg(long)]
        user_id: Option<String>,
        /// Hex X25519 secret key, for private shares.
        #[arg(long)]
        secret_key: Option<String>,
        /// Restrict to these relative paths.
        #[arg(long)]
        only: Vec<String>,
    },
    /// Show a transfer's progress snapshot.
    Progress { handle: String },
    /// List registered folders and their states.
    Folders,
}

#[derive(Debug)]
struct CliError {
    message: String,
    code: i32,
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<engine::EngineError> for CliError {
    fn from(err: engine::EngineError) -> Self {
        Self {
            code: err.kind().exit_code(),
            message: err.to_string(),
        }
    }
}

impl From<store::StoreError> for CliError {
    fn from(err: store::StoreError) -> Self {
        Self {
            code: err.kind().exit_code(),
            message: err.to_string(),
        }
    }
}

fn usage(message: impl Into<String>) -> CliError {
    CliError {
        message: message.into(),
        code: 2,
    }
}

fn parse_folder_id(raw: &str) -> Result<FolderId, CliError> {
    FolderId::from_hex(raw).ok_or_else(|| usage(format!("bad folder id: {raw}")))
}

async fn wait_for(sync: &UsenetSync, handle: &Handle) -> Result<ItemState, CliError> {
    loop {
        let progress = sync.progress(handle).await?;
        info!(
            handle = %handle,
            state = progress.state.as_str(),
            done = progress.bytes_done,
            total = progress.bytes_total,
            "transfer progress"
        );
        match progress.state {
            ItemState::Completed => return Ok(ItemState::Completed),
            ItemState::Failed => {
                return Err(CliError {
                    message: progress
                        .last_error
                        .unwrap_or_else(|| "transfer failed".to_string()),
                    code: 5,
                })
            }
            ItemState::Paused => return Ok(ItemState::Paused),
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let raw = std::fs::read_to_string(&cli.config)
        .map_err(|e| usage(format!("cannot read {}: {e}", cli.config.display())))?;
    let config: Config =
        toml::from_str(&raw).map_err(|e| usage(format!("bad configuration: {e}")))?;
    config
        .policy
        .validate()
        .map_err(|e| usage(format!("bad policy: {e}")))?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.store)?);
    let engine_config = config
        .engine
        .unwrap_or_else(|| EngineConfig::for_profile(&config.server));
    let sync = UsenetSync::new(store, config.server, config.policy, engine_config);

    match cli.command {
        Commands::CreateUser { name } => {
            let descriptor = sync.create_user(&name).await?;
            println!("user_id:    {}", descriptor.user.user_id);
            println!("api_key:    {}", descriptor.user.api_key);
            println!("public_key: {}", hex::encode(descriptor.user.public_key));
            // Shown exactly once; the store never keeps it.
            println!("secret_key: {}", hex::encode(descriptor.secret_key));
        }
        Commands::AddFolder { path, owner } => {
            let user = sync
                .store()
                .user_by_name(&owner)
                .await?
                .ok_or_else(|| usage(format!("unknown user: {owner}")))?;
            let folder_id = sync.add_folder(&path, &user.user_id).await?;
            println!("{folder_id}");
        }
        Commands::Index { folder_id } => {
            let id = parse_folder_id(&folder_id)?;
            let stats = sync.index_folder(&id).await?;
            println!(
                "indexed {} files ({} unchanged, {} packable, {} bytes, {} errors)",
                stats.files_indexed,
                stats.files_unchanged,
                stats.files_packable,
                stats.total_size,
                stats.errors
            );
        }
        Commands::Upload { folder_id } => {
            let id = parse_folder_id(&folder_id)?;
            let handle = sync.upload_folder(&id).await?;
            println!("handle: {handle}");
            wait_for(&sync, &handle).await?;
            println!("upload complete");
        }
        Commands::Publish {
            folder_id,
            access,
            passphrase,
            recipient,
            expires_at,
        } => {
            let id = parse_folder_id(&folder_id)?;
            let spec = match access.as_str() {
                "public" => AccessSpec::Public,
                "protected" => AccessSpec::Protected {
                    passphrase: passphrase
                        .ok_or_else(|| usage("--passphrase required for protected shares"))?,
                    kdf: crypto::kdf::KdfParams::default(),
                },
                "private" => {
                    let mut recipients = Vec::with_capacity(recipient.len());
                    for entry in &recipient {
                        let (id_hex, key_hex) = entry
                            .split_once(':')
                            .ok_or_else(|| usage("--recipient wants user_id:public_key"))?;
                        let user_id = UserId::from_hex(id_hex)
                            .ok_or_else(|| usage(format!("bad user id: {id_hex}")))?;
                        let key: [u8; 32] = hex::decode(key_hex)
                            .ok()
                            .and_then(|v| v.try_into().ok())
                            .ok_or_else(|| usage(format!("bad public key: {key_hex}")))?;
                        recipients.push(Recipient {
                            user_id,
                            public_key: key,
                        });
                    }
                    if recipients.is_empty() {
                        return Err(usage("private shares need at least one --recipient"));
                    }
                    AccessSpec::Private { recipients }
                }
                other => return Err(usage(format!("unknown access type: {other}"))),
            };
            let (record, token) = sync.publish_folder(&id, &spec, expires_at).await?;
            println!("share_id: {}", record.share_id);
            println!("{token}");
        }
        Commands::Download {
            token,
            dest,
            passphrase,
            user_id,
            secret_key,
            only,
        } => {
            let credentials = match (passphrase, user_id, secret_key) {
                (Some(pass), None, None) => Credentials::Passphrase(pass),
                (None, Some(id_hex), Some(key_hex)) => {
                    let user_id = UserId::from_hex(&id_hex)
                        .ok_or_else(|| usage(format!("bad user id: {id_hex}")))?;
                    let secret: [u8; 32] = hex::decode(&key_hex)
                        .ok()
                        .and_then(|v| v.try_into().ok())
                        .ok_or_else(|| usage("bad secret key"))?;
                    Credentials::User {
                        user_id,
                        keypair: crypto::UserKeyPair::from_secret_bytes(secret),
                    }
                }
                (None, None, None) => Credentials::Anonymous,
                _ => return Err(usage("pass either --passphrase or --user-id with --secret-key")),
            };
            let selectors: Option<HashSet<String>> =
                (!only.is_empty()).then(|| only.into_iter().collect());
            let handle = sync
                .download_share(&token, &credentials, dest, selectors)
                .await?;
            println!("handle: {handle}");
            wait_for(&sync, &handle).await?;
            println!("download complete");
        }
        Commands::Progress { handle } => {
            let handle: Handle = handle.parse()?;
            let progress = sync.progress(&handle).await?;
            println!("{}", serde_json::to_string_pretty(&progress).map_err(|e| usage(e.to_string()))?);
        }
        Commands::Folders => {
            for folder in sync.store().list_folders().await? {
                println!(
                    "{}  {:10}  {:6} files  {:12} bytes  {}",
                    folder.folder_id,
                    folder.state.as_str(),
                    folder.stats.file_count,
                    folder.stats.total_size,
                    folder.path
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("usyncctl: {err}");
            ExitCode::from(err.code.clamp(1, 255) as u8)
        }
    }
}
