//! reportbox - server and operator commands.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use reportbox_server::auth::AuthService;
use reportbox_server::password::{MIN_PASSWORD_LEN, hash_password};
use reportbox_server::{AppState, ServerConfig, run_with_shutdown};
use reportbox_storage::{
    BlobResolver, HttpBlobStore, JsonRecordStore, LocalBlobStore, RecordStore, Role, User,
};

/// Report submission server with streamed bulk export
#[derive(Parser)]
#[command(name = "reportbox")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Listen address, overrides the configuration
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Write an archive of stored reports to a file
    Export(ExportArgs),
    /// Mint a session token for an existing user
    Token {
        #[arg(long)]
        user_id: String,
    },
    /// Create an account, typically a teacher
    CreateUser(CreateUserArgs),
}

#[derive(ClapArgs)]
struct CreateUserArgs {
    /// Login number
    #[arg(long)]
    student_id: String,

    /// Display name
    #[arg(long)]
    name: String,

    /// TEACHER or STUDENT
    #[arg(long, default_value = "TEACHER")]
    role: Role,

    /// Initial password
    #[arg(long, env = "REPORTBOX_NEW_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(ClapArgs)]
struct ExportArgs {
    /// Export every stored report
    #[arg(long, conflicts_with = "ids", required_unless_present = "ids")]
    all: bool,

    /// Comma-separated report ids, archived in this order
    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,

    /// Archive file to write
    #[arg(short, long)]
    out: PathBuf,

    /// Delete the exported reports afterwards, only if nothing was skipped
    #[arg(long)]
    purge: bool,
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ServerConfig> {
    match path {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => ServerConfig::from_env().context("Failed to load config from environment"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_logs);

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Export(export) => export_to_file(config, export).await,
        Command::Token { user_id } => mint_token(config, &user_id).await,
        Command::CreateUser(user) => create_user(config, user).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(mut config: ServerConfig, listen: Option<String>) -> anyhow::Result<ExitCode> {
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }

    info!("Graceful shutdown timeout: {}s", config.shutdown_timeout);
    info!("Press Ctrl+C to stop");

    let shutdown = async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
        }
    };

    run_with_shutdown(config, shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

async fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<JsonRecordStore>> {
    let paths = config.storage.paths()?;
    Ok(Arc::new(JsonRecordStore::open(paths).await?))
}

async fn export_to_file(config: ServerConfig, args: ExportArgs) -> anyhow::Result<ExitCode> {
    let paths = config.storage.paths()?;
    let store = open_store(&config).await?;
    let blobs = BlobResolver::new(
        LocalBlobStore::new(paths.uploads_dir),
        HttpBlobStore::new(config.export.http_timeout())?,
    );
    let state = AppState::with_parts(config, store.clone(), Arc::new(blobs));

    let ids = if args.all {
        store.all_report_ids().await
    } else {
        args.ids
    };
    if ids.is_empty() {
        println!("No reports to export.");
        return Ok(ExitCode::SUCCESS);
    }

    let archive = state.exports.export_archive(ids).await?;
    let mut file = tokio::fs::File::create(&args.out)
        .await
        .with_context(|| format!("Failed to create {}", args.out.display()))?;

    let mut body = archive.body;
    let mut write_error = None;
    while let Some(chunk) = body.next().await {
        let written = match chunk {
            Ok(bytes) => file.write_all(&bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            write_error = Some(e);
            break;
        }
    }
    // Closing the channel stops the writer if we bailed out early.
    drop(body);
    let flushed = file.flush().await;
    let outcome = archive.outcome.await?;

    if let Some(e) = write_error.or(flushed.err()) {
        if let Err(remove) = tokio::fs::remove_file(&args.out).await {
            warn!("Failed to remove partial archive {}: {remove}", args.out.display());
        }
        bail!("Export {} aborted: {e}", outcome.export_id);
    }

    println!("Wrote {} ({} bytes)", args.out.display(), outcome.bytes_written);
    println!("  archived:   {}", outcome.entries.len());
    for failure in &outcome.failures {
        println!(
            "  skipped:    {} ({}): {}",
            failure.report_id, failure.location, failure.reason
        );
    }
    for id in &outcome.unresolved {
        println!("  not found:  {id}");
    }
    for id in &outcome.superseded {
        println!("  superseded: {id}");
    }

    if !args.purge {
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(reason) = outcome.purge_blocker() {
        println!("Not purging: {reason}");
        return Ok(ExitCode::FAILURE);
    }
    let summary = state.exports.purge(&outcome.export_id).await?;
    println!("Purged {} report(s)", summary.deleted);
    Ok(ExitCode::SUCCESS)
}

async fn mint_token(config: ServerConfig, user_id: &str) -> anyhow::Result<ExitCode> {
    let store = open_store(&config).await?;
    let Some(user) = store.get_user(user_id).await? else {
        bail!("No user with id {user_id}");
    };

    let token = AuthService::new(config.auth).issue_token(&user)?;
    println!("{token}");
    Ok(ExitCode::SUCCESS)
}

async fn create_user(config: ServerConfig, args: CreateUserArgs) -> anyhow::Result<ExitCode> {
    if args.password.chars().count() < MIN_PASSWORD_LEN {
        bail!("Password must be at least {MIN_PASSWORD_LEN} characters");
    }
    let store = open_store(&config).await?;
    let hash = hash_password(args.password).await?;

    let user = store
        .insert_user(User::new(args.student_id, args.name, args.role).with_password_hash(hash))
        .await?;
    info!(user_id = %user.id, role = %user.role, "User created");
    println!("{}", user.id);
    Ok(ExitCode::SUCCESS)
}
