use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloud_ingest::config::load_config;
use cloud_ingest::logging::{init_logging, LogOptions};
use cloud_ingest::{
    DownloadOptions, FileQuery, IngestClient, OperationStatus, SessionQuery, UploadOptions,
    WriteMode,
};
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cloud-ingest")]
#[command(about = "Upload files to a cloud workspace and wait for ingestion", version)]
struct Args {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write logs to ~/.cloud-ingest/logs
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload files and directories
    Upload {
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long, default_value_t = WriteMode::Keep)]
        write_mode: WriteMode,
        /// Walk directories recursively
        #[arg(long)]
        recursive: bool,
        /// Return once the session is closed instead of waiting for ingestion
        #[arg(long)]
        no_blocking: bool,
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Extensions to upload (repeatable); defaults to txt and pdf
        #[arg(long = "file-type")]
        file_types: Vec<String>,
    },
    /// Download workspace files into a local directory
    Download {
        #[arg(long, default_value = ".")]
        dir: String,
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        filter: Option<String>,
        /// Skip the .meta.json sidecar next to each file
        #[arg(long)]
        no_meta: bool,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// List files in a workspace
    ListFiles {
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        page_size: Option<u32>,
        /// Stop after this many files
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List upload sessions in a workspace
    ListSessions {
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long)]
        page_size: Option<u32>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show the ingestion status of an upload session
    SessionStatus {
        session_id: String,
        #[arg(long)]
        workspace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    init_logging(LogOptions {
        level: Some(args.log_level.clone()),
        file: args.log_file,
        logs_dir: None,
    })
    .context("Failed to initialize logging")?;

    let mut config = load_config().context("Failed to load configuration")?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    let resolved = config.resolve().context("Invalid configuration")?;
    let client = IngestClient::new(resolved).context("Failed to create client")?;

    match args.command {
        Command::Upload {
            paths,
            workspace,
            write_mode,
            recursive,
            no_blocking,
            timeout_secs,
            file_types,
        } => {
            let paths: Vec<PathBuf> = paths
                .iter()
                .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
                .collect();

            let cancel = CancellationToken::new();
            spawn_ctrl_c_handler(cancel.clone());

            let options = UploadOptions {
                workspace,
                write_mode,
                blocking: !no_blocking,
                timeout: timeout_secs.map(Duration::from_secs),
                recursive,
                allowed_types: (!file_types.is_empty()).then_some(file_types),
                cancel: Some(cancel),
                progress: None,
            };

            let report = client
                .upload_paths(&paths, options)
                .await
                .context("Upload failed")?;
            print_json(&report)?;

            Ok(exit_code(report.status))
        }
        Command::Download {
            dir,
            workspace,
            name,
            content,
            filter,
            no_meta,
            timeout_secs,
        } => {
            let cancel = CancellationToken::new();
            spawn_ctrl_c_handler(cancel.clone());

            let options = DownloadOptions {
                workspace,
                dir: PathBuf::from(shellexpand::tilde(&dir).as_ref()),
                query: FileQuery {
                    name,
                    content,
                    filter,
                    session_id: None,
                },
                include_meta: !no_meta,
                timeout: timeout_secs.map(Duration::from_secs),
                cancel: Some(cancel),
            };

            let report = client.download(options).await.context("Download failed")?;
            print_json(&report)?;
            Ok(exit_code(report.status))
        }
        Command::ListFiles {
            workspace,
            name,
            content,
            filter,
            page_size,
            limit,
        } => {
            let query = FileQuery {
                name,
                content,
                filter,
                session_id: None,
            };
            let files = client.list_files(workspace.as_deref(), query, page_size)?;
            print_json(&collect(files, limit).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::ListSessions {
            workspace,
            page_size,
            limit,
        } => {
            let sessions =
                client.list_sessions(workspace.as_deref(), SessionQuery::default(), page_size)?;
            print_json(&collect(sessions, limit).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::SessionStatus {
            session_id,
            workspace,
        } => {
            let status = client
                .get_session_status(workspace.as_deref(), &session_id)
                .await
                .with_context(|| format!("Failed to fetch status of session {}", session_id))?;
            print_json(&serde_json::json!({ "session_id": session_id, "status": status }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(status: OperationStatus) -> ExitCode {
    if status == OperationStatus::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Cancel the running transfer on Ctrl-C
fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            cancel.cancel();
        }
    });
}

async fn collect<T, S>(stream: S, limit: Option<usize>) -> Result<Vec<T>>
where
    S: Stream<Item = cloud_ingest::IngestResult<T>>,
{
    let items: Vec<T> = stream
        .take(limit.unwrap_or(usize::MAX))
        .try_collect()
        .await
        .context("Listing failed")?;
    info!(count = items.len(), "Listed items");
    Ok(items)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
