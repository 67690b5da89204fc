use clap::{Parser, Subcommand};
use picshift::agent::HttpAgentClient;
use picshift::backend::HttpBackend;
use picshift::config::Config;
use picshift::download::DownloadService;
use picshift::network::HttpReachabilityProbe;
use picshift::source::HttpSourceFetcher;
use picshift::storage::JsonFileStorage;
use picshift::transfer::{
    AlbumRef, BatchError, BatchRequest, Collaborators, RetryRequest, RunSummary, TransferHandle,
    TransferService,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "picshift")]
#[command(about = "Move gallery albums from the source site to cloud storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer every album (or the selected ones) one after another
    Batch {
        /// Source-site routing key
        #[arg(long)]
        domain: String,

        /// Pause before each file, in milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,

        /// Album id to include (repeatable); all albums when omitted
        #[arg(long = "album")]
        albums: Vec<String>,
    },

    /// Transfer the first files of one album
    Single {
        #[arg(long)]
        album_id: String,

        #[arg(long)]
        album_name: String,

        /// Number of files to transfer
        #[arg(long)]
        count: usize,

        #[arg(long)]
        domain: String,

        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },

    /// Retry the failed files of the last run
    Retry {
        #[arg(long)]
        domain: Option<String>,

        #[arg(long)]
        delay_ms: Option<u64>,

        /// Only retry these album ids (repeatable)
        #[arg(long = "album")]
        albums: Vec<String>,
    },

    /// Show the last run and the failure ledger
    Status,

    /// Forget the last run
    ClearLastRun,

    /// List albums known to the page agent
    Albums,

    /// Save the first files of one album to a local directory, without uploading
    Download {
        #[arg(long)]
        album_id: String,

        /// Number of files to download
        #[arg(long)]
        count: usize,

        /// Target directory (created if missing)
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    // Use RUST_LOG env var if set, otherwise default to info level
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = Config::load().map_err(|e| format!("Configuration error: {}", e))?;

    let storage = JsonFileStorage::open(config.state_dir.clone())
        .await
        .map_err(|e| format!("Failed to open state directory: {}", e))?;

    let agent = Arc::new(HttpAgentClient::new(config.agent_url.clone()));
    let fetcher = Arc::new(HttpSourceFetcher::new(config.session_cookie.clone()));

    let collaborators = Collaborators {
        backend: Arc::new(HttpBackend::new(
            config.backend_url.clone(),
            config.auth_token.clone(),
        )),
        fetcher: fetcher.clone(),
        catalog: agent.clone(),
        agent: agent.clone(),
        probe: Arc::new(HttpReachabilityProbe::new(config.probe_url.clone())),
    };

    let handle = TransferService::start(
        tokio::runtime::Handle::current(),
        Arc::new(storage),
        collaborators,
        config.transfer.clone(),
    )
    .await;

    match cli.command {
        Commands::Batch {
            domain,
            delay_ms,
            albums,
        } => {
            let request = BatchRequest {
                domain: Some(domain),
                delay_ms,
                selection: selection(albums),
            };
            let started = handle
                .start_batch(request)
                .await
                .map_err(|e| e.to_string())?;
            println!("Transferring {} albums", started.albums.len());

            spawn_operator_tasks(&handle);
            let summary = wait_for_run(started.handle).await?;
            print_summary(&summary);
        }

        Commands::Single {
            album_id,
            album_name,
            count,
            domain,
            delay_ms,
        } => {
            let album = AlbumRef {
                id: album_id,
                name: album_name,
            };
            let started = handle
                .start_single(album, count, Some(domain), delay_ms)
                .await
                .map_err(|e| e.to_string())?;

            spawn_operator_tasks(&handle);
            let log = wait_for_run(started.handle).await?;
            println!(
                "{}: {} uploaded, {} failed of {}",
                log.album_name, log.successful, log.failed, log.total_files
            );
            for failure in &log.failures {
                println!("  {}: {}", failure.filename, failure.error);
            }
        }

        Commands::Retry {
            domain,
            delay_ms,
            albums,
        } => {
            let request = RetryRequest {
                domain,
                delay_ms,
                albums: selection(albums),
            };
            let started = handle
                .retry_failed(request)
                .await
                .map_err(|e| e.to_string())?;
            let files: usize = started.groups.iter().map(|g| g.filenames.len()).sum();
            println!(
                "Retrying {} files across {} albums",
                files,
                started.groups.len()
            );

            spawn_operator_tasks(&handle);
            let summary = wait_for_run(started.handle).await?;
            print_summary(&summary);
        }

        Commands::Status => {
            let last_run = handle.last_run().await.map_err(|e| e.to_string())?;
            match last_run {
                Some(snapshot) => {
                    let json = serde_json::to_string_pretty(&snapshot)
                        .map_err(|e| format!("Failed to render last run: {}", e))?;
                    println!("{}", json);
                }
                None => println!("No previous run"),
            }

            let ledger = handle.ledger().await.map_err(|e| e.to_string())?;
            println!("{} failed files in the ledger", ledger.len());
        }

        Commands::ClearLastRun => {
            handle.clear_last_run().await.map_err(|e| e.to_string())?;
            println!("Last run cleared");
        }

        Commands::Albums => {
            let albums = handle.list_albums().await.map_err(|e| e.to_string())?;
            for album in albums {
                println!("{:>10}  {:>5} files  {}", album.id, album.file_count, album.name);
            }
        }

        Commands::Download {
            album_id,
            count,
            out,
        } => {
            let report = DownloadService::download_album(
                agent.as_ref(),
                fetcher.as_ref(),
                &album_id,
                count,
                &out,
                config.transfer.concurrency,
            )
            .await
            .map_err(|e| e.to_string())?;
            println!(
                "Saved {} files to {}, {} failed",
                report.saved.len(),
                out.display(),
                report.failures.len()
            );
            for failure in &report.failures {
                println!("  ! {}: {}", failure.filename, failure.error);
            }
        }
    }

    Ok(())
}

fn selection(albums: Vec<String>) -> Option<HashSet<String>> {
    if albums.is_empty() {
        None
    } else {
        Some(albums.into_iter().collect())
    }
}

async fn wait_for_run<T>(handle: JoinHandle<Result<T, BatchError>>) -> Result<T, String> {
    handle
        .await
        .map_err(|e| format!("Transfer task failed: {}", e))?
        .map_err(|e| e.to_string())
}

/// Log every state change, and read pause/resume/stop from stdin
fn spawn_operator_tasks(handle: &TransferHandle) {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            info!(
                "{} {}/{} ({}%) {:?}",
                state.album_name.as_deref().unwrap_or("-"),
                state.completed,
                state.total,
                state.percent(),
                state.status
            );
        }
    });

    let handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let result = match line.trim() {
                "pause" => handle.pause().await.map(|_| ()),
                "resume" => handle.resume().await.map(|_| ()),
                "stop" => handle.clear_active().await.map(|_| ()),
                "" => continue,
                other => {
                    warn!("Unknown command '{}' (pause, resume, stop)", other);
                    continue;
                }
            };
            if let Err(e) = result {
                warn!("Command failed: {}", e);
            }
        }
    });
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Run {}: {}/{} files uploaded, {} failed",
        summary.run_id, summary.successful, summary.total_files, summary.total_failed
    );
    for album in &summary.albums {
        println!(
            "  {}: {} uploaded, {} failed",
            album.album_name, album.successful, album.failed
        );
    }
    for failure in &summary.failures {
        println!(
            "  ! {} / {}: {}",
            failure.album_name, failure.filename, failure.error
        );
    }
}
