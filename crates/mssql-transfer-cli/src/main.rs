//! mssql-transfer CLI - chunked table transfer between SQL Server databases.

use clap::{Parser, Subcommand};
use mssql_transfer::{
    build_select, ConnectionFactory, FileStatusStore, JobStatus, JobStatusRecord, MssqlConnector,
    ProbeResult, ServiceSettings, StatusStore, StatusView, TransferError, TransferRequest,
    TransferService,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-transfer")]
#[command(about = "Chunked table-to-table transfer between SQL Server databases")]
#[command(version)]
struct Cli {
    /// Path to YAML (or JSON) transfer request
    #[arg(short, long, default_value = "transfer.yaml")]
    config: PathBuf,

    /// Directory holding job status files
    #[arg(long, default_value = ".transfer-status")]
    status_dir: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a transfer job to completion
    Run {
        /// Override rows per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Override number of concurrent table workers
        #[arg(long)]
        workers: Option<usize>,

        /// Record failed chunks and tables as warnings and keep going
        #[arg(long)]
        skip_errors: bool,
    },

    /// Submit a transfer job, print its receipt, then wait for it
    Submit,

    /// Show the status of a job
    Status {
        /// Job id printed on submission
        job_id: String,
    },

    /// Test source and target connections
    Probe,

    /// Validate the request offline and print the transfer plan
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), TransferError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| TransferError::Config(e.to_string()))?;

    // Status lookups only need the store, not a request file.
    if let Commands::Status { ref job_id } = cli.command {
        return show_status(&cli, job_id).await;
    }

    let mut request = TransferRequest::load(&cli.config)?;
    info!("Loaded transfer request from {:?}", cli.config);

    match cli.command {
        Commands::Status { .. } => unreachable!(), // Handled above
        Commands::Validate => {
            print_plan(&request, cli.output_json)?;
            Ok(())
        }
        Commands::Probe => probe(&request, cli.output_json).await,
        Commands::Run {
            chunk_size,
            workers,
            skip_errors,
        } => {
            // Apply overrides
            if let Some(size) = chunk_size {
                request.chunk_size = size;
            }
            if let Some(w) = workers {
                request.max_workers = w;
            }
            if skip_errors {
                request.skip_errors = true;
            }
            request.validate()?;

            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
            let service = build_service(&cli).await?;
            let record = with_shutdown_timeout(
                service.run(request, cancel_token.clone()),
                &cancel_token,
                cli.shutdown_timeout,
            )
            .await?;
            finish(&record, cli.output_json)
        }
        Commands::Submit => {
            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
            let service = Arc::new(build_service(&cli).await?);
            let receipt = service.submit(request).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&receipt)?);
            } else {
                println!("Job submitted");
                println!("  Job ID: {}", receipt.job_id);
                println!("  Status: {}", receipt.status);
                println!("  Status URL: {}", receipt.status_url);
                println!(
                    "  Tables ({}): {}",
                    receipt.details.tables_count,
                    receipt.details.tables.join(", ")
                );
                println!("  Chunk size: {}", receipt.details.chunk_size);
            }

            // Forward a shutdown signal to the queued job.
            let job_id = receipt.job_id.clone();
            let watcher = cancel_token.clone();
            let cancel_service = service.clone();
            tokio::spawn(async move {
                watcher.cancelled().await;
                if let Err(e) = cancel_service.cancel(&job_id) {
                    warn!("Failed to cancel job {}: {}", job_id, e);
                }
            });

            let record = with_shutdown_timeout(
                service.wait(&receipt.job_id),
                &cancel_token,
                cli.shutdown_timeout,
            )
            .await?;
            finish(&record, cli.output_json)
        }
    }
}

async fn build_service(cli: &Cli) -> Result<TransferService, TransferError> {
    let store = Arc::new(FileStatusStore::new(&cli.status_dir));
    store.init().await?;

    let mut settings = ServiceSettings::default();
    if cli.progress {
        let (tx, mut rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{}", line);
                }
            }
        });
        settings.progress = Some(tx);
    }

    Ok(TransferService::new(
        Arc::new(MssqlConnector),
        store,
        settings,
    ))
}

/// Wait for `job`, but give up `timeout_secs` after a shutdown signal.
async fn with_shutdown_timeout<F>(
    job: F,
    cancel_token: &CancellationToken,
    timeout_secs: u64,
) -> Result<JobStatusRecord, TransferError>
where
    F: std::future::Future<Output = Result<JobStatusRecord, TransferError>>,
{
    tokio::select! {
        result = job => result,
        _ = async {
            cancel_token.cancelled().await;
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        } => {
            eprintln!("Shutdown timeout of {}s exceeded, exiting", timeout_secs);
            Err(TransferError::Cancelled)
        }
    }
}

/// Print the terminal record and map it to the process outcome.
fn finish(record: &JobStatusRecord, output_json: bool) -> Result<(), TransferError> {
    let stats = &record.stats;
    if output_json {
        println!("{}", serde_json::to_string_pretty(record)?);
    } else {
        let status_msg = match record.status {
            JobStatus::Success => "Transfer completed!",
            _ => "Transfer failed!",
        };
        println!("\n{}", status_msg);
        println!("  Job ID: {}", record.job_id);
        println!("  Status: {}", record.status);
        if let Some(duration) = stats.duration_seconds() {
            println!("  Duration: {:.2}s", duration);
        }
        println!(
            "  Tables: {}/{}",
            stats.completed_tables, stats.total_tables
        );
        println!("  Rows: {}/{}", stats.transferred_rows, stats.total_rows);
        if !stats.warnings.is_empty() {
            println!("  Warnings: {}", stats.warnings.len());
            for warning in &stats.warnings {
                println!(
                    "    {} chunk {}: {}",
                    warning.table, warning.chunk, warning.error.message
                );
            }
        }
        let failed = stats.failed_tables();
        if !failed.is_empty() {
            println!("  Failed tables: {:?}", failed);
        }
        if let Some(ref error) = record.error {
            println!("  Error: {}", error);
        }
    }

    match record.status {
        JobStatus::Success => Ok(()),
        _ if stats.cancelled => Err(TransferError::Cancelled),
        _ => Err(TransferError::Job(
            record
                .error
                .clone()
                .unwrap_or_else(|| "transfer failed".to_string()),
        )),
    }
}

async fn show_status(cli: &Cli, job_id: &str) -> Result<(), TransferError> {
    let store = FileStatusStore::new(&cli.status_dir);
    let record = store
        .load(job_id)
        .await?
        .ok_or_else(|| TransferError::JobNotFound(job_id.to_string()))?;
    let view = StatusView::from(&record);

    if cli.output_json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Job {}", view.job_id);
    println!("  Status: {}", view.status);
    println!("  Progress: {:.2}%", view.progress);
    for (table, detail) in &view.table_status {
        println!(
            "  {}: {:?} {}/{} rows ({} errored)",
            table, detail.status, detail.transferred, detail.total_rows, detail.errors
        );
    }
    if let Some(duration) = view.duration_seconds {
        println!("  Duration: {:.2}s", duration);
    }
    if !view.warnings.is_empty() {
        println!("  Warnings: {}", view.warnings.len());
    }
    if let Some(ref error) = view.error {
        println!("  Error: {}", error);
    }
    Ok(())
}

async fn probe(request: &TransferRequest, output_json: bool) -> Result<(), TransferError> {
    let source = ConnectionFactory::probe(&request.source).await;
    let target = ConnectionFactory::probe(&request.target).await;

    if output_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "source": source,
                "target": target,
            }))?
        );
    } else {
        println!("Probe Results:");
        print_probe("Source", &source);
        print_probe("Target", &target);
    }

    source.into_result()?;
    target.into_result()?;
    Ok(())
}

fn print_probe(label: &str, result: &ProbeResult) {
    println!(
        "  {} ({}/{}): {}",
        label,
        result.server,
        result.database,
        if result.success { "OK" } else { "FAILED" }
    );
    if let Some(ref diagnosis) = result.diagnosis {
        println!("    Error: {}", result.message);
        if let Some(ref explanation) = diagnosis.explanation {
            println!("    {}", explanation);
        }
        for suggestion in &diagnosis.suggestions {
            println!("    - {}", suggestion);
        }
    }
}

fn print_plan(request: &TransferRequest, output_json: bool) -> Result<(), TransferError> {
    let mut plan = Vec::with_capacity(request.tables.len());
    for spec in &request.tables {
        plan.push((spec, build_select(spec)?));
    }

    if output_json {
        let tables: Vec<_> = plan
            .iter()
            .map(|(spec, select)| {
                serde_json::json!({
                    "source_table": spec.source_table,
                    "target_table": spec.target_name(),
                    "write_mode": spec.write_mode.as_str(),
                    "select": select,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "valid": true,
                "chunk_size": request.chunk_size,
                "max_workers": request.max_workers,
                "skip_errors": request.skip_errors,
                "tables": tables,
            }))?
        );
    } else {
        println!("Request is valid");
        println!(
            "  Chunk size: {}, workers: {}, skip errors: {}",
            request.chunk_size, request.max_workers, request.skip_errors
        );
        for (spec, select) in &plan {
            println!(
                "  {} -> {} ({})",
                spec.source_table,
                spec.target_name(),
                spec.write_mode.as_str()
            );
            println!("    {}", select);
        }
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("Unknown verbosity: {}", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("Unknown log format: {}", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, TransferError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Stopping at the next chunk boundary (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, TransferError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\nReceived Ctrl-C. Stopping at the next chunk boundary (timeout: {}s)...",
                shutdown_timeout
            );
            token.cancel();
        }
    });

    Ok(cancel_token)
}
