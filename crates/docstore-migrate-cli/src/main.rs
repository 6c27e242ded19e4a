//! docstore-migrate CLI - batched migrations over hierarchical document stores.

use clap::{Parser, Subcommand};
use docstore_migrate::{
    CollectionPath, Config, DeclarativePlanner, DeleteReport, DeleteSink, DocumentPath,
    MemoryStore, MigrateError, MigrationResult, Orchestrator, RecursiveDeleter, RunStatus,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "docstore-migrate")]
#[command(about = "Batched migrations over hierarchical document stores")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for in-flight batches after SIGINT/SIGTERM
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured migration
    Run {
        /// Plan and count without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Override the number of parallel workers for fan-out runs
        #[arg(long)]
        workers: Option<usize>,

        /// Override the collection to scan
        #[arg(long)]
        collection: Option<String>,
    },

    /// Resume a previous run from its state file
    Resume {
        /// Override the number of parallel workers for fan-out runs
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Delete a document and everything below it
    DeleteTree {
        /// Document path, e.g. users/u1
        path: String,

        /// Count what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete several documents (and their subtrees), including ghost documents
    DeleteDocs {
        /// Document paths
        #[arg(required = true)]
        paths: Vec<String>,

        /// Count what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate the configuration and print the plan
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, MigrateError> {
    setup_logging(&cli.verbosity, &cli.log_format).map_err(MigrateError::Config)?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();

    if let Commands::Validate = cli.command {
        let planner = DeclarativePlanner::new(config.plan.clone())?;
        let plan = planner.plan_definition();
        if cli.output_json {
            println!("{}", serde_json::to_string_pretty(plan)?);
        } else {
            println!("Configuration is valid");
            println!("  Migration: {}", plan.name);
            println!("  Collection: {}", plan.collection);
            if let Some(sub) = &plan.fan_out_subcollection {
                println!("  Fan-out subcollection: {}", sub);
            }
            println!("  Ops: {}", plan.ops.len());
            println!("  Max batch size: {}", config.migration.get_max_batch_size());
            println!("  Workers: {}", config.migration.get_workers());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
    let store = Arc::new(MemoryStore::load_json(
        &config.store.path,
        config.store.hard_cap,
    )?);

    match cli.command {
        Commands::Run {
            dry_run,
            workers,
            collection,
        } => {
            if let Some(collection) = collection {
                config.plan.collection = CollectionPath::parse(&collection)?;
            }
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            config.migration.dry_run |= dry_run;
            let dry_run = config.migration.dry_run;
            let snapshot = config.store.path.clone();

            let mut orchestrator = Orchestrator::new(config, store.clone())?;
            if let Some(state_file) = cli.state_file {
                orchestrator = orchestrator.with_state_file(state_file);
            }

            let result = orchestrator.run(cancel_token).await?;
            if !dry_run {
                store.save_json(&snapshot).await?;
            }
            Ok(report(&result, cli.output_json)?)
        }

        Commands::Resume { workers } => {
            let state_file = cli.state_file.ok_or_else(|| {
                MigrateError::Config("--state-file is required for resume".to_string())
            })?;
            if !state_file.exists() {
                return Err(MigrateError::Config(format!(
                    "State file not found: {:?}",
                    state_file
                )));
            }

            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            // Resume always writes.
            config.migration.dry_run = false;
            let snapshot = config.store.path.clone();

            let orchestrator = Orchestrator::new(config, store.clone())?
                .with_state_file(state_file)
                .resume()?;
            info!("Resuming from previous state");

            let result = orchestrator.run(cancel_token).await?;
            store.save_json(&snapshot).await?;
            Ok(report(&result, cli.output_json)?)
        }

        Commands::DeleteTree { path, dry_run } => {
            let root = DocumentPath::parse(&path)?;
            delete(&config, store, &[root], dry_run, cancel_token, cli.output_json).await
        }

        Commands::DeleteDocs { paths, dry_run } => {
            let roots = paths
                .iter()
                .map(|p| DocumentPath::parse(p))
                .collect::<Result<Vec<_>, _>>()?;
            delete(&config, store, &roots, dry_run, cancel_token, cli.output_json).await
        }

        Commands::Validate => Ok(ExitCode::SUCCESS),
    }
}

async fn delete(
    config: &Config,
    store: Arc<MemoryStore>,
    roots: &[DocumentPath],
    dry_run: bool,
    cancel_token: CancellationToken,
    output_json: bool,
) -> Result<ExitCode, MigrateError> {
    let deleter = RecursiveDeleter::new(store.clone())
        .with_page_size(config.migration.get_delete_page_size())
        .with_retry(config.migration.retry_policy());
    let sink = if dry_run {
        DeleteSink::Preview
    } else {
        DeleteSink::Direct
    };

    let report: DeleteReport = deleter.delete_documents(roots, sink, &cancel_token).await?;
    if !dry_run {
        store.save_json(&config.store.path).await?;
    }

    if output_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} {} documents in {} subcollections{}",
            if dry_run { "Would delete" } else { "Deleted" },
            report.documents_deleted,
            report.collections_visited,
            if report.cancelled { " (cancelled)" } else { "" }
        );
    }

    Ok(if report.cancelled {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    })
}

fn report(result: &MigrationResult, output_json: bool) -> Result<ExitCode, MigrateError> {
    if output_json {
        println!("{}", result.to_json()?);
    } else {
        println!("\n{}", result.summary_line());
        println!("  Run ID: {}", result.run_id);
        println!(
            "  Documents deleted: {}, ops committed: {}",
            result.documents_deleted, result.ops_committed
        );
        for detail in result.error_details.iter().take(20) {
            println!("  Error at {}: {}", detail.path, detail.message);
        }
        if let Some(err) = &result.fatal_error {
            println!("  Stopped by: {}", err);
        }
    }

    if result.is_success() {
        return Ok(ExitCode::SUCCESS);
    }
    Ok(match result.status {
        RunStatus::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    // Logs go to stderr so --output-json stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM.
///
/// Running jobs stop between documents and flush their pending batch, so a
/// cancelled run can be resumed from its state file.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
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
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();

        tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
        eprintln!("Shutdown timeout elapsed, exiting");
        std::process::exit(130);
    });

    Ok(cancel_token)
}

#[cfg(not(unix))]
async fn setup_signal_handler(_shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
