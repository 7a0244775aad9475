use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use archiver::{
    EnforcerOptions, MeasureStore, ObjectStoreBackend, WriterOptions, delete_archived, schedule,
    write_archives,
};
use common::config::Configuration;
use common::model::MeasureKind;
use common::storage::build_object_store;

#[derive(Parser, Debug)]
#[command(
    name = "coldstore",
    about = "Archives measurement tables to object storage in verified blocks"
)]
struct Args {
    #[arg(long, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    quiet: bool,

    #[arg(long, help = "Run a single archival pass and exit")]
    once: bool,
}

fn init_logging(args: &Args) {
    let level = if args.quiet {
        "warn"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };

    if std::env::var("RUST_LOG").is_err() {
        // SAFETY: runs before any worker thread is spawned
        unsafe {
            std::env::set_var("RUST_LOG", level);
        }
    }
    tracing_subscriber::fmt::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {}", path.display());
            Configuration::load_from_path(path)
        }
        None => Configuration::load(),
    }
    .context("Failed to load configuration")?;

    let store = MeasureStore::connect(&config.database.dsn)
        .await
        .context("connect measurement database")?;
    let object_store =
        build_object_store(&config.storage.dsn).context("create archive object store")?;
    let backend = ObjectStoreBackend::new(object_store);

    let writer_opts = WriterOptions {
        prefix: config.storage.prefix.clone(),
        staging_dir: PathBuf::from(&config.archival.staging_dir),
        cleanup_local: config.archival.cleanup_local,
    };
    let enforcer_opts = EnforcerOptions {
        retention: config.archival.retention,
        delete_chunk_size: config.archival.delete_chunk_size,
    };

    info!(
        database = %config.database.dsn,
        storage = %config.storage.dsn,
        prefix = %config.storage.prefix,
        batch_size = config.archival.batch_size,
        "coldstore started"
    );

    let mut interval = tokio::time::interval(config.archival.run_interval);
    // The first tick fires immediately
    interval.tick().await;

    loop {
        run_pass(&store, &backend, &config, &writer_opts, &enforcer_opts).await;

        if args.once {
            break;
        }

        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

/// One archival pass over every measurement kind. A failing stage for
/// one kind is logged and never aborts the other kinds.
async fn run_pass(
    store: &MeasureStore,
    backend: &ObjectStoreBackend,
    config: &Configuration,
    writer_opts: &WriterOptions,
    enforcer_opts: &EnforcerOptions,
) {
    for kind in MeasureKind::ALL {
        if let Err(e) = run_kind(store, backend, config, writer_opts, enforcer_opts, kind).await {
            warn!(kind = %kind, error = %e, "archival pass failed");
        }
    }
}

async fn run_kind(
    store: &MeasureStore,
    backend: &ObjectStoreBackend,
    config: &Configuration,
    writer_opts: &WriterOptions,
    enforcer_opts: &EnforcerOptions,
    kind: MeasureKind,
) -> Result<()> {
    let scheduled = schedule(store, kind, config.archival.batch_size)
        .await
        .context("schedule blocks")?;
    let written = write_archives(store, backend, writer_opts, kind)
        .await
        .context("write archives")?;
    let run = delete_archived(store, backend, enforcer_opts, kind)
        .await
        .context("delete archived records")?;

    info!(
        kind = %kind,
        scheduled = scheduled.len(),
        archived = written.len(),
        finalized = run.blocks_finalized,
        deleted = run.records_deleted,
        deferred = run.blocks_deferred,
        "archival pass complete"
    );

    Ok(())
}
