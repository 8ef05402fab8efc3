//! nsflame server: periodic flame graph collection plus the read API.
//!
//! Usage:
//!   nsflame-server --config /etc/nsflame/config.yaml
//!
//! Or a single collection cycle without the HTTP server:
//!   nsflame-server --config config.yaml --once

use clap::Parser;
use nsflame_lib::db::Database;
use nsflame_lib::http_server::{self, AppState};
use nsflame_lib::logging::init_logging;
use nsflame_lib::scheduler::Scheduler;
use nsflame_lib::settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "nsflame-server")]
#[command(version, about = "Metric namespace flame graph collector and query server", long_about = None)]
struct Cli {
    /// YAML settings file
    #[arg(long, short, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address, overrides `listen` from the settings file
    #[arg(long)]
    listen: Option<String>,

    /// Run one collection cycle and exit
    #[arg(long)]
    once: bool,
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            // Without a signal handler the server runs until killed.
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut settings = match Settings::load(&cli.config).and_then(|s| s.validate().map(|_| s)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Server] {}", e);
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        settings.listen = listen;
    }

    init_logging(&settings.log);
    info!(
        config = %cli.config.display(),
        clusters = settings.clusters.len(),
        row_store = settings.row_store.enabled,
        write_to_file = settings.write_to_file,
        "settings loaded"
    );

    let db = if settings.row_store.enabled {
        match Database::new(&settings.row_store.path) {
            Ok(db) => {
                info!(path = %db.get_path(), "row store opened");
                Some(Arc::new(db))
            }
            Err(e) => {
                error!(path = %settings.row_store.path.display(), error = %e, "failed to open row store");
                std::process::exit(1);
            }
        }
    } else {
        warn!("row store disabled, read endpoints will answer 503");
        None
    };

    let settings = Arc::new(settings);
    let scheduler = match Scheduler::from_settings(settings.clone(), db.clone()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    if cli.once {
        let report = scheduler.run_cycle().await;
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "single cycle finished"
        );
        if !report.failed.is_empty() {
            std::process::exit(1);
        }
        return;
    }

    let listener = match tokio::net::TcpListener::bind(&settings.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(listen = %settings.listen, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let collection = tokio::spawn(async move { scheduler.run_forever().await });

    let app = http_server::router(AppState::new(db, settings.remove_lowest_fraction()));
    info!(listen = %settings.listen, "listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    collection.abort();
    if let Err(e) = served {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("stopped");
}
