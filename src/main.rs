//! # Repo Sync Entry Point
//!
//! Wires the store, the syncer, the update scheduler and the HTTP surface
//! together and runs them until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use reposync::{
    clock::{Clock, SystemClock},
    config::ConfigLoader,
    db,
    gitserver::GitserverClient,
    scheduler::{
        ScheduleBackfill, SchedulerSettings, UpdateScheduler,
        backfill::DEFAULT_BACKFILL_INTERVAL,
    },
    server::{self, AppState},
    sources::DefaultSourcer,
    store::Store,
    syncer::{Diff, Syncer},
    telemetry,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Buffered sync diffs waiting for the scheduler.
const SYNCED_BUFFER: usize = 256;

#[derive(Parser)]
#[command(name = "reposync")]
#[command(about = "Keeps repos in sync with their code hosts and schedules their fetches")]
struct Cli {
    /// Directory holding the `.env*` files (defaults to the working directory)
    #[arg(long)]
    env_dir: Option<PathBuf>,

    /// Do not apply pending database migrations on start
    #[arg(long)]
    skip_migrations: bool,
}

impl Cli {
    fn loader(&self) -> ConfigLoader {
        match &self.env_dir {
            Some(dir) => ConfigLoader::with_base_dir(dir.clone()),
            None => ConfigLoader::new(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loader = cli.loader();
    let config = loader.load().context("loading configuration")?;

    telemetry::init_tracing(&config).context("initializing tracing")?;
    info!(
        profile = %config.profile,
        config = %config.redacted_json().unwrap_or_default(),
        "Loaded configuration"
    );

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    if !cli.skip_migrations {
        db::migrate(&db).await?;
    }

    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Store::with_clock(db.clone(), clock.clone());

    let settings =
        SchedulerSettings::from_config(&config.scheduler).context("compiling interval rules")?;
    let (settings_tx, settings_rx) = watch::channel(settings);
    let gitserver = GitserverClient::new(
        &config.scheduler.gitserver_url,
        Duration::from_secs(config.scheduler.gitserver_timeout_seconds),
    )
    .context("building git server client")?;
    let scheduler = UpdateScheduler::new(Arc::new(gitserver), clock.clone(), settings_rx);

    let (synced_tx, synced_rx) = mpsc::channel(SYNCED_BUFFER);
    let syncer = Arc::new(
        Syncer::new(store.clone(), Arc::new(DefaultSourcer), config.syncer.clone())
            .with_clock(clock)
            .with_synced(synced_tx)
            .with_shutdown(shutdown.clone()),
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(Arc::clone(&scheduler).run(shutdown.clone()));
    tasks.spawn(Arc::clone(&syncer).run(shutdown.clone()));
    tasks.spawn(forward_diffs(
        synced_rx,
        Arc::clone(&scheduler),
        shutdown.clone(),
    ));
    tasks.spawn(
        ScheduleBackfill::new(store.clone(), Arc::clone(&scheduler))
            .run(DEFAULT_BACKFILL_INTERVAL, shutdown.clone()),
    );
    tasks.spawn(reload_on_hangup(loader, settings_tx, shutdown.clone()));
    tasks.spawn(cancel_on_signal(shutdown.clone()));

    let state = AppState {
        config: Arc::new(config),
        db,
        store,
        syncer,
        scheduler,
    };
    let served = server::run_server(state, shutdown.clone()).await;
    if let Err(e) = &served {
        error!(error = %e, "Server stopped with an error");
    }

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    info!("Shutdown complete");
    served
}

/// Feeds committed sync diffs into the scheduler.
async fn forward_diffs(
    mut synced: mpsc::Receiver<Diff>,
    scheduler: Arc<UpdateScheduler>,
    shutdown: CancellationToken,
) {
    loop {
        let diff = tokio::select! {
            _ = shutdown.cancelled() => return,
            diff = synced.recv() => diff,
        };
        match diff {
            Some(diff) => scheduler.update_from_diff(&diff),
            None => return,
        }
    }
}

/// Reloads the configuration on SIGHUP and publishes the new scheduler
/// settings.
async fn reload_on_hangup(
    loader: ConfigLoader,
    settings: watch::Sender<SchedulerSettings>,
    shutdown: CancellationToken,
) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGHUP; configuration reload disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = hangup.recv() => {}
            }
            let reloaded = loader
                .load()
                .map_err(anyhow::Error::from)
                .and_then(|config| {
                    SchedulerSettings::from_config(&config.scheduler).map_err(anyhow::Error::from)
                });
            match reloaded {
                Ok(next) => {
                    info!(
                        max_concurrent_updates = next.max_concurrent_updates,
                        "Reloaded scheduler settings"
                    );
                    settings.send_replace(next);
                }
                Err(e) => warn!(error = %e, "Ignoring invalid configuration on reload"),
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (loader, settings);
        shutdown.cancelled().await;
    }
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = ctrl_c => {
            info!("Received Ctrl-C, shutting down");
            shutdown.cancel();
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
            shutdown.cancel();
        }
    }
}
