//! Polling machinery.
//!
//! - `http` - conditional GET with a size cap
//! - `strategy` - next polling interval from post statistics
//! - `action` - processing hooks fired per outcome
//! - `task` - one polling cycle for one feed
//! - `scheduler` - the periodic dispatch pass
//!
//! [`FeedReader`] ties a timer to a [`SchedulerTask`].

mod action;
mod http;
mod scheduler;
mod strategy;
mod task;

pub use action::{FeedOutcome, LoggingAction, ProcessingAction, StoreItemsAction};
pub use http::{
    format_http_date, parse_http_date, HttpClient, HttpError, HttpResult, ReqwestHttpClient,
    MAX_RESPONSE_BYTES,
};
pub use scheduler::{MonitoringSettings, PassReport, SchedulerSettings, SchedulerTask};
pub use strategy::{
    update_check_interval, FixedIntervalStrategy, MovingAverageStrategy, UpdateStrategy,
};
pub use task::{FeedTask, TaskContext, DEFAULT_EXECUTION_WARN};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::storage::StoreError;

/// Runs scheduler passes on a fixed period until stopped.
pub struct FeedReader {
    ctx: Arc<TaskContext>,
    settings: SchedulerSettings,
    store_sync_interval: Option<Duration>,
}

impl FeedReader {
    pub fn new(ctx: TaskContext, settings: SchedulerSettings) -> Self {
        Self {
            ctx: Arc::new(ctx),
            settings,
            store_sync_interval: None,
        }
    }

    /// Re-read the store for added and removed feeds this often.
    pub fn with_store_sync(mut self, every: Duration) -> Self {
        self.store_sync_interval = Some(every).filter(|d| !d.is_zero());
        self
    }

    /// Load the feeds and start the dispatch timer. The first pass runs immediately.
    pub async fn start(self) -> Result<ReaderHandle, StoreError> {
        let feeds = self.ctx.store.list_feeds().await?;
        tracing::info!(
            feeds = feeds.len(),
            threads = self.settings.thread_count,
            wake_up_secs = self.settings.wake_up_interval.as_secs(),
            "Starting feed reader"
        );

        let store = Arc::clone(&self.ctx.store);
        let period = self.settings.wake_up_interval;
        let sync_every = self.store_sync_interval;
        let mut scheduler = SchedulerTask::new(feeds, self.ctx, self.settings);
        let (shutdown, mut stopped) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_sync = Instant::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sync_due = sync_every.is_some_and(|every| last_sync.elapsed() >= every);
                        if sync_due || scheduler.needs_resync() {
                            last_sync = Instant::now();
                            match store.list_feeds().await {
                                Ok(feeds) => {
                                    scheduler.synchronize(feeds);
                                }
                                Err(e) => tracing::warn!(error = %e, "Failed to synchronize with store"),
                            }
                        }
                        scheduler.run().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }

            let running = scheduler.running_count();
            if running > 0 {
                tracing::info!(running, "Waiting for running feed tasks");
            }
            scheduler.drain().await;
            tracing::info!("Feed reader stopped");
            scheduler
        });

        Ok(ReaderHandle { shutdown, join })
    }

    /// Read until `duration` elapses, or forever, stopping early on Ctrl-C or SIGTERM.
    pub async fn run_for(self, duration: Option<Duration>) -> anyhow::Result<()> {
        let handle = self.start().await?;
        match duration {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        tracing::info!(minutes = duration.as_secs() / 60, "Reading time elapsed");
                    }
                    _ = shutdown_signal() => {}
                }
            }
            None => shutdown_signal().await,
        }
        handle.stop().await?;
        Ok(())
    }
}

/// Controls a started [`FeedReader`].
pub struct ReaderHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<SchedulerTask>,
}

impl ReaderHandle {
    /// Stop the timer. Running feed tasks finish first; no new ones start.
    pub async fn stop(self) -> Result<SchedulerTask, JoinError> {
        // The receiver only goes away when the loop has already ended.
        let _ = self.shutdown.send(true);
        self.join.await
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, stopping"),
        _ = terminate => tracing::info!("Received SIGTERM, stopping"),
    }
}
