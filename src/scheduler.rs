use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::GenerationCache;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::monitor::snapshot::SnapshotStore;
use crate::monitor::{MonitorCollector, ResultCache};
use crate::provider::CloudApi;

/// Exporter orchestrates the HTTP server, result cache maintenance and the
/// periodic scrape loop.
pub struct Exporter<P> {
    cfg: Config,
    api: Arc<P>,
    health: Arc<HealthMetrics>,
    cache: Arc<ResultCache>,
    store: Arc<SnapshotStore>,
    collector: Option<MonitorCollector<P>>,
    cancel: CancellationToken,
}

impl<P: CloudApi> Exporter<P> {
    /// Creates a new Exporter, initializing health metrics.
    pub fn new(cfg: Config, api: Arc<P>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let cache = Arc::new(GenerationCache::new(cfg.cache.expiration));

        Ok(Self {
            cfg,
            api,
            health,
            cache,
            store: Arc::new(SnapshotStore::new()),
            collector: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start serving and scraping. Returns the HTTP server address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        // Serve health checks before the first scrape completes.
        let addr = self
            .health
            .start(Arc::clone(&self.store))
            .await
            .context("starting http server")?;

        self.cache
            .spawn_maintenance(self.cfg.cache.cleanup_interval, self.cancel.child_token());

        let collector = MonitorCollector::new(
            Arc::clone(&self.api),
            &self.cfg,
            Arc::clone(&self.cache),
            Arc::clone(&self.store),
            Some(Arc::clone(&self.health)),
        )
        .await
        .context("starting monitor collector")?;

        self.spawn_scrape_loop(collector.clone());
        self.collector = Some(collector);

        info!(
            addr = %addr,
            interval = ?self.cfg.scrape_interval,
            "exporter started",
        );

        Ok(addr)
    }

    /// Stop scheduling scrapes and shut down the HTTP server. Scrapes already
    /// running finish on their own.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.health.stop().await?;

        Ok(())
    }

    pub fn collector(&self) -> Option<&MonitorCollector<P>> {
        self.collector.as_ref()
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Spawn the scrape loop: one cycle immediately, then one per tick, each
    /// in its own task.
    fn spawn_scrape_loop(&self, collector: MonitorCollector<P>) {
        let cancel = self.cancel.clone();
        let interval = self.cfg.scrape_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("scrape loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let collector = collector.clone();
                        tokio::spawn(async move {
                            collector.scrape().await;
                        });
                    }
                }
            }
        });
    }
}
