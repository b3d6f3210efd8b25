use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::PingSettings;
use crate::error::Error;
use crate::health::HealthTracker;
use crate::http_client::{FetchRequest, HttpClientPool};
use crate::registry::GatewayRegistry;
use crate::temperature::TemperatureTracker;

/// Background prober that keeps the temperature tracker warm for gateways
/// the router has not routed to recently. Best-effort: a failed round logs
/// and waits for the next interval.
pub struct PingService {
    pool: Arc<HttpClientPool>,
    registry: Arc<dyn GatewayRegistry>,
    health: Arc<HealthTracker>,
    temperature: Arc<TemperatureTracker>,
    settings: PingSettings,
    round_in_progress: AtomicBool,
}

impl PingService {
    pub fn new(
        pool: Arc<HttpClientPool>,
        registry: Arc<dyn GatewayRegistry>,
        health: Arc<HealthTracker>,
        temperature: Arc<TemperatureTracker>,
        settings: PingSettings,
    ) -> Self {
        Self {
            pool,
            registry,
            health,
            temperature,
            settings,
            round_in_progress: AtomicBool::new(false),
        }
    }

    /// Run an initial round, then repeat every `interval_hours` until the
    /// token fires. The timer never keeps the process alive past shutdown.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let interval = Duration::from_secs(self.settings.interval_hours * 3600);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    result = self.run_round() => {
                        if let Err(e) = result {
                            tracing::warn!("ping round failed: {e}");
                        }
                    }
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!("ping service stopped");
        })
    }

    /// One probing round: sample gateways uniformly, probe them in bounded
    /// batches, and feed both trackers.
    pub async fn run_round(&self) -> Result<(), Error> {
        if self
            .round_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("ping round already in progress, skipping");
            return Ok(());
        }
        let result = self.probe_sample().await;
        self.round_in_progress.store(false, Ordering::Release);
        result
    }

    async fn probe_sample(&self) -> Result<(), Error> {
        let mut gateways = self.registry.routing_gateways().await?;
        let sample_size = self.settings.gateway_count.min(gateways.len());
        if sample_size == 0 {
            return Ok(());
        }
        // Fisher–Yates prefix: uniform sample without shuffling the tail.
        let (sample, _) = gateways.partial_shuffle(&mut rand::thread_rng(), sample_size);
        let sample: Vec<Url> = sample.to_vec();

        let results: Vec<(Url, Result<u32, Error>)> = stream::iter(sample)
            .map(|gateway| async move {
                let outcome = self.probe(&gateway).await;
                (gateway, outcome)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut reachable = 0usize;
        for (gateway, outcome) in results {
            match outcome {
                Ok(latency_ms) => {
                    reachable += 1;
                    self.temperature.record_ping(&gateway, latency_ms);
                    self.health.mark_healthy(&gateway);
                }
                Err(e) => {
                    tracing::debug!(gateway = %gateway, "ping failed: {e}");
                    self.health.record_failure(&gateway);
                    self.temperature.record_failure(&gateway);
                }
            }
        }
        tracing::info!(reachable, "ping round complete");
        Ok(())
    }

    async fn probe(&self, gateway: &Url) -> Result<u32, Error> {
        let url = gateway
            .join("ar-io/info")
            .map_err(|e| Error::Internal {
                message: format!("bad probe URL for {gateway}: {e}"),
            })?;
        let started = Instant::now();
        let response = self
            .pool
            .fetch(FetchRequest::get(
                url,
                Duration::from_millis(self.settings.timeout_ms),
            ))
            .await?;
        let latency_ms = started.elapsed().as_millis() as u32;
        if response.status().is_success() {
            Ok(latency_ms)
        } else {
            Err(Error::GatewayRequest {
                message: format!("probe of {gateway} returned {}", response.status()),
                status_code: Some(response.status()),
            })
        }
    }
}
