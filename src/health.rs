//! Concurrent backend health probing.
//!
//! One probe per backend service, all in flight at once, each bounded by its
//! own timeout. A report is ready once every probe has settled, so the
//! aggregation never takes longer than the slowest single timeout.

use crate::cache::ResponseCache;
use crate::cache::CachedResponse;
use crate::config::HealthConfig;
use crate::routes::ServiceTarget;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const SERVICES_PATH: &str = "/health/services";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_checked: DateTime<Utc>,
}

impl HealthRecord {
    fn healthy(elapsed: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time: Some(format!("{}ms", elapsed.as_millis())),
            error: None,
            last_checked: Utc::now(),
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time: None,
            error: Some(error),
            last_checked: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub timestamp: DateTime<Utc>,
    pub services: BTreeMap<String, HealthRecord>,
}

impl HealthReport {
    pub fn from_records(services: BTreeMap<String, HealthRecord>) -> Self {
        let status = if services.values().all(HealthRecord::is_healthy) {
            OverallStatus::Healthy
        } else {
            OverallStatus::Degraded
        };
        Self {
            status,
            timestamp: Utc::now(),
            services,
        }
    }
}

pub struct HealthAggregator {
    client: reqwest::Client,
    services: Vec<Arc<ServiceTarget>>,
    probe_timeout: Duration,
    cache: Option<Arc<ResponseCache>>,
}

impl HealthAggregator {
    pub fn new(
        services: Vec<Arc<ServiceTarget>>,
        config: &HealthConfig,
        cache: Option<Arc<ResponseCache>>,
    ) -> anyhow::Result<Self> {
        let probe_timeout = Duration::from_millis(config.probe_timeout_ms);
        let client = reqwest::Client::builder()
            .connect_timeout(probe_timeout)
            .timeout(probe_timeout)
            .build()?;

        Ok(Self {
            client,
            services,
            probe_timeout,
            cache: cache.filter(|_| config.cache_reports),
        })
    }

    async fn probe(&self, service: &ServiceTarget) -> HealthRecord {
        let url = service.health_url();
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, self.client.get(&url).send()).await;
        let elapsed = started.elapsed();
        histogram!("gateway.health.probe_ms", elapsed.as_millis() as f64, "service" => service.name.clone());

        let record = match outcome {
            Ok(Ok(resp)) if resp.status().is_success() => HealthRecord::healthy(elapsed),
            Ok(Ok(resp)) => HealthRecord::unhealthy(format!("Health check returned {}", resp.status())),
            Ok(Err(e)) if e.is_timeout() => HealthRecord::unhealthy(self.timeout_message()),
            Ok(Err(e)) if e.is_connect() => {
                HealthRecord::unhealthy(format!("Connection failed: {}", e))
            }
            Ok(Err(e)) => HealthRecord::unhealthy(e.to_string()),
            Err(_) => HealthRecord::unhealthy(self.timeout_message()),
        };

        if !record.is_healthy() {
            counter!("gateway.health.unhealthy", 1, "service" => service.name.clone());
            tracing::warn!(service = %service.name, url = %url, error = ?record.error, "Health probe failed");
        }
        record
    }

    fn timeout_message(&self) -> String {
        format!("Timed out after {}ms", self.probe_timeout.as_millis())
    }

    /// Probe every service now, bypassing the cache.
    pub async fn aggregate(&self) -> HealthReport {
        let records = join_all(self.services.iter().map(|service| async move {
            (service.name.clone(), self.probe(service).await)
        }))
        .await;
        HealthReport::from_records(records.into_iter().collect())
    }

    /// The latest report, served from the health namespace when fresh.
    /// The flag is true when the report came from the cache.
    pub async fn report(&self) -> (HealthReport, bool) {
        if let Some(cache) = &self.cache {
            let plan = cache.health_plan(SERVICES_PATH);
            if let Some(entry) = cache.lookup(&plan).await {
                match serde_json::from_str::<HealthReport>(&entry.body) {
                    Ok(report) => return (report, true),
                    Err(e) => tracing::warn!(error = %e, "Ignoring unreadable cached health report"),
                }
            }
        }
        (self.refresh().await, false)
    }

    /// Aggregate and store the result in the health namespace.
    pub async fn refresh(&self) -> HealthReport {
        let report = self.aggregate().await;
        if let Some(cache) = &self.cache {
            match serde_json::to_string(&report) {
                Ok(body) => {
                    let entry = CachedResponse {
                        status: 200,
                        content_type: Some("application/json".to_string()),
                        body,
                    };
                    cache.store(&cache.health_plan(SERVICES_PATH), &entry).await;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize health report"),
            }
        }
        report
    }

    /// Re-aggregate on an interval until shutdown is signalled.
    pub fn spawn_refresh(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.refresh().await;
                        tracing::debug!(status = ?report.status, "Refreshed health report");
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Health refresh stopped");
                        break;
                    }
                }
            }
        })
    }
}
