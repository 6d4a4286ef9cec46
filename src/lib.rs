// src/lib.rs
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod proxy;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod store;

const STORE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The gateway process: shared state plus the background tasks around it.
pub struct Gateway {
    state: Arc<server::GatewayState>,
    shutdown: broadcast::Sender<()>,
}

impl Gateway {
    pub fn new(config: config::GatewayConfig) -> Result<Self> {
        let state = server::GatewayState::from_config(config)?;
        Ok(Self::with_state(state))
    }

    /// Load configuration (file, then environment) and build the gateway.
    pub fn from_file(config_path: Option<&str>) -> Result<Self> {
        let config = config::GatewayConfig::load(config_path)?;
        Self::new(config)
    }

    pub fn with_state(state: server::GatewayState) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        Self {
            state: Arc::new(state),
            shutdown,
        }
    }

    pub fn state(&self) -> Arc<server::GatewayState> {
        self.state.clone()
    }

    /// Bind the configured address and serve until ctrl-c.
    pub async fn start(&self) -> Result<()> {
        metrics::init_metrics(&self.state.config.metrics)?;

        let addr = &self.state.config.listen_addr;
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("Failed to bind {}", addr))?;

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received ctrl-c, shutting down");
                let _ = shutdown.send(());
            }
        });

        self.serve(listener).await
    }

    /// Serve on `listener` until [`Gateway::shutdown`] is called.
    pub async fn serve(&self, listener: std::net::TcpListener) -> Result<()> {
        let mut tasks = Vec::new();

        if let Some(secs) = self.state.config.health.refresh_interval_secs {
            tasks.push(
                self.state
                    .health
                    .clone()
                    .spawn_refresh(Duration::from_secs(secs.max(1)), self.shutdown.subscribe()),
            );
        }

        let store = self.state.store.clone();
        let mut stop_sweep = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STORE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = store.sweep();
                        if purged > 0 {
                            tracing::debug!(purged, "Swept expired store entries");
                        }
                    }
                    _ = stop_sweep.recv() => break,
                }
            }
        }));

        let mut stop_server = self.shutdown.subscribe();
        let result = server::serve(self.state.clone(), listener, async move {
            let _ = stop_server.recv().await;
        })
        .await;

        for task in tasks {
            task.abort();
        }
        result
    }

    pub fn shutdown(&self) {
        if self.shutdown.send(()).is_err() {
            tracing::warn!("Gateway was not running");
        }
    }
}

// Re-export types for easier usage
pub use config::GatewayConfig;
pub use error::GatewayError;
