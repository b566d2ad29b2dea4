use crate::coordinator::{Coordinator, CycleOutcome};
use crate::core::settings::{PollingSettings, ServerConfig};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to build HTTP client for {server}: {source}")]
    Client {
        server: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server {server} not ready: {reason}")]
    NotReady { server: String, reason: String },
}

impl SetupError {
    /// Not-ready servers may come up later; client construction errors will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SetupError::NotReady { .. })
    }
}

/// A running coordinator for one configured server, plus the handle to stop it.
pub struct ServerInstance {
    config: ServerConfig,
    polling: PollingSettings,
    coordinator: Arc<Coordinator>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerInstance {
    /// Connects, runs the first cycle, and starts polling only if that cycle succeeded.
    pub async fn start(config: ServerConfig, polling: PollingSettings) -> Result<Self, SetupError> {
        let coordinator = Arc::new(Coordinator::connect(&config, &polling)?);
        Self::start_with(config, polling, coordinator).await
    }

    pub async fn start_with(
        config: ServerConfig,
        polling: PollingSettings,
        coordinator: Arc<Coordinator>,
    ) -> Result<Self, SetupError> {
        match coordinator.refresh().await {
            CycleOutcome::Success { jobs } => {
                tracing::info!(server = %config.name, jobs, "Server ready");
            }
            CycleOutcome::Failed(e) => {
                return Err(SetupError::NotReady {
                    server: config.name.clone(),
                    reason: e.to_string(),
                });
            }
            CycleOutcome::Skipped => {
                return Err(SetupError::NotReady {
                    server: config.name.clone(),
                    reason: "first refresh already in progress".to_string(),
                });
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(&coordinator).run(shutdown_rx));

        Ok(Self {
            config,
            polling,
            coordinator,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn polling(&self) -> &PollingSettings {
        &self.polling
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Starts an out-of-schedule cycle; dropped if one is already running.
    pub fn request_refresh(&self) {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            coordinator.refresh().await;
        });
    }

    pub async fn shutdown(mut self) {
        self.stop().await;
    }

    /// Tears this instance down and builds a fresh one from the new parameters.
    pub async fn reconfigure(
        mut self,
        config: ServerConfig,
        polling: PollingSettings,
    ) -> Result<Self, SetupError> {
        tracing::info!(server = %self.config.name, "Reconfiguring server");
        self.stop().await;
        Self::start(config, polling).await
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(server = %self.config.name, error = %e, "Polling task ended abnormally");
            }
        }
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
