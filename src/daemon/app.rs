use crate::daemon::dbus::{start_dbus_server, DbusCommand};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vbr_monitor::coordinator::{Coordinator, ServerInstance, SetupError};
use vbr_monitor::core::notifications::{job_transitions, send_job_notification};
use vbr_monitor::core::retry::RetryState;
use vbr_monitor::core::settings::{
    NotificationSettings, PollingSettings, ServerConfig, Settings, SettingsWatcher,
};

const PENDING_CHECK_INTERVAL: Duration = Duration::from_secs(15);
const SETUP_RETRY_BASE: Duration = Duration::from_secs(60);
const SETUP_RETRY_MAX: Duration = Duration::from_secs(600);

pub async fn run() -> Result<()> {
    let mut settings_watcher = SettingsWatcher::new()?;
    let settings = settings_watcher.get().await;
    if let Err(e) = settings_watcher.start_watching() {
        tracing::warn!(error = %e, "Config watching disabled");
    }

    if settings.servers.is_empty() {
        tracing::warn!("No servers configured; add a [[servers]] entry to the config file");
    }

    let (mut registry, mut setup_rx) = InstanceRegistry::new(&settings);
    registry.apply(&settings);

    let (dbus_cmd_tx, mut dbus_cmd_rx) = mpsc::unbounded_channel::<DbusCommand>();
    let _dbus_connection = match start_dbus_server(dbus_cmd_tx).await {
        Ok(connection) => Some(connection),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "D-Bus unavailable, remote refresh disabled");
            None
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
    };

    serve(
        &mut registry,
        &settings_watcher,
        &mut dbus_cmd_rx,
        &mut setup_rx,
        shutdown,
    )
    .await;

    registry.shutdown_all().await;
    Ok(())
}

/// Handles commands, config changes and setup results until `shutdown`
/// resolves. Server setup runs in its own tasks, so nothing here waits on
/// the network.
async fn serve(
    registry: &mut InstanceRegistry,
    settings_watcher: &SettingsWatcher,
    dbus_cmd_rx: &mut mpsc::UnboundedReceiver<DbusCommand>,
    setup_rx: &mut mpsc::UnboundedReceiver<SetupDone>,
    shutdown: impl Future<Output = ()>,
) {
    let mut settings_rx = settings_watcher.subscribe();
    let mut pending_tick = tokio::time::interval(PENDING_CHECK_INTERVAL);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(cmd) = dbus_cmd_rx.recv() => match cmd {
                DbusCommand::Refresh => registry.refresh_all(),
                DbusCommand::Reload => match settings_watcher.reload().await {
                    Ok(true) => {}
                    Ok(false) => tracing::info!("Reload requested, config unchanged"),
                    Err(e) => tracing::warn!(error = %e, "Reload failed, keeping current config"),
                },
            },
            Some(done) = setup_rx.recv() => registry.finish(done),
            result = settings_rx.recv() => match result {
                Ok(new_settings) => registry.apply(&new_settings),
                Err(RecvError::Lagged(_)) => {
                    let latest = settings_watcher.get().await;
                    registry.apply(&latest);
                }
                Err(RecvError::Closed) => break,
            },
            _ = pending_tick.tick() => registry.retry_pending(),
            _ = &mut shutdown => break,
        }
    }
}

struct ManagedServer {
    instance: ServerInstance,
    alerts: Option<JoinHandle<()>>,
}

impl ManagedServer {
    fn new(instance: ServerInstance, notifications: &NotificationSettings) -> Self {
        let alerts = spawn_alerts(Arc::clone(instance.coordinator()), notifications);
        Self { instance, alerts }
    }

    fn stop_alerts(&mut self) {
        if let Some(handle) = self.alerts.take() {
            handle.abort();
        }
    }

    async fn stop(mut self) {
        tracing::debug!(server = %self.instance.name(), "Stopping server");
        self.stop_alerts();
        self.instance.shutdown().await;
    }
}

struct PendingServer {
    config: ServerConfig,
    retry: RetryState,
    next_attempt: Instant,
}

/// A setup or reconfigure task in flight. Results carrying another
/// generation are stale and get discarded.
struct Starting {
    generation: u64,
    config: ServerConfig,
}

/// Sent back by a setup task once the first cycle finished.
struct SetupDone {
    generation: u64,
    config: ServerConfig,
    retry: RetryState,
    result: Result<ServerInstance, SetupError>,
}

/// Every configured server, keyed by name: running instances, setups in
/// flight, and those whose first cycle has not succeeded yet.
struct InstanceRegistry {
    polling: PollingSettings,
    notifications: NotificationSettings,
    running: HashMap<String, ManagedServer>,
    starting: HashMap<String, Starting>,
    pending: HashMap<String, PendingServer>,
    next_generation: u64,
    setup_tx: mpsc::UnboundedSender<SetupDone>,
}

impl InstanceRegistry {
    fn new(settings: &Settings) -> (Self, mpsc::UnboundedReceiver<SetupDone>) {
        let (setup_tx, setup_rx) = mpsc::unbounded_channel();
        let registry = Self {
            polling: settings.polling.clone(),
            notifications: settings.notifications.clone(),
            running: HashMap::new(),
            starting: HashMap::new(),
            pending: HashMap::new(),
            next_generation: 0,
            setup_tx,
        };
        (registry, setup_rx)
    }

    fn apply(&mut self, settings: &Settings) {
        let polling_changed = self.polling != settings.polling;
        let notifications_changed = self.notifications != settings.notifications;
        self.polling = settings.polling.clone();
        self.notifications = settings.notifications.clone();

        let wanted: HashSet<&str> = settings.servers.iter().map(|s| s.name.as_str()).collect();
        let removed: Vec<String> = self
            .running
            .keys()
            .filter(|name| !wanted.contains(name.as_str()))
            .cloned()
            .collect();
        for name in removed {
            if let Some(managed) = self.running.remove(&name) {
                tracing::info!(server = %name, "Server removed from config");
                tokio::spawn(managed.stop());
            }
        }
        self.starting.retain(|name, _| wanted.contains(name.as_str()));
        self.pending.retain(|name, _| wanted.contains(name.as_str()));

        for config in &settings.servers {
            if let Some(mut managed) = self.running.remove(&config.name) {
                if !polling_changed && managed.instance.config() == config {
                    if notifications_changed {
                        managed.stop_alerts();
                        managed.alerts = spawn_alerts(
                            Arc::clone(managed.instance.coordinator()),
                            &self.notifications,
                        );
                    }
                    self.running.insert(config.name.clone(), managed);
                } else {
                    managed.stop_alerts();
                    let setup = managed
                        .instance
                        .reconfigure(config.clone(), self.polling.clone());
                    self.spawn_setup(config.clone(), fresh_retry(), setup);
                }
                continue;
            }

            let unchanged = |existing: &ServerConfig| !polling_changed && existing == config;
            if self.starting.get(&config.name).is_some_and(|s| unchanged(&s.config))
                || self.pending.get(&config.name).is_some_and(|p| unchanged(&p.config))
            {
                continue;
            }

            self.pending.remove(&config.name);
            let setup = ServerInstance::start(config.clone(), self.polling.clone());
            self.spawn_setup(config.clone(), fresh_retry(), setup);
        }
    }

    fn retry_pending(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.next_attempt <= now)
            .map(|(name, _)| name.clone())
            .collect();

        for name in due {
            let Some(pending) = self.pending.remove(&name) else {
                continue;
            };
            tracing::info!(
                server = %name,
                previous_failures = pending.retry.consecutive_failures(),
                "Retrying server setup"
            );
            let setup = ServerInstance::start(pending.config.clone(), self.polling.clone());
            self.spawn_setup(pending.config, pending.retry, setup);
        }
    }

    fn spawn_setup<F>(&mut self, config: ServerConfig, retry: RetryState, setup: F)
    where
        F: Future<Output = Result<ServerInstance, SetupError>> + Send + 'static,
    {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.starting.insert(
            config.name.clone(),
            Starting {
                generation,
                config: config.clone(),
            },
        );

        let setup_tx = self.setup_tx.clone();
        tokio::spawn(async move {
            let result = setup.await;
            // A closed channel means the daemon is stopping; dropping the
            // instance stops its polling task.
            let _ = setup_tx.send(SetupDone {
                generation,
                config,
                retry,
                result,
            });
        });
    }

    fn finish(&mut self, done: SetupDone) {
        let current = self
            .starting
            .get(&done.config.name)
            .is_some_and(|s| s.generation == done.generation);
        if !current {
            tracing::debug!(server = %done.config.name, "Discarding superseded setup");
            if let Ok(instance) = done.result {
                tokio::spawn(instance.shutdown());
            }
            return;
        }

        self.starting.remove(&done.config.name);
        self.install(done.config, done.retry, done.result);
    }

    fn install(
        &mut self,
        config: ServerConfig,
        mut retry: RetryState,
        result: Result<ServerInstance, SetupError>,
    ) {
        match result {
            Ok(instance) => {
                let managed = ManagedServer::new(instance, &self.notifications);
                self.running.insert(config.name.clone(), managed);
            }
            Err(e) if e.is_retryable() => {
                retry.record_failure();
                let delay = retry.current_delay();
                tracing::warn!(
                    server = %config.name,
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "Server not ready, will retry"
                );
                self.pending.insert(
                    config.name.clone(),
                    PendingServer {
                        config,
                        retry,
                        next_attempt: Instant::now() + delay,
                    },
                );
            }
            Err(e) => {
                tracing::error!(server = %config.name, error = %e, "Server setup failed");
            }
        }
    }

    fn refresh_all(&mut self) {
        for managed in self.running.values() {
            managed.instance.request_refresh();
        }
        let now = Instant::now();
        for pending in self.pending.values_mut() {
            pending.next_attempt = now;
        }
    }

    async fn shutdown_all(&mut self) {
        self.starting.clear();
        self.pending.clear();

        let stops: Vec<_> = self
            .running
            .drain()
            .map(|(_, managed)| tokio::spawn(managed.stop()))
            .collect();
        for stop in stops {
            if let Err(e) = stop.await {
                tracing::warn!(error = %e, "Server shutdown task failed");
            }
        }
    }
}

fn fresh_retry() -> RetryState {
    RetryState::new(SETUP_RETRY_BASE, SETUP_RETRY_MAX)
}

/// Raises desktop notifications for jobs that turn failed (or warning) between cycles.
fn spawn_alerts(
    coordinator: Arc<Coordinator>,
    settings: &NotificationSettings,
) -> Option<JoinHandle<()>> {
    if !settings.enabled {
        return None;
    }

    let include_warning = settings.on_warning;
    let mut events = coordinator.subscribe();

    Some(tokio::spawn(async move {
        let mut previous = coordinator.snapshot().await;

        loop {
            match events.recv().await {
                Ok(event) if !event.succeeded => continue,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }

            let current = coordinator.snapshot().await;
            if let (Some(prev), Some(cur)) = (&previous, &current) {
                let transitions = job_transitions(prev, cur, include_warning);
                if !transitions.is_empty() {
                    let server = coordinator.name().to_string();
                    tokio::task::spawn_blocking(move || {
                        for transition in &transitions {
                            if let Err(e) = send_job_notification(&server, transition) {
                                tracing::warn!(error = %e, "Failed to send notification");
                            }
                        }
                    });
                }
            }
            previous = current;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unreachable_server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "svc".to_string(),
            password: "pw".to_string(),
            verify_ssl: true,
            api_version: "1.2-rev0".to_string(),
        }
    }

    fn make_settings(servers: Vec<ServerConfig>) -> Settings {
        Settings {
            polling: PollingSettings {
                request_timeout_secs: 2,
                ..PollingSettings::default()
            },
            servers,
            ..Settings::default()
        }
    }

    fn temp_config(tag: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "vbr-monitor-daemon-{}-{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Feeds setup results back until nothing is in flight.
    async fn settle(registry: &mut InstanceRegistry, setup_rx: &mut mpsc::UnboundedReceiver<SetupDone>) {
        while !registry.starting.is_empty() {
            let done = tokio::time::timeout(Duration::from_secs(10), setup_rx.recv())
                .await
                .unwrap()
                .unwrap();
            registry.finish(done);
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_is_pending() {
        let settings = make_settings(vec![unreachable_server("a"), unreachable_server("b")]);
        let (mut registry, mut setup_rx) = InstanceRegistry::new(&settings);

        registry.apply(&settings);
        assert_eq!(registry.starting.len(), 2);
        assert!(registry.pending.is_empty());

        settle(&mut registry, &mut setup_rx).await;

        assert!(registry.running.is_empty());
        assert_eq!(registry.pending.len(), 2);
        let pending = &registry.pending["a"];
        assert_eq!(pending.retry.consecutive_failures(), 1);
        assert!(pending.next_attempt > Instant::now());
    }

    #[tokio::test]
    async fn test_removed_server_leaves_pending() {
        let settings = make_settings(vec![unreachable_server("a"), unreachable_server("b")]);
        let (mut registry, mut setup_rx) = InstanceRegistry::new(&settings);
        registry.apply(&settings);
        settle(&mut registry, &mut setup_rx).await;

        let trimmed = make_settings(vec![unreachable_server("b")]);
        registry.apply(&trimmed);

        assert!(!registry.pending.contains_key("a"));
        assert!(registry.pending.contains_key("b"));
        assert!(registry.starting.is_empty());
    }

    #[tokio::test]
    async fn test_changed_server_supersedes_setup_in_flight() {
        let settings = make_settings(vec![unreachable_server("a")]);
        let (mut registry, mut setup_rx) = InstanceRegistry::new(&settings);
        registry.apply(&settings);

        let mut moved = unreachable_server("a");
        moved.port = 2;
        registry.apply(&make_settings(vec![moved]));
        assert_eq!(registry.starting["a"].config.port, 2);

        settle(&mut registry, &mut setup_rx).await;

        assert_eq!(registry.pending.len(), 1);
        assert_eq!(registry.pending["a"].config.port, 2);
    }

    #[tokio::test]
    async fn test_refresh_makes_pending_due() {
        let settings = make_settings(vec![unreachable_server("a")]);
        let (mut registry, mut setup_rx) = InstanceRegistry::new(&settings);
        registry.apply(&settings);
        settle(&mut registry, &mut setup_rx).await;

        registry.refresh_all();
        assert!(registry.pending["a"].next_attempt <= Instant::now());

        registry.retry_pending();
        assert!(registry.pending.is_empty());
        assert!(registry.starting.contains_key("a"));

        settle(&mut registry, &mut setup_rx).await;
        let pending = &registry.pending["a"];
        assert_eq!(pending.retry.consecutive_failures(), 2);
        assert!(pending.next_attempt > Instant::now() + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_reload_handled_while_setup_in_flight() {
        // 10.255.255.1 is not routable, so setup can sit in connect until the timeout.
        let path = temp_config(
            "reload",
            r#"
                [polling]
                request_timeout_secs = 5

                [[servers]]
                name = "a"
                host = "10.255.255.1"
                username = "svc"
                password = "pw"
            "#,
        );
        let watcher = SettingsWatcher::with_path(path.clone()).unwrap();
        let settings = watcher.get().await;
        let (mut registry, mut setup_rx) = InstanceRegistry::new(&settings);
        registry.apply(&settings);
        assert!(registry.starting.contains_key("a"));

        std::fs::write(&path, "[polling]\nrequest_timeout_secs = 5\n").unwrap();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        cmd_tx.send(DbusCommand::Reload).unwrap();

        let served = tokio::time::timeout(
            Duration::from_secs(2),
            serve(
                &mut registry,
                &watcher,
                &mut cmd_rx,
                &mut setup_rx,
                tokio::time::sleep(Duration::from_millis(300)),
            ),
        )
        .await;

        assert!(served.is_ok());
        assert!(watcher.get().await.servers.is_empty());
        assert!(registry.starting.is_empty());
        assert!(registry.pending.is_empty());
        assert!(registry.running.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let settings = make_settings(vec![unreachable_server("a")]);
        let (mut registry, mut setup_rx) = InstanceRegistry::new(&settings);
        registry.apply(&settings);
        settle(&mut registry, &mut setup_rx).await;

        registry.shutdown_all().await;
        assert!(registry.running.is_empty());
        assert!(registry.pending.is_empty());
        assert!(registry.starting.is_empty());
    }
}
