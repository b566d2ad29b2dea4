use anyhow::{Context, Result};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

pub const DEFAULT_PORT: u16 = 9419;
pub const DEFAULT_API_VERSION: &str = "1.2-rev0";
const MAX_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub polling: PollingSettings,
    pub notifications: NotificationSettings,
    pub servers: Vec<ServerConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            polling: PollingSettings::default(),
            notifications: NotificationSettings::default(),
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_secs: u64,
    pub max_backoff_secs: u64,
    pub page_limit: u32,
    pub request_timeout_secs: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_backoff_secs: 1800,
            page_limit: 200,
            request_timeout_secs: 30,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub on_warning: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            on_warning: true,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_verify_ssl() -> bool {
    true
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("verify_ssl", &self.verify_ssl)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("vbr-monitor").join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path().context("Could not determine config directory")?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        settings.validate()?;

        tracing::info!(?path, servers = settings.servers.len(), "Loaded config");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_secs == 0 {
            anyhow::bail!("polling.interval_secs must be greater than 0");
        }
        if self.polling.request_timeout_secs == 0 {
            anyhow::bail!("polling.request_timeout_secs must be greater than 0");
        }
        if self.polling.page_limit == 0 || self.polling.page_limit > MAX_PAGE_LIMIT {
            anyhow::bail!(
                "polling.page_limit must be between 1 and {}, got {}",
                MAX_PAGE_LIMIT,
                self.polling.page_limit
            );
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                anyhow::bail!("servers.name must not be empty");
            }
            if server.host.trim().is_empty() {
                anyhow::bail!("servers.host must not be empty for server {}", server.name);
            }
            if !names.insert(server.name.as_str()) {
                anyhow::bail!("duplicate server name: {}", server.name);
            }
        }
        Ok(())
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Holds the current settings and broadcasts a new copy whenever the config
/// file changes on disk.
pub struct SettingsWatcher {
    path: PathBuf,
    current: Arc<RwLock<Settings>>,
    tx: broadcast::Sender<Settings>,
    _watcher: Option<RecommendedWatcher>,
}

impl SettingsWatcher {
    pub fn new() -> Result<Self> {
        let path = Settings::config_path().context("Could not determine config directory")?;
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Result<Self> {
        let settings = Settings::load_from(&path)?;
        let (tx, _) = broadcast::channel(8);

        Ok(Self {
            path,
            current: Arc::new(RwLock::new(settings)),
            tx,
            _watcher: None,
        })
    }

    pub async fn get(&self) -> Settings {
        self.current.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Re-reads the config file. Returns true when the settings changed.
    pub async fn reload(&self) -> Result<bool> {
        reload_settings(&self.path, &self.current, &self.tx).await
    }

    pub fn start_watching(&mut self) -> Result<()> {
        let Some(parent) = self.path.parent().map(Path::to_path_buf) else {
            anyhow::bail!("Config path has no parent: {}", self.path.display());
        };
        if !parent.exists() {
            tracing::warn!(?parent, "Config directory does not exist, skipping watch");
            return Ok(());
        }

        let file_name = self.path.file_name().map(|f| f.to_os_string());
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else {
                    return;
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                let touches_config = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|f| f.to_os_string()) == file_name);
                if touches_config {
                    let _ = notify_tx.send(());
                }
            },
            Config::default(),
        )?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch directory: {}", parent.display()))?;
        tracing::info!(?parent, "Watching config directory");

        let path = self.path.clone();
        let current = Arc::clone(&self.current);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while notify_rx.recv().await.is_some() {
                // Editors write in bursts; settle before reading.
                tokio::time::sleep(Duration::from_millis(200)).await;
                while notify_rx.try_recv().is_ok() {}

                if let Err(e) = reload_settings(&path, &current, &tx).await {
                    tracing::warn!(error = %e, "Ignoring invalid config change");
                }
            }
        });

        self._watcher = Some(watcher);
        Ok(())
    }
}

async fn reload_settings(
    path: &Path,
    current: &RwLock<Settings>,
    tx: &broadcast::Sender<Settings>,
) -> Result<bool> {
    let fresh = Settings::load_from(path)?;

    {
        let mut current = current.write().await;
        if *current == fresh {
            tracing::debug!("Config unchanged after reload");
            return Ok(false);
        }
        *current = fresh.clone();
    }

    tracing::info!("Config changed, publishing new settings");
    let _ = tx.send(fresh);
    Ok(true)
}
