use anyhow::{Context, Result};
use tokio::sync::mpsc;
use zbus::interface;

pub const DBUS_NAME: &str = "io.github.VbrMonitor";
pub const DBUS_PATH: &str = "/io/github/VbrMonitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbusCommand {
    Refresh,
    Reload,
}

struct MonitorService {
    cmd_tx: mpsc::UnboundedSender<DbusCommand>,
}

impl MonitorService {
    fn dispatch(&self, cmd: DbusCommand) -> zbus::fdo::Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|e| zbus::fdo::Error::Failed(format!("daemon is shutting down: {e}")))
    }
}

#[interface(name = "io.github.VbrMonitor")]
impl MonitorService {
    async fn refresh(&self) -> zbus::fdo::Result<()> {
        tracing::info!("D-Bus Refresh called");
        self.dispatch(DbusCommand::Refresh)
    }

    async fn reload(&self) -> zbus::fdo::Result<()> {
        tracing::info!("D-Bus Reload called");
        self.dispatch(DbusCommand::Reload)
    }
}

pub async fn start_dbus_server(
    cmd_tx: mpsc::UnboundedSender<DbusCommand>,
) -> Result<zbus::Connection> {
    let connection = zbus::connection::Builder::session()
        .context("Failed to connect to session D-Bus")?
        .name(DBUS_NAME)
        .context("Failed to request D-Bus name")?
        .serve_at(DBUS_PATH, MonitorService { cmd_tx })
        .context("Failed to register D-Bus object")?
        .build()
        .await
        .context("Failed to start D-Bus service")?;

    tracing::info!(name = DBUS_NAME, path = DBUS_PATH, "D-Bus service registered");
    Ok(connection)
}
