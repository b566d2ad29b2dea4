mod app;
mod dbus;

use anyhow::Result;

pub use dbus::{DBUS_NAME, DBUS_PATH};

pub async fn run() -> Result<()> {
    tracing::info!("Starting vbr-monitor daemon");

    app::run().await
}
