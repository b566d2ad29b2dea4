use crate::daemon::{DBUS_NAME, DBUS_PATH};
use anyhow::{Context, Result};

pub async fn run(reload: bool) -> Result<()> {
    let connection = zbus::Connection::session()
        .await
        .context("Failed to connect to session D-Bus")?;

    let method = if reload { "Reload" } else { "Refresh" };

    let _reply: () = connection
        .call_method(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_NAME), method, &())
        .await
        .with_context(|| format!("Failed to call {method} method - is the daemon running?"))?
        .body()
        .deserialize()
        .context("Failed to deserialize response")?;

    if reload {
        println!("Config reload triggered successfully");
    } else {
        println!("Refresh triggered successfully");
    }
    Ok(())
}
