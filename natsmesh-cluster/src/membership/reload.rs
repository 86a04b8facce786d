//! Reload signal for the local broker process

use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::error::{Error, Result};

/// Ask the broker to re-read its config file
///
/// Runs `<broker_binary> --signal reload=<component_name>` and waits for it to
/// exit. Any stderr output, a non-zero exit status, a timeout or a failure to
/// launch counts as failure; the reason is logged.
pub async fn reload_configuration(broker_binary: &str, component_name: &str, limit: Duration) -> bool {
    match signal_reload(broker_binary, component_name, limit).await {
        Ok(()) => {
            tracing::info!(
                broker_binary = %broker_binary,
                component = %component_name,
                "Broker configuration reload signalled"
            );
            true
        }
        Err(e) => {
            tracing::error!(
                broker_binary = %broker_binary,
                component = %component_name,
                error = %e,
                "Failed to signal broker configuration reload"
            );
            false
        }
    }
}

async fn signal_reload(broker_binary: &str, component_name: &str, limit: Duration) -> Result<()> {
    let child = Command::new(broker_binary)
        .arg("--signal")
        .arg(format!("reload={component_name}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // On timeout the future owning the child is dropped, which kills it.
    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| Error::Timeout(format!("{broker_binary} did not exit within {limit:?}")))??;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        return Err(Error::Process(stderr.trim().to_string()));
    }
    if !output.status.success() {
        return Err(Error::Process(format!("exited with {}", output.status)));
    }

    Ok(())
}
