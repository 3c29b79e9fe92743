//! Query the radio through an external helper before the pipeline starts.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::DeviceInfoConfig;

#[derive(Debug, thiserror::Error)]
pub enum DeviceInfoError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} did not finish within {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("{command} exited with {status}: {output}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        output: String,
    },
}

/// Run `<command> --port <port> info` and return its combined output.
pub async fn query_device_info(
    config: &DeviceInfoConfig,
    port: &str,
) -> Result<String, DeviceInfoError> {
    let child = Command::new(&config.command)
        .arg("--port")
        .arg(port)
        .arg("info")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DeviceInfoError::Spawn {
            command: config.command.clone(),
            source,
        })?;

    let output = tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        child.wait_with_output(),
    )
    .await
    .map_err(|_| DeviceInfoError::Timeout {
        command: config.command.clone(),
        timeout_secs: config.timeout_secs,
    })?
    .map_err(|source| DeviceInfoError::Spawn {
        command: config.command.clone(),
        source,
    })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim_end().to_string();

    if !output.status.success() {
        return Err(DeviceInfoError::Failed {
            command: config.command.clone(),
            status: output.status,
            output: combined,
        });
    }

    Ok(combined)
}
