//! Control-plane reads via `snapctl`.

use tokio::process::Command;

use crate::error::SupervisorError;

/// Read a configuration value from the snap control plane.
///
/// Every failure mode (snapctl missing, non-zero exit, non-UTF-8 output)
/// maps to [`SupervisorError::ConfigUnavailable`].
pub async fn get(key: &str) -> Result<String, SupervisorError> {
    let output = Command::new("snapctl")
        .arg("get")
        .arg(key)
        .output()
        .await
        .map_err(|e| SupervisorError::ConfigUnavailable(format!("failed to run snapctl: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SupervisorError::ConfigUnavailable(format!(
            "snapctl get {key} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|_| SupervisorError::ConfigUnavailable(format!("snapctl get {key}: non-UTF-8 output")))
}
