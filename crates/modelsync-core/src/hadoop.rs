//! Hadoop client environment for the serving process.
//!
//! TF Serving reads `hdfs://` paths through libhdfs, which needs the Hadoop
//! jars on `CLASSPATH`. The daemon resolves it once before spawning the
//! server.

use crate::config::NetworkDefaults;
use crate::error::{Result, SyncError};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Run `$HADOOP_HOME/bin/hadoop classpath --glob` and return its output.
pub async fn hadoop_classpath(hadoop_home: &Path, timeout: Duration) -> Result<String> {
    let program = hadoop_home.join("bin").join("hadoop");
    debug!(program = %program.display(), "Discovering Hadoop classpath");

    let output = tokio::time::timeout(
        timeout,
        Command::new(&program)
            .args(["classpath", "--glob"])
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| SyncError::Timeout(format!("{} classpath --glob", program.display())))?
    .map_err(|e| SyncError::io_with_path(e, &program))?;

    if !output.status.success() {
        return Err(SyncError::Other(format!(
            "{} classpath --glob exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let classpath = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if classpath.is_empty() {
        return Err(SyncError::Other(format!(
            "{} classpath --glob printed nothing",
            program.display()
        )));
    }
    Ok(classpath)
}

/// `CLASSPATH` for the serving process.
///
/// An existing non-empty value is kept. Otherwise it is discovered from
/// `hadoop_home`; failures are logged and leave it unset, since the server
/// only needs it for `hdfs://` paths.
pub async fn resolve_classpath(existing: Option<String>, hadoop_home: Option<&Path>) -> Option<String> {
    if let Some(classpath) = existing.filter(|c| !c.trim().is_empty()) {
        debug!("Using CLASSPATH from the environment");
        return Some(classpath);
    }
    let home = hadoop_home?;
    match hadoop_classpath(home, NetworkDefaults::CLASSPATH_TIMEOUT).await {
        Ok(classpath) => {
            info!(entries = classpath.split(':').count(), "Discovered Hadoop classpath");
            Some(classpath)
        }
        Err(e) => {
            warn!(error = %e, "Could not discover Hadoop classpath; leaving CLASSPATH unset");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_hadoop(script: &str) -> TempDir {
        let home = TempDir::new().unwrap();
        let bin = home.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let program = bin.join("hadoop");
        std::fs::write(&program, script).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        home
    }

    #[tokio::test]
    async fn test_classpath_from_hadoop_binary() {
        let home = fake_hadoop("#!/bin/sh\necho \"/opt/hadoop/etc/hadoop:/opt/hadoop/share/a.jar\"\n");
        let classpath = hadoop_classpath(home.path(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(classpath, "/opt/hadoop/etc/hadoop:/opt/hadoop/share/a.jar");
    }

    #[tokio::test]
    async fn test_classpath_failure_exit() {
        let home = fake_hadoop("#!/bin/sh\necho boom >&2\nexit 3\n");
        let err = hadoop_classpath(home.path(), Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_resolve_prefers_existing() {
        let resolved = resolve_classpath(Some("/already/set".to_string()), None).await;
        assert_eq!(resolved.as_deref(), Some("/already/set"));
        assert_eq!(resolve_classpath(Some("  ".to_string()), None).await, None);
    }

    #[tokio::test]
    async fn test_resolve_missing_binary_is_none() {
        let home = TempDir::new().unwrap();
        assert_eq!(resolve_classpath(None, Some(home.path())).await, None);
    }
}
