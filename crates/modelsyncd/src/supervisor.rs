//! Serving process supervision.
//!
//! The serving command runs as a child with the Hadoop and model environment
//! it needs. Shutdown forwards SIGTERM and waits; a child that outlives the
//! timeout is killed.

use anyhow::{bail, Context};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Environment handed to the serving process.
#[derive(Debug, Clone, Default)]
pub struct ServingEnv {
    pub classpath: Option<String>,
    pub model_base_path: PathBuf,
    pub model_name: Option<String>,
    pub hadoop_conf_dir: Option<PathBuf>,
}

impl ServingEnv {
    fn vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![("MODEL_BASE_PATH", self.model_base_path.to_string_lossy().to_string())];
        if let Some(classpath) = &self.classpath {
            vars.push(("CLASSPATH", classpath.clone()));
        }
        if let Some(name) = &self.model_name {
            vars.push(("MODEL_NAME", name.clone()));
        }
        if let Some(dir) = &self.hadoop_conf_dir {
            vars.push(("HADOOP_CONF_DIR", dir.to_string_lossy().to_string()));
        }
        vars
    }
}

/// A running serving process.
pub struct ServingProcess {
    child: Child,
    program: String,
}

impl ServingProcess {
    /// Start `command[0]` with the remaining elements as arguments.
    pub fn spawn(command: &[String], env: &ServingEnv) -> anyhow::Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("serving command is empty");
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env.vars() {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to start serving process '{}'", program))?;
        info!(program = %program, pid = ?child.id(), "Serving process started");

        Ok(Self {
            child,
            program: program.clone(),
        })
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Ask the process to stop.
    pub fn terminate(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let Ok(raw) = i32::try_from(pid) else {
                warn!(pid, "Process id out of range; killing instead");
                let _ = self.child.start_kill();
                return;
            };
            match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => info!(program = %self.program, pid, "Forwarded SIGTERM to serving process"),
                Err(e) => warn!(program = %self.program, pid, error = %e, "Failed to signal serving process"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.start_kill() {
                warn!(program = %self.program, pid, error = %e, "Failed to stop serving process");
            }
        }
    }

    /// Terminate and wait up to `timeout`. Returns `None` if the process had
    /// to be killed.
    pub async fn stop(&mut self, timeout: Duration) -> Option<ExitStatus> {
        self.terminate();
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(program = %self.program, %status, "Serving process exited");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(program = %self.program, error = %e, "Failed to wait for serving process");
                None
            }
            Err(_) => {
                warn!(
                    program = %self.program,
                    timeout_secs = timeout.as_secs(),
                    "Serving process did not exit in time; killing it"
                );
                let _ = self.child.kill().await;
                None
            }
        }
    }
}

/// Exit code for the daemon when the serving process ended with `status`.
/// Death by signal maps to `128 + signal` like a shell does.
pub fn exit_code(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return u8::try_from(code).unwrap_or(1);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return u8::try_from(128 + signal).unwrap_or(1);
        }
    }

    1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_env_vars() {
        let env = ServingEnv {
            classpath: Some("/a.jar:/b.jar".to_string()),
            model_base_path: PathBuf::from("/models"),
            model_name: Some("ranker".to_string()),
            hadoop_conf_dir: None,
        };
        let vars = env.vars();
        assert!(vars.contains(&("MODEL_BASE_PATH", "/models".to_string())));
        assert!(vars.contains(&("CLASSPATH", "/a.jar:/b.jar".to_string())));
        assert!(vars.contains(&("MODEL_NAME", "ranker".to_string())));
        assert!(!vars.iter().any(|(k, _)| *k == "HADOOP_CONF_DIR"));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(ServingProcess::spawn(&[], &ServingEnv::default()).is_err());
    }

    #[tokio::test]
    async fn test_exit_code_propagated() {
        let mut process = ServingProcess::spawn(&sh("exit 7"), &ServingEnv::default()).unwrap();
        let status = process.wait().await.unwrap();
        assert_eq!(exit_code(status), 7);
    }

    #[tokio::test]
    async fn test_child_sees_environment() {
        let env = ServingEnv {
            model_base_path: PathBuf::from("/srv/models"),
            ..ServingEnv::default()
        };
        let mut process =
            ServingProcess::spawn(&sh("test \"$MODEL_BASE_PATH\" = /srv/models"), &env).unwrap();
        assert!(process.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_stop_forwards_sigterm() {
        let mut process = ServingProcess::spawn(
            &sh("trap 'exit 0' TERM; while true; do sleep 0.1; done"),
            &ServingEnv::default(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_stop_kills_after_timeout() {
        let mut process = ServingProcess::spawn(
            &sh("trap '' TERM; while true; do sleep 0.1; done"),
            &ServingEnv::default(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(process.stop(Duration::from_millis(300)).await.is_none());
    }
}
