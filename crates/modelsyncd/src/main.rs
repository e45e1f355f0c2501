//! modelsyncd - keeps a model server's local directory in sync with HDFS.
//!
//! `modelsyncd run -- tensorflow_model_server --model_config_file=...` syncs
//! in the background and supervises the serving process. `once` runs a
//! single pass and `plan` prints what the next pass would do.

mod signals;
mod supervisor;

use anyhow::Context;
use clap::{Parser, Subcommand};
use modelsync_core::hadoop::resolve_classpath;
use modelsync_core::{
    ErrorClass, PassReport, RemoteLocation, RootLock, SyncConfig, SyncDaemon, SyncDefaults,
    SyncError, SyncTarget,
};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use supervisor::{ServingEnv, ServingProcess};

/// Process exit codes, following sysexits(3).
mod exit_code {
    pub const OK: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const UNAVAILABLE: u8 = 69;
    pub const TEMPFAIL: u8 = 75;
    pub const CONFIG: u8 = 78;
}

#[derive(Parser, Debug)]
#[command(name = "modelsyncd")]
#[command(about = "Sync versioned models from HDFS into a local serving directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// YAML configuration file (environment variables override it)
    #[arg(short, long, global = true, env = "MODELSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the remote root (hdfs://, webhdfs://, file:// or a local path)
    #[arg(long, global = true)]
    remote_root: Option<String>,

    /// Override the local model root
    #[arg(long, global = true)]
    local_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync in the background and supervise the serving command after `--`
    Run {
        /// Skip the blocking sync pass before the serving process starts
        #[arg(long)]
        no_initial_sync: bool,

        /// Serving command and its arguments
        #[arg(last = true)]
        serve: Vec<String>,
    },
    /// Run one sync pass, print its report and exit
    Once,
    /// Print the plan for the next pass without executing it
    Plan,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            exit_code::FAILURE
        }
    };

    // Blocking work still running after a forced shutdown would hold the
    // runtime open on drop.
    if code == exit_code::TEMPFAIL {
        std::process::exit(i32::from(code));
    }
    ExitCode::from(code)
}

fn init_logging(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Ok(exit_code::CONFIG);
        }
    };

    match cli.command {
        Command::Once => once(config).await,
        Command::Plan => plan(config).await,
        Command::Run {
            no_initial_sync,
            serve,
        } => serve_and_sync(config, no_initial_sync, serve).await,
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig, SyncError> {
    let mut config = SyncConfig::from_env(cli.config.as_deref())?;
    if let Some(remote) = &cli.remote_root {
        config.remote_root = Some(remote.clone());
    }
    if let Some(local) = &cli.local_root {
        config.local_model_root = local.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Build the daemon, take the root lock and check the remote root. On
/// failure returns the exit code to stop with.
async fn start_daemon(
    config: SyncConfig,
    location: RemoteLocation,
    take_lock: bool,
) -> Result<(Arc<SyncDaemon>, Option<RootLock>), u8> {
    let daemon = SyncDaemon::from_config(config, location).map_err(|e| {
        error!(error = %e, "Cannot create sync daemon");
        startup_exit_code(&e)
    })?;

    let lock = if take_lock {
        let lock = daemon.prepare().map_err(|e| {
            error!(root = %daemon.layout().root().display(), error = %e, "Cannot prepare local model root");
            exit_code::CONFIG
        })?;
        Some(lock)
    } else {
        None
    };

    daemon.check_remote().await.map_err(|e| {
        error!(error = %e, "Remote root unreachable");
        match e.class() {
            ErrorClass::ConfigFatal => exit_code::CONFIG,
            _ => exit_code::UNAVAILABLE,
        }
    })?;

    Ok((Arc::new(daemon), lock))
}

fn startup_exit_code(e: &SyncError) -> u8 {
    match e.class() {
        ErrorClass::ConfigFatal => exit_code::CONFIG,
        _ => exit_code::FAILURE,
    }
}

async fn once(config: SyncConfig) -> anyhow::Result<u8> {
    let location = match config.sync_target() {
        SyncTarget::Remote(location) => location,
        SyncTarget::LocalOnly(path) => {
            info!(path = %path.display(), "Remote root is local to the server; nothing to sync");
            return Ok(exit_code::OK);
        }
    };

    let (daemon, _lock) = match start_daemon(config, location, true).await {
        Ok(started) => started,
        Err(code) => return Ok(code),
    };

    let timeout = daemon.config().shutdown_timeout();
    let report = match pass_until_shutdown(&daemon, signals::shutdown_signal(), timeout).await {
        PassOutcome::Finished(Ok(report)) => report,
        PassOutcome::Finished(Err(e)) => {
            error!(error = %e, "Sync pass failed");
            return Ok(exit_code::FAILURE);
        }
        PassOutcome::Interrupted { drained } => return Ok(interrupted_exit_code(drained)),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.has_failures() {
        exit_code::FAILURE
    } else {
        exit_code::OK
    })
}

async fn plan(config: SyncConfig) -> anyhow::Result<u8> {
    let location = match config.sync_target() {
        SyncTarget::Remote(location) => location,
        SyncTarget::LocalOnly(path) => {
            info!(path = %path.display(), "Remote root is local to the server; nothing to plan");
            return Ok(exit_code::OK);
        }
    };

    let (daemon, _) = match start_daemon(config, location, false).await {
        Ok(started) => started,
        Err(code) => return Ok(code),
    };

    let preview = match daemon.preview().await {
        Ok(preview) => preview,
        Err(e) => {
            error!(error = %e, "Planning failed");
            return Ok(exit_code::UNAVAILABLE);
        }
    };
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(exit_code::OK)
}

async fn serve_and_sync(
    config: SyncConfig,
    no_initial_sync: bool,
    serve: Vec<String>,
) -> anyhow::Result<u8> {
    let target = config.sync_target();
    let model_base_path = match &target {
        SyncTarget::Remote(_) => config.local_model_root.clone(),
        SyncTarget::LocalOnly(path) => path.clone(),
    };

    let mut sync = None;
    match target {
        SyncTarget::Remote(location) => match start_daemon(config.clone(), location, true).await {
            Ok((daemon, lock)) => sync = Some((daemon, lock)),
            Err(code) => return Ok(code),
        },
        SyncTarget::LocalOnly(path) => {
            info!(path = %path.display(), "Remote sync disabled; serving the directory as is");
        }
    }

    // Listen for shutdown from here on, so the initial pass is covered too.
    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);
    let timeout = config.shutdown_timeout();

    let mut initial_pass_done = false;
    if let Some((daemon, _)) = &sync {
        if !no_initial_sync {
            info!("Running initial sync pass");
            match pass_until_shutdown(daemon, &mut shutdown, timeout).await {
                PassOutcome::Finished(Ok(_)) => initial_pass_done = true,
                PassOutcome::Finished(Err(e)) => {
                    warn!(error = %e, "Initial sync pass failed; continuing")
                }
                PassOutcome::Interrupted { drained } => {
                    return Ok(interrupted_exit_code(drained));
                }
            }
        }
    }

    let mut loop_handle: Option<JoinHandle<()>> = None;
    if let Some((daemon, _)) = &sync {
        if config.enable_sync_loop {
            let daemon = Arc::clone(daemon);
            loop_handle = Some(tokio::spawn(async move {
                if initial_pass_done {
                    daemon.run_after_initial_pass().await
                } else {
                    daemon.run().await
                }
            }));
        }
        signals::spawn_trigger_listener(Arc::clone(daemon));
    }

    let mut child = if serve.is_empty() {
        None
    } else {
        let env = ServingEnv {
            classpath: resolve_classpath(std::env::var("CLASSPATH").ok(), config.hadoop_home.as_deref())
                .await,
            model_base_path,
            model_name: config.model_name.clone(),
            hadoop_conf_dir: config.hadoop_conf_dir.clone(),
        };
        Some(ServingProcess::spawn(&serve, &env).context("cannot supervise serving process")?)
    };

    if child.is_none() && loop_handle.is_none() {
        info!("No sync loop and no serving command; exiting");
        return Ok(exit_code::OK);
    }

    // Either a shutdown signal arrives or the serving process exits first.
    let child_exit = match child.as_mut() {
        Some(process) => {
            let exited = tokio::select! {
                signal = &mut shutdown => {
                    info!(signal, "Shutdown requested");
                    None
                }
                status = process.wait() => Some(status.context("failed to wait for serving process")?),
            };
            if exited.is_none() {
                process.terminate();
            }
            exited
        }
        None => {
            let signal = (&mut shutdown).await;
            info!(signal, "Shutdown requested");
            None
        }
    };

    let mut code = exit_code::OK;

    if let (Some(handle), Some((daemon, _))) = (loop_handle, &sync) {
        if !drain_sync_task(daemon, handle, timeout).await {
            code = exit_code::TEMPFAIL;
        }
    }

    match (child_exit, child.as_mut()) {
        (Some(status), _) => {
            let child_code = supervisor::exit_code(status);
            warn!(%status, "Serving process exited; stopping");
            if code != exit_code::TEMPFAIL {
                code = child_code;
            }
        }
        (None, Some(process)) => {
            if process.stop(timeout).await.is_none() {
                code = exit_code::TEMPFAIL;
            }
        }
        (None, None) => {}
    }

    if code == exit_code::TEMPFAIL {
        error!("Shutdown did not complete in time; staging is cleaned at next start");
    } else {
        info!(code, "Shutdown complete");
    }
    Ok(code)
}

/// How a pass run against a shutdown signal ended.
enum PassOutcome {
    Finished(modelsync_core::Result<PassReport>),
    /// Shutdown arrived first. `drained` is false when the pass outlived the
    /// abort grace period.
    Interrupted { drained: bool },
}

/// Run one pass in the background while waiting for `shutdown`. A signal
/// drains the pass and aborts its fetches after `timeout`.
async fn pass_until_shutdown<S>(daemon: &Arc<SyncDaemon>, shutdown: S, timeout: Duration) -> PassOutcome
where
    S: Future<Output = &'static str>,
{
    let mut pass = {
        let daemon = Arc::clone(daemon);
        tokio::spawn(async move { daemon.run_once().await })
    };

    let finished = tokio::select! {
        joined = &mut pass => Some(joined),
        signal = shutdown => {
            info!(signal, "Shutdown requested during sync pass");
            None
        }
    };

    match finished {
        Some(joined) => PassOutcome::Finished(
            joined.unwrap_or_else(|e| Err(SyncError::Other(format!("Sync pass task failed: {}", e)))),
        ),
        None => PassOutcome::Interrupted {
            drained: drain_sync_task(daemon, pass, timeout).await,
        },
    }
}

fn interrupted_exit_code(drained: bool) -> u8 {
    if drained {
        info!("Shutdown complete");
        exit_code::OK
    } else {
        error!("Shutdown did not complete in time; staging is cleaned at next start");
        exit_code::TEMPFAIL
    }
}

/// Stop scheduling passes and wait for the sync task. Running fetches are
/// aborted after `timeout`. Returns false if the task still did not stop.
async fn drain_sync_task<T>(daemon: &SyncDaemon, mut handle: JoinHandle<T>, timeout: Duration) -> bool {
    daemon.drain_token().cancel();
    if tokio::time::timeout(timeout, &mut handle).await.is_ok() {
        return true;
    }

    warn!(
        timeout_secs = timeout.as_secs(),
        "Sync pass still running; aborting fetches"
    );
    daemon.abort_token().cancel();
    tokio::time::timeout(SyncDefaults::ABORT_GRACE, handle)
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clap::CommandFactory;
    use modelsync_core::remote::{ByteStream, RemoteEntry};
    use modelsync_core::{LocalStore, RemoteStore};
    use std::path::Path;
    use tempfile::TempDir;

    /// Lists a real directory tree but never delivers file content.
    struct StalledStore(LocalStore);

    #[async_trait]
    impl RemoteStore for StalledStore {
        fn describe(&self) -> String {
            "stalled".to_string()
        }

        async fn list(&self, path: &str) -> modelsync_core::Result<Vec<RemoteEntry>> {
            self.0.list(path).await
        }

        async fn stat(&self, path: &str) -> modelsync_core::Result<RemoteEntry> {
            self.0.stat(path).await
        }

        async fn read(&self, _path: &str) -> modelsync_core::Result<ByteStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    fn publish(remote: &Path) {
        std::fs::create_dir_all(remote.join("ranker/1")).unwrap();
        std::fs::write(remote.join("ranker/1/saved_model.pb"), b"graph").unwrap();
    }

    fn config_for(remote: &Path, local: &Path) -> SyncConfig {
        SyncConfig {
            remote_root: Some(format!("file://{}", remote.display())),
            local_model_root: local.to_path_buf(),
            min_free_space_bytes: 0,
            ..SyncConfig::default()
        }
    }

    fn daemon_with_store(remote: &Path, local: &Path, store: Arc<dyn RemoteStore>) -> Arc<SyncDaemon> {
        let config = config_for(remote, local);
        let location = RemoteLocation::parse(config.remote_root.as_deref().unwrap()).unwrap();
        Arc::new(SyncDaemon::new(config, location, store))
    }

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_collects_serving_command() {
        let cli = Cli::parse_from([
            "modelsyncd",
            "--local-root",
            "/srv/models",
            "run",
            "--no-initial-sync",
            "--",
            "tensorflow_model_server",
            "--port=8500",
        ]);
        assert_eq!(cli.local_root, Some(PathBuf::from("/srv/models")));
        match cli.command {
            Command::Run {
                no_initial_sync,
                serve,
            } => {
                assert!(no_initial_sync);
                assert_eq!(serve, vec!["tensorflow_model_server", "--port=8500"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_config_errors_exit_78() {
        assert_eq!(startup_exit_code(&SyncError::config("bad")), exit_code::CONFIG);
        assert_eq!(
            startup_exit_code(&SyncError::Other("boom".to_string())),
            exit_code::FAILURE
        );
    }

    #[tokio::test]
    async fn test_pass_completes_without_shutdown() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        publish(remote.path());
        let daemon = daemon_with_store(remote.path(), local.path(), Arc::new(LocalStore::new()));
        let _lock = daemon.prepare().unwrap();

        let outcome = pass_until_shutdown(
            &daemon,
            std::future::pending::<&'static str>(),
            Duration::from_secs(5),
        )
        .await;
        match outcome {
            PassOutcome::Finished(Ok(report)) => assert!(!report.has_failures()),
            PassOutcome::Finished(Err(e)) => panic!("pass failed: {}", e),
            PassOutcome::Interrupted { .. } => panic!("pass was interrupted"),
        }
        assert!(local.path().join("ranker/1/saved_model.pb").is_file());
    }

    #[tokio::test]
    async fn test_shutdown_during_pass_aborts_fetch() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        publish(remote.path());
        let daemon = daemon_with_store(
            remote.path(),
            local.path(),
            Arc::new(StalledStore(LocalStore::new())),
        );
        let _lock = daemon.prepare().unwrap();

        let outcome =
            pass_until_shutdown(&daemon, async { "SIGTERM" }, Duration::from_millis(50)).await;

        assert!(matches!(outcome, PassOutcome::Interrupted { drained: true }));
        assert!(daemon.drain_token().is_cancelled());
        assert!(daemon.abort_token().is_cancelled());
        assert!(!local.path().join("ranker/1").exists());
        assert_eq!(interrupted_exit_code(true), exit_code::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_abort_grace() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let daemon = daemon_with_store(remote.path(), local.path(), Arc::new(LocalStore::new()));

        // A task that ignores both tokens.
        let stuck = tokio::spawn(std::future::pending::<()>());
        assert!(!drain_sync_task(&daemon, stuck, Duration::from_secs(1)).await);
        assert!(daemon.abort_token().is_cancelled());
        assert_eq!(interrupted_exit_code(false), exit_code::TEMPFAIL);
    }

    #[tokio::test]
    async fn test_missing_remote_root_exits_unavailable() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let config = config_for(&remote.path().join("missing"), local.path());
        let location = RemoteLocation::parse(config.remote_root.as_deref().unwrap()).unwrap();

        let code = start_daemon(config, location, true).await.err();
        assert_eq!(code, Some(exit_code::UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_remote_root_that_is_a_file_exits_config() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let file = remote.path().join("models");
        std::fs::write(&file, b"not a directory").unwrap();
        let config = config_for(&file, local.path());
        let location = RemoteLocation::parse(config.remote_root.as_deref().unwrap()).unwrap();

        let code = start_daemon(config, location, true).await.err();
        assert_eq!(code, Some(exit_code::CONFIG));
    }
}
