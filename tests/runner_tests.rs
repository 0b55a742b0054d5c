#![cfg(unix)]

use fastdev_runner::config::PortRange;
use fastdev_runner::error::Error;
use fastdev_runner::{DevRunner, EnsureStatus, HealthStatus, RunnerConfig, ServerMode, ServerState};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// Writes an executable stub the runner launches in place of uvicorn.
/// The stub ignores the uvicorn-style arguments it receives.
fn write_stub(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("stub-server");
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

const LONG_RUNNING_STUB: &str = "#!/bin/sh\necho \"INFO: stub server booted\"\nexec sleep 300\n";

const CRASHING_STUB: &str = concat!(
    "#!/bin/sh\n",
    "echo \"Traceback (most recent call last):\"\n",
    "echo \"  File \\\"/srv/app/main.py\\\", line 3, in <module>\"\n",
    "echo \"ModuleNotFoundError: No module named 'httpx'\"\n",
    "exit 1\n",
);

const CLEAN_EXIT_STUB: &str = "#!/bin/sh\necho \"INFO: done\"\nexit 0\n";

fn test_config(dir: &Path, launcher: &Path, range: (u16, u16)) -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.state_file = Some(dir.join("servers.json"));
    config.port_range = PortRange {
        start: range.0,
        end: range.1,
    };
    config.launcher.program = launcher.to_string_lossy().into_owned();
    config.grace_timeout_secs = 5;
    config
}

/// Polls `server_info` until the server reaches `state`.
async fn wait_for_state(runner: &DevRunner, name: &str, state: ServerState) {
    for _ in 0..100 {
        if runner.server_info(name).unwrap().status == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "server '{}' never reached {:?}, currently {:?}",
        name,
        state,
        runner.server_info(name).unwrap().status
    );
}

#[tokio::test]
async fn test_ensure_running_is_idempotent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18300, 18310))).unwrap();

    let first = runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    assert_eq!(first.status, EnsureStatus::Started);
    let port = first.server.port.unwrap();
    assert!((18300..18310).contains(&port));
    assert_eq!(
        first.server.url.as_deref(),
        Some(format!("http://localhost:{}", port).as_str())
    );

    let second = runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    assert_eq!(second.status, EnsureStatus::AlreadyRunning);
    assert_eq!(second.server.port, Some(port));
    assert!(second.message.contains("already running"));
    assert!(second.message.contains("hot-reload"));

    runner.stop("api").await.unwrap();
}

#[tokio::test]
async fn test_concurrent_ensure_running_spawns_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18310, 18320))).unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let runner = runner.clone();
        let path = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            runner.ensure_running("api", path, ServerMode::Dev).await
        }));
    }

    let mut started = 0;
    let mut ports = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.status == EnsureStatus::Started {
            started += 1;
        }
        ports.push(outcome.server.port.unwrap());
    }

    assert_eq!(started, 1, "exactly one caller should launch the process");
    assert!(ports.windows(2).all(|w| w[0] == w[1]));

    runner.stop("api").await.unwrap();
}

#[tokio::test]
async fn test_stop_then_restart_keeps_port() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18320, 18330))).unwrap();

    let first = runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    let port = first.server.port.unwrap();

    let stopped = runner.stop("api").await.unwrap();
    assert_eq!(stopped.status, "success");
    assert_eq!(runner.server_info("api").unwrap().status, ServerState::Stopped);

    // Restart reuses the persisted port while it is still free.
    let second = runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    assert_eq!(second.status, EnsureStatus::Started);
    assert_eq!(second.server.port, Some(port));

    runner.stop("api").await.unwrap();
}

#[tokio::test]
async fn test_crash_is_observed_and_diagnosed() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), CRASHING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18330, 18340))).unwrap();

    let outcome = runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    assert_eq!(outcome.status, EnsureStatus::Started);

    // The exit watcher marks the record crashed without anyone polling.
    wait_for_state(&runner, "api", ServerState::Crashed).await;

    let diagnosis = runner.diagnose_crash("api").await.unwrap();
    assert_eq!(diagnosis.solution, "Run: pip install httpx");
    assert_eq!(diagnosis.error, "Missing module: httpx");
    assert_eq!(diagnosis.file.as_deref(), Some("/srv/app/main.py"));
    assert_eq!(diagnosis.line, Some(3));
    assert!(diagnosis.crashed_at.is_some());

    // The captured output is still queryable.
    let logs = runner.get_logs("api", 50, None).await.unwrap();
    assert!(logs.iter().any(|l| l.contains("ModuleNotFoundError")));

    // A crashed server can be started again.
    let restarted = runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    assert_eq!(restarted.status, EnsureStatus::Started);
    wait_for_state(&runner, "api", ServerState::Crashed).await;
}

#[tokio::test]
async fn test_clean_exit_settles_on_stopped() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), CLEAN_EXIT_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18340, 18350))).unwrap();

    runner
        .ensure_running("api", dir.path(), ServerMode::Test)
        .await
        .unwrap();
    wait_for_state(&runner, "api", ServerState::Stopped).await;

    // A clean exit is not a crash.
    let result = runner.diagnose_crash("api").await;
    assert!(matches!(result, Err(Error::NoCrashRecorded(_))));
}

#[tokio::test]
async fn test_invalid_transitions_are_reported() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18350, 18360))).unwrap();

    let result = runner.stop("ghost").await;
    assert!(matches!(result, Err(Error::ServerNotFound(_))));

    runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    runner.stop("api").await.unwrap();

    // Stopping a stopped server is an invalid transition, not a no-op.
    let result = runner.stop("api").await;
    assert!(matches!(
        result,
        Err(Error::InvalidTransition {
            from: ServerState::Stopped,
            ..
        })
    ));
}

#[tokio::test]
async fn test_log_tail_bound_and_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(
        dir.path(),
        concat!(
            "#!/bin/sh\n",
            "i=1\n",
            "while [ $i -le 20 ]; do echo \"line $i\"; i=$((i+1)); done\n",
            "exec sleep 300\n",
        ),
    );
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18360, 18370))).unwrap();

    runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();

    // Wait until the capture task has drained all the output.
    for _ in 0..100 {
        if runner.get_logs("api", 100, None).await.unwrap().len() >= 20 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let tail = runner.get_logs("api", 5, None).await.unwrap();
    assert_eq!(tail.len(), 5);
    assert_eq!(tail.last().map(String::as_str), Some("line 20"));
    assert_eq!(tail.first().map(String::as_str), Some("line 16"));

    runner.stop("api").await.unwrap();
}

#[tokio::test]
async fn test_ports_are_unique_across_servers() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18370, 18380))).unwrap();

    let a = runner
        .ensure_running("alpha", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    let b = runner
        .ensure_running("beta", dir.path(), ServerMode::Dev)
        .await
        .unwrap();

    assert_ne!(a.server.port, b.server.port);

    let summaries = runner.list_servers();
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.status == ServerState::Running));

    runner.stop("alpha").await.unwrap();
    runner.stop("beta").await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_get_distinct_ports() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18430, 18450))).unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let runner = runner.clone();
        let path = dir.path().to_path_buf();
        let name = format!("srv-{}", i);
        handles.push(tokio::spawn(async move {
            runner.ensure_running(&name, path, ServerMode::Dev).await
        }));
    }

    let mut ports = Vec::new();
    for handle in handles {
        ports.push(handle.await.unwrap().unwrap().server.port.unwrap());
    }

    ports.sort_unstable();
    let before = ports.len();
    ports.dedup();
    assert_eq!(ports.len(), before, "duplicate ports handed out: {:?}", ports);

    for i in 0..10 {
        runner.stop(&format!("srv-{}", i)).await.unwrap();
    }
}

#[tokio::test]
async fn test_remove_then_concurrent_restart_spawns_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18450, 18460))).unwrap();

    runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    runner.stop("api").await.unwrap();
    runner.remove("api").await.unwrap();

    // Callers racing the freshly re-registered name stay serialized.
    let mut handles = Vec::new();
    for _ in 0..5 {
        let runner = runner.clone();
        let path = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            runner.ensure_running("api", path, ServerMode::Dev).await
        }));
    }

    let mut started = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().status == EnsureStatus::Started {
            started += 1;
        }
    }
    assert_eq!(started, 1, "exactly one caller should launch the process");

    let summaries = runner.list_servers();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].status, ServerState::Running);

    runner.stop("api").await.unwrap();
}

#[tokio::test]
async fn test_registry_survives_manager_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let config = test_config(dir.path(), &stub, (18380, 18390));

    let first = DevRunner::open(config.clone()).unwrap();
    let outcome = first
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    let port = outcome.server.port.unwrap();
    drop(first);

    // A second manager instance adopts the still-running process.
    let second = DevRunner::open(config).unwrap();
    let info = second.server_info("api").unwrap();
    assert_eq!(info.status, ServerState::Running);
    assert_eq!(info.port, Some(port));

    let outcome = second
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    assert_eq!(outcome.status, EnsureStatus::AlreadyRunning);
    assert_eq!(outcome.server.port, Some(port));

    // Stop works through the pid even without a live handle.
    second.stop("api").await.unwrap();
    assert_eq!(second.server_info("api").unwrap().status, ServerState::Stopped);
}

#[tokio::test]
async fn test_spawn_failure_rolls_back() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no-such-launcher");
    let runner = DevRunner::open(test_config(dir.path(), &missing, (18390, 18400))).unwrap();

    let result = runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await;
    assert!(matches!(result, Err(Error::ProcessSpawnFailed { .. })));

    // No half-started record survives.
    assert_eq!(runner.server_info("api").unwrap().status, ServerState::Stopped);

    // The port reservation was released along with the rollback.
    let reserved: Vec<_> = runner
        .list_servers()
        .into_iter()
        .filter(|s| s.status != ServerState::Stopped)
        .collect();
    assert!(reserved.is_empty());
}

#[tokio::test]
async fn test_health_check_reflects_liveness() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18400, 18410))).unwrap();

    let result = runner.health_check("ghost").await;
    assert!(matches!(result, Err(Error::ServerNotFound(_))));

    runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();

    // The stub never listens on its port, so the probe is a soft failure.
    let report = runner.health_check("api").await.unwrap();
    assert!(report.checks.process_running);
    assert!(!report.checks.port_accessible);
    assert_eq!(report.status, HealthStatus::Degraded);

    runner.stop("api").await.unwrap();

    let report = runner.health_check("api").await.unwrap();
    assert!(!report.checks.process_running);
    assert_eq!(report.status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_remove_requires_stopped() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), LONG_RUNNING_STUB);
    let runner = DevRunner::open(test_config(dir.path(), &stub, (18410, 18420))).unwrap();

    runner
        .ensure_running("api", dir.path(), ServerMode::Dev)
        .await
        .unwrap();
    assert!(matches!(
        runner.remove("api").await,
        Err(Error::InvalidTransition { .. })
    ));

    runner.stop("api").await.unwrap();
    runner.remove("api").await.unwrap();
    assert!(matches!(
        runner.server_info("api"),
        Err(Error::ServerNotFound(_))
    ));
}
