//! The control plane's Unix-socket RPC surface: line-delimited JSON
//! requests answered with line-delimited JSON responses, for local CLI
//! tooling that would rather not open a TCP port.
//!
//! One request per line, one response per line. A request is
//! `{"action": "status"}`, `{"action": "trigger", "remote": "..."}`,
//! `{"action": "ping"}`, `{"action": "health"}`, or `{"action": "config"}`;
//! unknown actions get a `TriggerResponse { accepted: false, .. }`-shaped
//! error reply so callers don't need two response schemas.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use holdfast_types::{StatusResponse, TriggerResponse, TriggerSource};

use crate::scheduler::Scheduler;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum RpcRequest {
    Status,
    Trigger { remote: Option<String> },
    /// Cheap liveness probe: does the listener thread answer at all.
    Ping,
    /// Liveness of the daemon as a whole, including the worker loop —
    /// distinct from `Ping`, which only proves the RPC listener itself
    /// is alive, not that the scheduler behind it is still running.
    Health,
    /// A redacted snapshot of the running config, for an operator to
    /// sanity-check what the daemon was started with.
    Config,
}

/// Bind a Unix socket at `socket_path` and serve RPC requests until the
/// process exits. Removes a stale socket file left over from a prior crash
/// before binding, matching the lock module's stale-state tolerance. The
/// socket is chmod'd to `0600` immediately after bind, since anyone who can
/// connect to it can trigger reconciliation runs.
pub fn serve(socket_path: &Path, scheduler: Arc<Scheduler>) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove stale rpc socket {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind rpc socket {}", socket_path.display()))?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on rpc socket {}", socket_path.display()))?;

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let scheduler = Arc::clone(&scheduler);
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &scheduler) {
                        warn!(error = %e, "rpc connection failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "failed to accept rpc connection"),
        }
    }
    Ok(())
}

fn handle_connection(stream: UnixStream, scheduler: &Arc<Scheduler>) -> Result<()> {
    let mut writer = stream.try_clone().context("failed to clone rpc stream")?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = line.context("failed to read rpc request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(RpcRequest::Status) => {
                let guard = scheduler.state.lock().unwrap();
                serde_json::to_string(&StatusResponse {
                    state: guard.daemon_state,
                    current_run: guard.current_run.clone(),
                    recent_runs: guard.history.iter().cloned().collect(),
                })
            }
            Ok(RpcRequest::Trigger { remote }) => {
                let result = scheduler.trigger(TriggerSource::Manual { operator: remote });
                serde_json::to_string(&TriggerResponse {
                    accepted: result.is_ok(),
                    run_id: None,
                    reason: result.err().map(|e| e.to_string()),
                })
            }
            Ok(RpcRequest::Ping) => serde_json::to_string(&TriggerResponse { accepted: true, run_id: None, reason: Some("pong".to_string()) }),
            Ok(RpcRequest::Health) => {
                let guard = scheduler.state.lock().unwrap();
                let healthy = guard.daemon_state != holdfast_types::DaemonState::Stopped;
                serde_json::to_string(&TriggerResponse {
                    accepted: healthy,
                    run_id: None,
                    reason: Some(format!("{:?}", guard.daemon_state)),
                })
            }
            Ok(RpcRequest::Config) => serde_json::to_string(&scheduler.config_summary),
            Err(e) => serde_json::to_string(&TriggerResponse {
                accepted: false,
                run_id: None,
                reason: Some(format!("malformed rpc request: {e}")),
            }),
        }
        .unwrap_or_else(|_| "{}".to_string());

        writeln!(writer, "{response}").context("failed to write rpc response")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn test_config() -> crate::config::HoldfastConfig {
        toml::from_str("repo_remote = \"git@example.com:org/repo.git\"\n").expect("parse config")
    }

    #[test]
    fn status_request_returns_idle_state() {
        let td = tempdir().expect("tempdir");
        let socket_path = td.path().join("holdfast.sock");
        let root = td.path().to_path_buf();

        let scheduler = Arc::new(Scheduler::spawn(
            test_config(),
            move || crate::pipeline::RunContext {
                workdir: root.join("work"),
                state_dir: root.join("state"),
                deployed_dir: root.join("deploy"),
                identity: None,
                cancel: Arc::new(AtomicBool::new(false)),
                force: false,
            },
            || "run-test".to_string(),
        ));

        let socket_for_server = socket_path.clone();
        let server_scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || {
            let _ = serve(&socket_for_server, server_scheduler);
        });

        // Give the listener a moment to bind.
        let mut attempts = 0;
        let mut stream = loop {
            match UnixStream::connect(&socket_path) {
                Ok(s) => break s,
                Err(_) if attempts < 100 => {
                    attempts += 1;
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => panic!("failed to connect to rpc socket: {e}"),
            }
        };

        writeln!(stream, "{{\"action\":\"status\"}}").expect("write request");
        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        reader.read_line(&mut response).expect("read response");
        assert!(response.contains("\"state\""));

        #[cfg(unix)]
        {
            let mode = std::fs::metadata(&socket_path).expect("socket metadata").permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn ping_health_and_config_requests_get_answered() {
        let td = tempdir().expect("tempdir");
        let socket_path = td.path().join("holdfast.sock");
        let root = td.path().to_path_buf();

        let scheduler = Arc::new(Scheduler::spawn(
            test_config(),
            move || crate::pipeline::RunContext {
                workdir: root.join("work"),
                state_dir: root.join("state"),
                deployed_dir: root.join("deploy"),
                identity: None,
                cancel: Arc::new(AtomicBool::new(false)),
                force: false,
            },
            || "run-test".to_string(),
        ));

        let socket_for_server = socket_path.clone();
        let server_scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || {
            let _ = serve(&socket_for_server, server_scheduler);
        });

        let mut attempts = 0;
        let mut stream = loop {
            match UnixStream::connect(&socket_path) {
                Ok(s) => break s,
                Err(_) if attempts < 100 => {
                    attempts += 1;
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => panic!("failed to connect to rpc socket: {e}"),
            }
        };

        writeln!(stream, "{{\"action\":\"ping\"}}").expect("write ping");
        writeln!(stream, "{{\"action\":\"health\"}}").expect("write health");
        writeln!(stream, "{{\"action\":\"config\"}}").expect("write config");

        let mut reader = BufReader::new(stream);
        let mut ping = String::new();
        reader.read_line(&mut ping).expect("read ping response");
        assert!(ping.contains("pong"));

        let mut health = String::new();
        reader.read_line(&mut health).expect("read health response");
        assert!(health.contains("\"accepted\":true"));

        let mut config = String::new();
        reader.read_line(&mut config).expect("read config response");
        assert!(config.contains("example.com"));
    }
}
