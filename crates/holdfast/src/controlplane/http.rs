//! The control-plane HTTP listener: `/status`, `/health`, `/ready`,
//! `/trigger`, `/metrics`, and per-forge `/webhook/<forge>` routes.
//!
//! Grounded on the `tiny_http::Server::http` + `server.recv()` loop the
//! teacher's test harness uses to fake a registry; here it's the real
//! thing, run on its own thread for the life of the daemon.

use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{info, warn};

use holdfast_types::{StatusResponse, TriggerResponse, TriggerSource};

use super::signature::{SIGNATURE_HEADER, verify, verify_for_forge};
use crate::config::ControlPlaneConfig;
use crate::scheduler::Scheduler;

const MAX_BODY_BYTES: usize = 1 << 20;

const KNOWN_FORGES: &[&str] = &["generic", "github", "gitlab", "gitea", "bitbucket"];

/// Run the control-plane listener until the server is dropped. Call this
/// on its own thread; it blocks on `server.recv()`.
pub fn serve(bind: &str, control_plane: &ControlPlaneConfig, scheduler: Arc<Scheduler>) -> Result<()> {
    let server = Server::http(bind).map_err(|e| anyhow::anyhow!("failed to bind control-plane listener on {bind}: {e}"))?;
    info!(bind, "control-plane listener started");

    for mut request in server.incoming_requests() {
        let method = request.method().clone();
        let url = request.url().to_string();

        let outcome = match (method, url.as_str()) {
            (Method::Get, "/status") => handle_status(&scheduler),
            (Method::Get, "/health") => Response::from_string("ok").with_status_code(StatusCode(200)),
            (Method::Get, "/ready") => handle_ready(&scheduler),
            (Method::Post, "/trigger") => {
                handle_trigger(&mut request, resolve_secret(control_plane, "generic"), &scheduler)
            }
            (Method::Get, "/metrics") => handle_metrics(&scheduler),
            (Method::Post, path) if path.starts_with("/webhook/") => {
                let forge = path.trim_start_matches("/webhook/");
                handle_webhook(&mut request, forge, control_plane, &scheduler)
            }
            _ => Response::from_string("not found").with_status_code(StatusCode(404)),
        };

        if let Err(e) = request.respond(outcome) {
            warn!(error = %e, "failed to write control-plane response");
        }
    }

    Ok(())
}

/// Resolve the secret configured for `forge`: its own entry, falling back
/// to `webhook_secrets.generic`, falling back to the deprecated bare
/// `webhook_secret` field for single-forge setups predating per-forge
/// secrets.
fn resolve_secret<'a>(control_plane: &'a ControlPlaneConfig, forge: &str) -> Option<&'a str> {
    let per_forge = match forge {
        "github" => control_plane.webhook_secrets.github.as_deref(),
        "gitlab" => control_plane.webhook_secrets.gitlab.as_deref(),
        "gitea" => control_plane.webhook_secrets.gitea.as_deref(),
        "bitbucket" => control_plane.webhook_secrets.bitbucket.as_deref(),
        _ => None,
    };
    per_forge
        .or(control_plane.webhook_secrets.generic.as_deref())
        .or(control_plane.webhook_secret.as_deref())
}

fn json_response(status: u16, body: &impl serde::Serialize) -> Response<std::io::Cursor<Vec<u8>>> {
    let text = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::from_string(text)
        .with_status_code(StatusCode(status))
        .with_header(Header::from_bytes("Content-Type", "application/json").expect("static header"))
}

fn handle_status(scheduler: &Arc<Scheduler>) -> Response<std::io::Cursor<Vec<u8>>> {
    let guard = scheduler.state.lock().unwrap();
    let body = StatusResponse {
        state: guard.daemon_state,
        current_run: guard.current_run.clone(),
        recent_runs: guard.history.iter().cloned().collect(),
    };
    json_response(200, &body)
}

/// Readiness goes beyond liveness: a daemon that is up but has never
/// reached an idle state (still starting, or its worker loop has died)
/// isn't ready to receive triggers yet.
fn handle_ready(scheduler: &Arc<Scheduler>) -> Response<std::io::Cursor<Vec<u8>>> {
    let guard = scheduler.state.lock().unwrap();
    match guard.daemon_state {
        holdfast_types::DaemonState::Draining | holdfast_types::DaemonState::Stopped => {
            Response::from_string("not ready").with_status_code(StatusCode(503))
        }
        _ => Response::from_string("ready").with_status_code(StatusCode(200)),
    }
}

fn handle_metrics(scheduler: &Arc<Scheduler>) -> Response<std::io::Cursor<Vec<u8>>> {
    let guard = scheduler.state.lock().unwrap();
    let succeeded = guard
        .history
        .iter()
        .filter(|r| r.outcome == Some(holdfast_types::RunOutcome::Succeeded))
        .count();
    let failed = guard
        .history
        .iter()
        .filter(|r| r.outcome == Some(holdfast_types::RunOutcome::Failed))
        .count();
    let body = format!(
        "holdfast_runs_succeeded {succeeded}\nholdfast_runs_failed {failed}\nholdfast_runs_history {}\n",
        guard.history.len()
    );
    Response::from_string(body)
        .with_status_code(StatusCode(200))
        .with_header(Header::from_bytes("Content-Type", "text/plain").expect("static header"))
}

fn handle_trigger(
    request: &mut tiny_http::Request,
    webhook_secret: Option<&str>,
    scheduler: &Arc<Scheduler>,
) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut body = Vec::new();
    if request
        .as_reader()
        .take(MAX_BODY_BYTES as u64 + 1)
        .read_to_end(&mut body)
        .is_err()
        || body.len() > MAX_BODY_BYTES
    {
        return json_response(
            400,
            &TriggerResponse { accepted: false, run_id: None, reason: Some("body too large or unreadable".to_string()) },
        );
    }

    if let Some(secret) = webhook_secret {
        let signature = request
            .headers()
            .iter()
            .find(|h| h.field.as_str().eq_ignore_ascii_case(SIGNATURE_HEADER))
            .map(|h| h.value.as_str().to_string());

        let valid = signature.as_deref().is_some_and(|sig| verify(secret, &body, sig));
        if !valid {
            return json_response(
                401,
                &TriggerResponse { accepted: false, run_id: None, reason: Some("invalid or missing signature".to_string()) },
            );
        }
    }

    let remote = String::from_utf8_lossy(&body).to_string();
    match scheduler.trigger(TriggerSource::Webhook { remote }) {
        Ok(()) => json_response(202, &TriggerResponse { accepted: true, run_id: None, reason: None }),
        Err(e) => json_response(
            500,
            &TriggerResponse { accepted: false, run_id: None, reason: Some(e.to_string()) },
        ),
    }
}

/// `POST /webhook/<forge>`: a forge-specific sibling of `/trigger` that
/// verifies against the signature scheme `forge` actually uses (see
/// [`verify_for_forge`]) rather than assuming GitHub's HMAC-SHA256 scheme.
/// An unrecognized forge segment is accepted under the `generic` bare-hex
/// scheme, so a self-hosted or unlisted forge still works with its own
/// configured secret.
fn handle_webhook(
    request: &mut tiny_http::Request,
    forge: &str,
    control_plane: &ControlPlaneConfig,
    scheduler: &Arc<Scheduler>,
) -> Response<std::io::Cursor<Vec<u8>>> {
    let forge = if KNOWN_FORGES.contains(&forge) { forge } else { "generic" };

    let mut body = Vec::new();
    if request
        .as_reader()
        .take(MAX_BODY_BYTES as u64 + 1)
        .read_to_end(&mut body)
        .is_err()
        || body.len() > MAX_BODY_BYTES
    {
        return json_response(
            400,
            &TriggerResponse { accepted: false, run_id: None, reason: Some("body too large or unreadable".to_string()) },
        );
    }

    if let Some(secret) = resolve_secret(control_plane, forge) {
        let header_value = request
            .headers()
            .iter()
            .find(|h| h.field.as_str().eq_ignore_ascii_case(SIGNATURE_HEADER))
            .map(|h| h.value.as_str().to_string());

        let valid = header_value.as_deref().is_some_and(|v| verify_for_forge(forge, secret, &body, v));
        if !valid {
            return json_response(
                401,
                &TriggerResponse { accepted: false, run_id: None, reason: Some("invalid or missing signature".to_string()) },
            );
        }
    }

    match scheduler.trigger(TriggerSource::Webhook { remote: forge.to_string() }) {
        Ok(()) => json_response(202, &TriggerResponse { accepted: true, run_id: None, reason: None }),
        Err(e) => json_response(
            500,
            &TriggerResponse { accepted: false, run_id: None, reason: Some(e.to_string()) },
        ),
    }
}

