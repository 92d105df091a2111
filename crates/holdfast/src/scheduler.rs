//! The daemon's concurrency model: a single reconciliation run in flight at
//! a time, with poll ticks, webhook/manual triggers, and duplicate-request
//! coalescing.
//!
//! Grounded on `engine_parallel.rs`'s `std::thread` + `Arc<Mutex<_>>` idiom,
//! but driven by an `mpsc` channel rather than a wave of worker threads: the
//! scheduler owns a single worker thread that runs one [`pipeline::run`] at
//! a time, and every trigger source posts a [`Command`] onto the channel
//! instead of spawning its own thread. This gives the at-most-one-run and
//! queue-coalescing invariants for free, since the worker thread is the
//! only place a run is ever started.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use chrono::Utc;
use holdfast_types::{Alert, AlertSeverity, ConfigSummary, DaemonState, RunOutcome, RunRecord, TriggerSource};

use crate::alert::{self, AlertProvider, EmailProvider, SmsProvider, WebhookProvider};
use crate::config::HoldfastConfig;
use crate::pipeline::{self, PipelineObserver, RunContext, TracingObserver};

/// A request posted onto the scheduler's channel.
pub enum Command {
    Trigger(TriggerSource),
    Shutdown,
}

/// Shared state the control plane reads to answer `/status`, guarded by a
/// mutex since it's written from the worker thread and read from the HTTP
/// listener thread.
pub struct SharedState {
    pub daemon_state: DaemonState,
    pub current_run: Option<RunRecord>,
    pub history: VecDeque<RunRecord>,
    pub history_limit: usize,
}

impl SharedState {
    fn new(history_limit: usize) -> Self {
        Self { daemon_state: DaemonState::Idle, current_run: None, history: VecDeque::new(), history_limit }
    }

    fn push_completed(&mut self, record: RunRecord) {
        self.current_run = None;
        self.history.push_front(record);
        while self.history.len() > self.history_limit {
            self.history.pop_back();
        }
    }
}

/// Owns the worker thread and the channel every trigger source posts to.
pub struct Scheduler {
    sender: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    pub state: Arc<Mutex<SharedState>>,
    cancel: Arc<AtomicBool>,
    /// Paired with `cancel` so a sleeping poll-ticker thread can be woken
    /// immediately on shutdown instead of waiting out its full interval.
    pub shutdown_signal: Arc<(Mutex<bool>, Condvar)>,
    /// Snapshotted at spawn time, since `config` itself is moved into the
    /// worker thread's closure.
    pub config_summary: ConfigSummary,
}

impl Scheduler {
    /// Spawn the worker thread. `run_id_factory` lets tests and the CLI
    /// supply deterministic run ids instead of reaching for a clock.
    pub fn spawn(
        config: HoldfastConfig,
        ctx_factory: impl Fn() -> RunContext + Send + 'static,
        run_id_factory: impl Fn() -> String + Send + 'static,
    ) -> Self {
        let (sender, receiver) = channel();
        let state = Arc::new(Mutex::new(SharedState::new(config.run_history)));
        let cancel = Arc::new(AtomicBool::new(false));
        let shutdown_signal = Arc::new((Mutex::new(false), Condvar::new()));
        let config_summary = ConfigSummary {
            repo_remote: config.repo_remote.clone(),
            manifest_root: config.manifest_root.display().to_string(),
            poll_interval_secs: config.poll_interval.as_secs(),
            lock_timeout_secs: config.lock_timeout.as_secs(),
            snapshot_retention: config.snapshot_retention,
            deploy_target: config.deploy_target.clone(),
            tunnel_provider: config.tunnel_provider.as_str().to_string(),
            signal_container: config.signal_container.clone(),
            secret_path_count: config.secret_paths.len(),
        };

        let worker_state = Arc::clone(&state);
        let worker_cancel = Arc::clone(&cancel);
        let worker = std::thread::spawn(move || {
            worker_loop(receiver, config, ctx_factory, run_id_factory, worker_state, worker_cancel);
        });

        Self { sender, worker: Some(worker), state, cancel, shutdown_signal, config_summary }
    }

    /// Post a trigger. Coalescing happens inside `worker_loop`: a queued
    /// poll tick is dropped if one is already pending, so a slow run never
    /// builds up a backlog of identical poll triggers.
    pub fn trigger(&self, source: TriggerSource) -> Result<()> {
        self.sender.send(Command::Trigger(source)).map_err(|e| anyhow::anyhow!("scheduler channel closed: {e}"))
    }

    /// Request cancellation of whatever run is currently in flight.
    pub fn cancel_current(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn shutdown(mut self) {
        let _ = self.sender.send(Command::Shutdown);
        {
            let (lock, cvar) = &*self.shutdown_signal;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    receiver: Receiver<Command>,
    config: HoldfastConfig,
    ctx_factory: impl Fn() -> RunContext,
    run_id_factory: impl Fn() -> String,
    state: Arc<Mutex<SharedState>>,
    cancel: Arc<AtomicBool>,
) {
    // At most one trigger is ever queued behind an in-flight run: the most
    // recent source wins, regardless of how many arrived while busy.
    let mut pending: Option<TriggerSource> = None;
    let providers: Vec<Box<dyn AlertProvider>> = vec![
        Box::new(WebhookProvider::new(&config.alert)),
        Box::new(EmailProvider::new(&config.alert)),
        Box::new(SmsProvider::new(&config.alert)),
    ];

    loop {
        let command = if pending.is_none() {
            match receiver.recv() {
                Ok(c) => c,
                Err(_) => return,
            }
        } else {
            match receiver.recv_timeout(Duration::from_millis(10)) {
                Ok(c) => c,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Command::Trigger(pending.take().unwrap()),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            }
        };

        match command {
            Command::Shutdown => return,
            Command::Trigger(source) => {
                let currently_running = state.lock().unwrap().daemon_state == DaemonState::Running;

                if currently_running {
                    pending = Some(source);
                    continue;
                }

                run_one(&config, &ctx_factory, &run_id_factory, &state, &cancel, &providers, source);
            }
        }
    }
}

fn run_one(
    config: &HoldfastConfig,
    ctx_factory: &impl Fn() -> RunContext,
    run_id_factory: &impl Fn() -> String,
    state: &Arc<Mutex<SharedState>>,
    cancel: &Arc<AtomicBool>,
    providers: &[Box<dyn AlertProvider>],
    source: TriggerSource,
) {
    let run_id = run_id_factory();
    {
        let mut guard = state.lock().unwrap();
        guard.daemon_state = DaemonState::Running;
    }

    info!(run_id, "run starting");
    // Reset before each run and wire in the scheduler's shared cancel flag,
    // so `cancel_current()` actually reaches the run it's meant to stop
    // instead of the throwaway flag `ctx_factory` would otherwise create.
    cancel.store(false, Ordering::SeqCst);
    let mut ctx = ctx_factory();
    ctx.cancel = Arc::clone(cancel);
    let mut observer = TracingObserver;
    let record = pipeline::run(&run_id, source, config, &ctx, &mut observer);

    match record.outcome {
        Some(RunOutcome::Failed) => {
            warn!(run_id, error = ?record.error, "run failed");
            alert::fan_out(
                providers,
                &Alert {
                    severity: AlertSeverity::Error,
                    title: format!("run {run_id} failed"),
                    body: record.error.clone().unwrap_or_else(|| "no error detail recorded".to_string()),
                    run_id: Some(run_id.clone()),
                    emitted_at: Utc::now(),
                },
            );
        }
        Some(RunOutcome::Cancelled) => {
            info!(run_id, "run cancelled");
            alert::fan_out(
                providers,
                &Alert {
                    severity: AlertSeverity::Warning,
                    title: format!("run {run_id} cancelled"),
                    body: "run was cancelled before completion".to_string(),
                    run_id: Some(run_id.clone()),
                    emitted_at: Utc::now(),
                },
            );
        }
        Some(outcome) => info!(run_id, ?outcome, "run completed"),
        None => {}
    }

    let mut guard = state.lock().unwrap();
    guard.daemon_state = DaemonState::Idle;
    guard.push_completed(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn test_config() -> HoldfastConfig {
        toml::from_str("repo_remote = \"git@example.com:org/repo.git\"\nrun_history = 3\n").expect("parse config")
    }

    #[test]
    fn scheduler_runs_a_triggered_pipeline_and_records_history() {
        let td = tempdir().expect("tempdir");
        let root = td.path().to_path_buf();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_for_ids = Arc::clone(&counter);

        let scheduler = Scheduler::spawn(
            test_config(),
            move || RunContext {
                workdir: root.join("work"),
                state_dir: root.join("state"),
                deployed_dir: root.join("deploy"),
                identity: None,
                cancel: Arc::new(AtomicBool::new(false)),
                force: false,
            },
            move || {
                let n = counter_for_ids.fetch_add(1, Ordering::SeqCst);
                format!("run-{n}")
            },
        );

        scheduler.trigger(TriggerSource::Manual { operator: None }).expect("trigger");

        let mut attempts = 0;
        loop {
            {
                let guard = scheduler.state.lock().unwrap();
                if !guard.history.is_empty() {
                    assert_eq!(guard.history.front().unwrap().run_id, "run-0");
                    break;
                }
            }
            attempts += 1;
            assert!(attempts < 200, "scheduler never recorded a completed run");
            std::thread::sleep(Duration::from_millis(10));
        }

        scheduler.shutdown();
    }

    #[test]
    fn only_the_most_recent_trigger_survives_coalescing() {
        let mut pending: Option<TriggerSource> = None;
        for source in [
            TriggerSource::Poll,
            TriggerSource::Manual { operator: Some("alice".to_string()) },
            TriggerSource::Webhook { remote: "github".to_string() },
            TriggerSource::Poll,
            TriggerSource::Manual { operator: Some("bob".to_string()) },
        ] {
            pending = Some(source);
        }
        assert_eq!(pending, Some(TriggerSource::Manual { operator: Some("bob".to_string()) }));
    }
}
