//! The nine-stage reconciliation pipeline.
//!
//! Grounded on `engine.rs`'s stage-driver structure, but generalized from a
//! closure chain into an explicit state machine over [`PipelineStage`] (per
//! the corresponding REDESIGN FLAG): each stage is a function call, its
//! outcome is a [`StageRecord`], and a cancellation flag or a hard failure
//! can stop the driver loop between any two stages. [`PipelineObserver`]
//! plays the role the teacher's `Reporter` trait played in
//! `engine_parallel.rs`, reporting progress one stage at a time instead of
//! one package at a time.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use holdfast_types::{LockScope, PipelineStage, RenderOutput, RunOutcome, RunRecord, StageRecord, TriggerSource};

use crate::config::HoldfastConfig;
use crate::error::HoldfastError;
use crate::lock::LockFile;
use crate::process::run_command;
use crate::secrets::Identity;
use crate::{git, manifest, snapshot, template};

/// Reports pipeline progress one stage at a time. The daemon's default
/// implementation forwards to `tracing`; the CLI's `run` command prints a
/// line per stage for a human watching a terminal.
pub trait PipelineObserver {
    fn stage_started(&mut self, stage: PipelineStage);
    fn stage_finished(&mut self, stage: PipelineStage, outcome: RunOutcome, detail: Option<&str>);
    fn run_finished(&mut self, outcome: RunOutcome);
}

/// A [`PipelineObserver`] that only emits `tracing` events, used by the
/// daemon where nothing is watching a terminal.
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn stage_started(&mut self, stage: PipelineStage) {
        info!(?stage, "stage started");
    }

    fn stage_finished(&mut self, stage: PipelineStage, outcome: RunOutcome, detail: Option<&str>) {
        match outcome {
            RunOutcome::Succeeded | RunOutcome::NoChange => info!(?stage, ?outcome, detail, "stage finished"),
            RunOutcome::Failed | RunOutcome::Cancelled => warn!(?stage, ?outcome, detail, "stage finished"),
        }
    }

    fn run_finished(&mut self, outcome: RunOutcome) {
        info!(?outcome, "run finished");
    }
}

/// Everything a run needs that isn't part of the config: where the repo
/// lands, where rendered output is deployed, and the cancellation flag the
/// scheduler hands every in-flight run.
pub struct RunContext {
    pub workdir: PathBuf,
    pub state_dir: PathBuf,
    pub deployed_dir: PathBuf,
    pub identity: Option<Identity>,
    pub cancel: Arc<AtomicBool>,
    /// Bypass RenderTemplates' no-change-since-last-apply short circuit and
    /// apply even when the rendered content hash is unchanged.
    pub force: bool,
}

/// Drive one full reconciliation run through every stage in
/// [`PipelineStage::ORDER`], recording a [`StageRecord`] per stage and
/// stopping at the first failure or cancellation.
pub fn run(
    run_id: &str,
    trigger: TriggerSource,
    config: &HoldfastConfig,
    ctx: &RunContext,
    observer: &mut dyn PipelineObserver,
) -> RunRecord {
    let started_at = Utc::now();
    let mut record = RunRecord {
        run_id: run_id.to_string(),
        trigger,
        started_at,
        finished_at: None,
        outcome: None,
        stages: Vec::new(),
        error: None,
    };

    let mut stage_vars: StageOutputs = StageOutputs::default();

    for stage in PipelineStage::ORDER {
        if ctx.cancel.load(std::sync::atomic::Ordering::SeqCst) {
            record.stages.push(cancelled_record(stage));
            observer.stage_finished(stage, RunOutcome::Cancelled, None);
            record.outcome = Some(RunOutcome::Cancelled);
            break;
        }

        observer.stage_started(stage);
        let stage_started_at = Utc::now();
        let result = run_stage(stage, config, ctx, &mut stage_vars);

        let (outcome, detail, error) = match result {
            Ok(StageOutcome::Advance(detail)) => (RunOutcome::Succeeded, detail, None),
            Ok(StageOutcome::NoChange) => (RunOutcome::NoChange, Some("no change detected".to_string()), None),
            Err(e) => (RunOutcome::Failed, None, Some(e.to_string())),
        };

        observer.stage_finished(stage, outcome, detail.as_deref());
        record.stages.push(StageRecord {
            stage,
            started_at: stage_started_at,
            finished_at: Some(Utc::now()),
            outcome: Some(outcome),
            detail,
        });

        if outcome == RunOutcome::Failed {
            record.error = error;
            record.outcome = Some(RunOutcome::Failed);
            break;
        }
        if outcome == RunOutcome::NoChange {
            record.outcome = Some(RunOutcome::NoChange);
            break;
        }
    }

    if record.outcome.is_none() {
        record.outcome = Some(RunOutcome::Succeeded);
    }

    // The ReleaseLock stage already released it on the happy path; this is
    // a no-op there and the only release on any other exit (failure,
    // cancellation, or NoChange breaking the loop early).
    if let Err(e) = release_lock(&mut stage_vars) {
        warn!(run_id, error = %e, "failed to release reconcile lock after run exit");
    }

    record.finished_at = Some(Utc::now());
    observer.run_finished(record.outcome.unwrap());
    record
}

enum StageOutcome {
    Advance(Option<String>),
    NoChange,
}

/// Scratch state threaded between stages within a single run, not
/// persisted: the resolved manifest, the rendered output, the fetched
/// commit SHA.
#[derive(Default)]
struct StageOutputs {
    commit: Option<String>,
    resolved: Option<manifest::ResolvedManifest>,
    render: Option<RenderOutput>,
    lock: Option<LockFile>,
    /// Decrypted secret key/value pairs, merged as template context by
    /// Render. Never persisted.
    secrets: BTreeMap<String, String>,
}

fn run_stage(
    stage: PipelineStage,
    config: &HoldfastConfig,
    ctx: &RunContext,
    out: &mut StageOutputs,
) -> Result<StageOutcome> {
    match stage {
        PipelineStage::AcquireLock => {
            let lock = LockFile::acquire_with_timeout(&ctx.state_dir, LockScope::Reconcile, config.lock_timeout)
                .map_err(|_| HoldfastError::LockBusy("reconcile lock busy".to_string()))?;
            out.lock = Some(lock);
            Ok(StageOutcome::Advance(None))
        }
        PipelineStage::FetchRepo => {
            let commit = git::fetch_repo(&config.repo_remote, &ctx.workdir, config.pinned_ref.as_deref())
                .map_err(|e| HoldfastError::Transport(e.to_string()))?;
            out.commit = Some(commit.clone());
            Ok(StageOutcome::Advance(Some(commit)))
        }
        PipelineStage::DecryptSecrets => {
            if config.secret_paths.is_empty() {
                return Ok(StageOutcome::Advance(Some("no secret paths configured, skipping".to_string())));
            }
            let Some(identity) = &ctx.identity else {
                return Err(HoldfastError::Secret(format!(
                    "{} configured secret path(s) but no decryption identity was provided",
                    config.secret_paths.len()
                ))
                .into());
            };
            let passphrase =
                identity.resolve().map_err(|e| HoldfastError::Secret(e.to_string()))?;

            for relative in &config.secret_paths {
                let path = ctx.workdir.join(relative);
                let encoded = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read secret document {}", path.display()))?;
                let plaintext = crate::secrets::decrypt(&encoded, &passphrase)
                    .map_err(|e| HoldfastError::Secret(format!("{}: {e}", path.display())))?;
                let mapping: BTreeMap<String, String> = serde_yaml::from_slice(&plaintext)
                    .with_context(|| format!("secret document {} did not decode to a string mapping", path.display()))?;
                out.secrets.extend(mapping);
            }
            Ok(StageOutcome::Advance(Some(format!("{} secret document(s) decrypted", config.secret_paths.len()))))
        }
        PipelineStage::RenderTemplates => {
            let stack_path = ctx.workdir.join(&config.manifest_root).join("stack.yaml");
            let manifest_dir = ctx.workdir.join(&config.manifest_root);
            let resolved = manifest::resolve(&stack_path, &manifest_dir)
                .map_err(|e| HoldfastError::Resolve(e.to_string()))?;

            let engine = template::Engine::new(&ctx.workdir);
            let rendered = engine
                .render(&resolved.services, &resolved.provisions, &out.secrets)
                .map_err(|e| HoldfastError::Template(e.to_string()))?;
            let hash = rendered.content_hash.clone();

            out.resolved = Some(resolved);
            out.render = Some(rendered);

            if !ctx.force {
                let last_hash_path = ctx.state_dir.join("last_content_hash");
                let previous = std::fs::read_to_string(&last_hash_path).ok();
                if previous.as_deref() == Some(hash.as_str()) {
                    return Ok(StageOutcome::NoChange);
                }
            }
            Ok(StageOutcome::Advance(Some(hash)))
        }
        PipelineStage::Backup => {
            let backup_dir = ctx.workdir.join(&config.backup_dir);
            let snapshot = snapshot::create(&backup_dir, &ctx.deployed_dir, Some(&ctx.state_dir.display().to_string()))
                .context("Backup stage failed to snapshot the deploy target")?;
            let removed = snapshot::prune(&backup_dir, config.snapshot_retention)
                .context("Backup stage failed to prune old snapshots")?;
            Ok(StageOutcome::Advance(Some(format!(
                "snapshot {} created, {removed} old snapshot(s) pruned",
                snapshot.snapshot_id
            ))))
        }
        PipelineStage::Deploy => {
            let rendered = out.render.as_ref().context("Deploy stage ran before RenderTemplates")?;
            let staging_dir = ctx.workdir.join(&config.staging_dir);
            std::fs::create_dir_all(&staging_dir)
                .with_context(|| format!("failed to create staging dir {}", staging_dir.display()))?;

            let compose_text = serde_yaml::to_string(&rendered.compose).context("Deploy stage failed to serialize compose")?;
            std::fs::write(staging_dir.join("compose.yaml"), compose_text)
                .context("Deploy stage failed to write staged compose.yaml")?;
            let proxy_text = serde_yaml::to_string(&rendered.proxy).context("Deploy stage failed to serialize proxy")?;
            std::fs::write(staging_dir.join("proxy.yaml"), proxy_text)
                .context("Deploy stage failed to write staged proxy.yaml")?;

            match &config.deploy_target {
                Some(remote) => {
                    let dest = format!("{remote}:{}", config.appdata_dir.display());
                    let output = run_command(
                        "rsync",
                        &["-az", "--delete", &format!("{}/", staging_dir.display()), &dest],
                        &ctx.workdir,
                        Some(Duration::from_secs(120)),
                        Some(ctx.cancel.clone()),
                    )
                    .context("Deploy stage failed to invoke rsync")?;
                    if output.cancelled {
                        return Err(HoldfastError::Cancelled.into());
                    }
                    if !output.success() {
                        return Err(HoldfastError::ExecFailure(format!(
                            "rsync to {remote} exited with status {}: {}",
                            output.exit_code, output.stderr
                        ))
                        .into());
                    }
                    Ok(StageOutcome::Advance(Some(format!("mirrored staging to {remote}"))))
                }
                None => {
                    std::fs::create_dir_all(&ctx.deployed_dir)
                        .context("Deploy stage failed to prepare local deploy dir")?;
                    for entry in std::fs::read_dir(&staging_dir)
                        .with_context(|| format!("failed to read staging dir {}", staging_dir.display()))?
                    {
                        let entry = entry?;
                        let dest = ctx.deployed_dir.join(entry.file_name());
                        std::fs::copy(entry.path(), &dest)
                            .with_context(|| format!("failed to mirror {} to {}", entry.path().display(), dest.display()))?;
                    }
                    Ok(StageOutcome::Advance(Some("mirrored staging to local deploy dir".to_string())))
                }
            }
        }
        PipelineStage::Compose => {
            let compose_timeout = Duration::from_secs(120);
            let output = run_command(
                "docker",
                &["compose", "-f", "compose.yaml", "up", "-d", "--remove-orphans"],
                &ctx.deployed_dir,
                Some(compose_timeout),
                Some(ctx.cancel.clone()),
            )
            .context("Compose stage failed to invoke the compose tool")?;
            if output.cancelled {
                return Err(HoldfastError::Cancelled.into());
            }
            if output.timed_out {
                return Err(HoldfastError::Timeout(compose_timeout).into());
            }
            if !output.success() {
                return Err(HoldfastError::ExecFailure(format!(
                    "compose tool exited with status {}: {}",
                    output.exit_code, output.stderr
                ))
                .into());
            }
            if let Some(rendered) = &out.render {
                let last_hash_path = ctx.state_dir.join("last_content_hash");
                std::fs::write(&last_hash_path, &rendered.content_hash)
                    .context("Compose stage failed to persist content hash")?;
            }
            Ok(StageOutcome::Advance(None))
        }
        PipelineStage::Signal => {
            let Some(container) = &config.signal_container else {
                return Ok(StageOutcome::Advance(Some("no signal_container configured, skipping".to_string())));
            };
            let signal_timeout = Duration::from_secs(30);
            let output = run_command(
                "docker",
                &["kill", "--signal", "HUP", container],
                &ctx.deployed_dir,
                Some(signal_timeout),
                Some(ctx.cancel.clone()),
            )
            .context("Signal stage failed to reload-signal the target container")?;
            if output.cancelled {
                return Err(HoldfastError::Cancelled.into());
            }
            if !output.success() {
                return Err(HoldfastError::ExecFailure(format!(
                    "reload signal to {container} exited with status {}: {}",
                    output.exit_code, output.stderr
                ))
                .into());
            }
            Ok(StageOutcome::Advance(Some(format!("reload signal sent to {container}"))))
        }
        PipelineStage::ReleaseLock => {
            release_lock(out)?;
            Ok(StageOutcome::Advance(None))
        }
    }
}

/// Release the reconcile lock if one is held, consuming it from `out` so a
/// second call (the post-loop cleanup in [`run`]) is a no-op. Called both
/// by the `ReleaseLock` stage on the happy path and unconditionally after
/// the stage loop exits any other way, so a failure in `Backup`/`Deploy`/
/// `Compose`/`Signal` never leaves the lock held.
fn release_lock(out: &mut StageOutputs) -> Result<()> {
    if let Some(mut lock) = out.lock.take() {
        lock.release().context("failed to release reconcile lock")?;
    }
    Ok(())
}

fn cancelled_record(stage: PipelineStage) -> StageRecord {
    StageRecord {
        stage,
        started_at: Utc::now(),
        finished_at: Some(Utc::now()),
        outcome: Some(RunOutcome::Cancelled),
        detail: Some("run cancelled".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    struct NullObserver;
    impl PipelineObserver for NullObserver {
        fn stage_started(&mut self, _stage: PipelineStage) {}
        fn stage_finished(&mut self, _stage: PipelineStage, _outcome: RunOutcome, _detail: Option<&str>) {}
        fn run_finished(&mut self, _outcome: RunOutcome) {}
    }

    fn test_config() -> HoldfastConfig {
        toml::from_str("repo_remote = \"git@example.com:org/repo.git\"\n").expect("parse test config")
    }

    #[test]
    fn run_stops_at_first_failure() {
        let td = tempdir().expect("tempdir");
        let ctx = RunContext {
            workdir: td.path().join("work"),
            state_dir: td.path().join("state"),
            deployed_dir: td.path().join("deploy"),
            identity: None,
            cancel: Arc::new(AtomicBool::new(false)),
            force: false,
        };
        let mut observer = NullObserver;
        let record = run("run-1", TriggerSource::Manual { operator: None }, &test_config(), &ctx, &mut observer);

        assert_eq!(record.outcome, Some(RunOutcome::Failed));
        assert_eq!(record.stages.first().map(|s| s.stage), Some(PipelineStage::AcquireLock));
        assert_eq!(record.stages.last().map(|s| s.stage), Some(PipelineStage::FetchRepo));
        assert_eq!(record.stages.last().map(|s| s.outcome), Some(Some(RunOutcome::Failed)));
        // FetchRepo's failure must not leave the reconcile lock held.
        assert!(!LockFile::is_locked(&ctx.state_dir, LockScope::Reconcile).expect("is_locked"));
    }

    #[test]
    fn run_respects_pre_set_cancellation() {
        let td = tempdir().expect("tempdir");
        let ctx = RunContext {
            workdir: td.path().join("work"),
            state_dir: td.path().join("state"),
            deployed_dir: td.path().join("deploy"),
            identity: None,
            cancel: Arc::new(AtomicBool::new(true)),
            force: false,
        };
        let mut observer = NullObserver;
        let record = run("run-2", TriggerSource::Poll, &test_config(), &ctx, &mut observer);

        assert_eq!(record.outcome, Some(RunOutcome::Cancelled));
        assert_eq!(record.stages.len(), 1);
    }

    fn write_minimal_stack(workdir: &std::path::Path) {
        std::fs::create_dir_all(workdir).expect("mkdir workdir");
        std::fs::write(
            workdir.join("web.yaml"),
            "apiVersion: holdfast/v1\nkind: Service\nspec:\n  image: nginx:latest\n",
        )
        .expect("write service");
        std::fs::write(
            workdir.join("stack.yaml"),
            "apiVersion: holdfast/v1\nkind: Stack\nspec:\n  services: [web]\n",
        )
        .expect("write stack");
    }

    #[test]
    fn render_templates_short_circuits_on_unchanged_hash_unless_forced() {
        let td = tempdir().expect("tempdir");
        let workdir = td.path().join("work");
        write_minimal_stack(&workdir);

        let state_dir = td.path().join("state");
        std::fs::create_dir_all(&state_dir).expect("mkdir state");

        let ctx = RunContext {
            workdir: workdir.clone(),
            state_dir: state_dir.clone(),
            deployed_dir: td.path().join("deploy"),
            identity: None,
            cancel: Arc::new(AtomicBool::new(false)),
            force: false,
        };

        let mut out = StageOutputs::default();
        let outcome =
            run_stage(PipelineStage::RenderTemplates, &test_config(), &ctx, &mut out).expect("first render");
        let StageOutcome::Advance(Some(hash)) = outcome else { panic!("expected a content hash on first render") };
        std::fs::write(state_dir.join("last_content_hash"), &hash).expect("seed prior hash");

        let mut out = StageOutputs::default();
        let outcome =
            run_stage(PipelineStage::RenderTemplates, &test_config(), &ctx, &mut out).expect("second render");
        assert!(matches!(outcome, StageOutcome::NoChange));

        let forced_ctx = RunContext { force: true, ..ctx };
        let mut out = StageOutputs::default();
        let outcome = run_stage(PipelineStage::RenderTemplates, &test_config(), &forced_ctx, &mut out)
            .expect("forced render");
        assert!(matches!(outcome, StageOutcome::Advance(_)));
    }

    #[test]
    fn decrypt_stage_merges_decrypted_secrets() {
        let td = tempdir().expect("tempdir");
        let workdir = td.path().join("work");
        std::fs::create_dir_all(&workdir).expect("mkdir workdir");

        let plaintext = b"db_password: hunter2\n";
        let encoded = crate::secrets::encrypt(plaintext, "correct horse battery staple").expect("encrypt fixture");
        std::fs::write(workdir.join("secrets.enc"), encoded).expect("write secret fixture");

        let mut config: HoldfastConfig = toml::from_str(
            "repo_remote = \"git@example.com:org/repo.git\"\nsecret_paths = [\"secrets.enc\"]\n",
        )
        .expect("parse config");
        config.validate().expect("config valid");

        let key_file = td.path().join("passphrase");
        std::fs::write(&key_file, "correct horse battery staple").expect("write key file");

        let ctx = RunContext {
            workdir,
            state_dir: td.path().join("state"),
            deployed_dir: td.path().join("deploy"),
            identity: Some(crate::secrets::Identity::KeyFile(key_file)),
            cancel: Arc::new(AtomicBool::new(false)),
            force: false,
        };

        let mut out = StageOutputs::default();
        run_stage(PipelineStage::DecryptSecrets, &config, &ctx, &mut out).expect("decrypt stage");
        assert_eq!(out.secrets.get("db_password").map(String::as_str), Some("hunter2"));
    }

    #[test]
    fn decrypt_stage_fails_without_identity_when_secrets_are_configured() {
        let td = tempdir().expect("tempdir");
        let config: HoldfastConfig = toml::from_str(
            "repo_remote = \"git@example.com:org/repo.git\"\nsecret_paths = [\"secrets.enc\"]\n",
        )
        .expect("parse config");

        let ctx = RunContext {
            workdir: td.path().join("work"),
            state_dir: td.path().join("state"),
            deployed_dir: td.path().join("deploy"),
            identity: None,
            cancel: Arc::new(AtomicBool::new(false)),
            force: false,
        };

        let mut out = StageOutputs::default();
        assert!(run_stage(PipelineStage::DecryptSecrets, &config, &ctx, &mut out).is_err());
    }
}
