mod progress;

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use holdfast::config::{CliOverrides, HoldfastConfig};
use holdfast::error::HoldfastError;
use holdfast::pipeline::{self, PipelineObserver, RunContext};
use holdfast::secrets::Identity;
use holdfast::{controlplane, manifest, scheduler::Scheduler, template};
use holdfast_types::{RunOutcome, TriggerSource};

use progress::StageReporter;

#[derive(Parser, Debug)]
#[command(name = "holdfast", version)]
#[command(about = "A GitOps reconciliation daemon for home-lab hosts")]
struct Cli {
    /// Path to a `.holdfast.toml` config file. If omitted, walks upward
    /// from the current directory looking for one.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Suppress progress bars, emitting plain stderr lines instead.
    #[arg(long, global = true)]
    quiet: bool,

    /// Emit structured JSON log lines instead of the default human format,
    /// for daemon deployments that feed logs to an aggregator.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass and exit.
    Run {
        #[arg(long, default_value = ".holdfast/work")]
        workdir: PathBuf,
        #[arg(long, default_value = ".holdfast/state")]
        state_dir: PathBuf,
        #[arg(long, default_value = ".holdfast/deployed")]
        deployed_dir: PathBuf,
        /// Apply even if the rendered content hash matches the last applied one.
        #[arg(long)]
        force: bool,
    },
    /// Run the daemon: poll ticker, webhook listener, at most one run at a time.
    Daemon {
        #[arg(long, default_value = ".holdfast/work")]
        workdir: PathBuf,
        #[arg(long, default_value = ".holdfast/state")]
        state_dir: PathBuf,
        #[arg(long, default_value = ".holdfast/deployed")]
        deployed_dir: PathBuf,
        #[arg(long)]
        bind: Option<String>,
    },
    /// Render a Stack's services to compose/proxy/health documents without applying them.
    Render {
        #[arg(long)]
        stack: PathBuf,
        #[arg(long)]
        manifest_dir: PathBuf,
    },
    /// Resolve and lint a Stack's services, reporting port conflicts, cycles, and unknown dependencies.
    Lint {
        #[arg(long)]
        stack: PathBuf,
        #[arg(long)]
        manifest_dir: PathBuf,
    },
    /// Migrate a legacy (unversioned) manifest file to the current envelope.
    Migrate {
        path: PathBuf,
        /// Write the migrated document back to `path` instead of printing it.
        #[arg(long)]
        write: bool,
    },
    /// POST a manual trigger to a running daemon's control plane.
    Trigger {
        #[arg(long, default_value = "http://127.0.0.1:8787")]
        url: String,
        #[arg(long, default_value = "manual")]
        remote: String,
    },
    /// Query a running daemon's control plane for its current status.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8787")]
        url: String,
    },
    /// Print a shell completion script.
    Completions { shell: Shell },
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match run(cli) {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e.downcast_ref::<HoldfastError>().map(HoldfastError::exit_code).unwrap_or(1);
            std::process::ExitCode::from(code as u8)
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let loaded_config = match &cli.config {
        Some(path) => {
            HoldfastConfig::load_from_file(path).map_err(|e| HoldfastError::Config(e.to_string()))?
        }
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            match HoldfastConfig::discover(&cwd).map_err(|e| HoldfastError::Config(e.to_string()))? {
                Some((config, _root)) => config,
                None => {
                    return Err(HoldfastError::Config(
                        "no .holdfast.toml found; pass --config or create one under a .holdfast/ marker directory"
                            .to_string(),
                    )
                    .into());
                }
            }
        }
    };
    let config = loaded_config.apply_overrides(CliOverrides::default());

    match cli.cmd {
        Commands::Run { workdir, state_dir, deployed_dir, force } => {
            run_once(&config, workdir, state_dir, deployed_dir, cli.quiet, force)
        }
        Commands::Daemon { workdir, state_dir, deployed_dir, bind } => run_daemon(config, workdir, state_dir, deployed_dir, bind),
        Commands::Render { stack, manifest_dir } => render_manifest(&stack, &manifest_dir),
        Commands::Lint { stack, manifest_dir } => lint_manifest(&stack, &manifest_dir),
        Commands::Migrate { path, write } => migrate_manifest(&path, write),
        Commands::Trigger { url, remote } => trigger_remote(&url, &remote),
        Commands::Status { url } => query_status(&url),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "holdfast", &mut std::io::stdout());
            Ok(0)
        }
    }
}

fn run_once(
    config: &HoldfastConfig,
    workdir: PathBuf,
    state_dir: PathBuf,
    deployed_dir: PathBuf,
    quiet: bool,
    force: bool,
) -> Result<i32> {
    let stack_path = workdir.join(&config.manifest_root).join("stack.yaml");
    let identity = Some(Identity::for_manifest(&stack_path));
    let ctx = RunContext { workdir, state_dir, deployed_dir, identity, cancel: Arc::new(AtomicBool::new(false)), force };
    let run_id = format!("run-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));

    let mut boxed: Box<dyn PipelineObserver> =
        if quiet { Box::new(StageReporter::silent()) } else { Box::new(StageReporter::new()) };
    let record = pipeline::run(&run_id, TriggerSource::Manual { operator: None }, config, &ctx, boxed.as_mut());

    match record.outcome {
        Some(RunOutcome::Succeeded) | Some(RunOutcome::NoChange) => Ok(0),
        _ => {
            if let Some(err) = &record.error {
                eprintln!("run {run_id} failed: {err}");
            }
            Ok(1)
        }
    }
}

fn run_daemon(config: HoldfastConfig, workdir: PathBuf, state_dir: PathBuf, deployed_dir: PathBuf, bind: Option<String>) -> Result<i32> {
    let bind_addr = bind.unwrap_or_else(|| config.control_plane.bind.clone());
    let control_plane_config = config.control_plane.clone();
    let rpc_socket = config.control_plane.rpc_socket.clone();
    let poll_interval = config.poll_interval;
    let manifest_root = config.manifest_root.clone();

    let scheduler = Arc::new(Scheduler::spawn(
        config,
        move || {
            let stack_path = workdir.join(&manifest_root).join("stack.yaml");
            RunContext {
                workdir: workdir.clone(),
                state_dir: state_dir.clone(),
                deployed_dir: deployed_dir.clone(),
                identity: Some(Identity::for_manifest(&stack_path)),
                cancel: Arc::new(AtomicBool::new(false)),
                force: false,
            }
        },
        || format!("run-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ")),
    ));

    {
        let scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || {
            loop {
                let (lock, cvar) = &*scheduler.shutdown_signal;
                let guard = lock.lock().unwrap();
                let (guard, _timeout) = cvar.wait_timeout(guard, poll_interval).unwrap();
                if *guard {
                    return;
                }
                drop(guard);
                let _ = scheduler.trigger(TriggerSource::Poll);
            }
        });
    }

    if let Some(socket_path) = rpc_socket {
        let rpc_scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || {
            if let Err(e) = controlplane::rpc::serve(&socket_path, rpc_scheduler) {
                tracing::warn!(error = %e, "rpc listener exited");
            }
        });
    }

    controlplane::serve(&bind_addr, &control_plane_config, scheduler)?;
    Ok(0)
}

fn render_manifest(stack: &PathBuf, manifest_dir: &PathBuf) -> Result<i32> {
    let resolved = manifest::resolve(stack, manifest_dir)?;
    let engine = template::Engine::new(manifest_dir);
    let output = engine.render(&resolved.services, &resolved.provisions, &std::collections::BTreeMap::new())?;
    let text = serde_yaml::to_string(&output.compose).context("failed to serialize render output")?;
    print!("{text}");
    std::io::stdout().flush().ok();
    Ok(0)
}

fn lint_manifest(stack: &PathBuf, manifest_dir: &PathBuf) -> Result<i32> {
    let doc = manifest::load_file(stack)?;
    manifest::expect_kind(&doc, holdfast_types::ManifestKind::Stack)?;

    match manifest::resolve(stack, manifest_dir) {
        Ok(resolved) => {
            println!("ok: {} services, {} provisions resolved cleanly", resolved.services.len(), resolved.provisions.len());
            Ok(0)
        }
        Err(e) => {
            eprintln!("lint failed: {e:#}");
            Ok(1)
        }
    }
}

fn migrate_manifest(path: &PathBuf, write: bool) -> Result<i32> {
    let migrated = holdfast::manifest::load_file(path).context("failed to migrate manifest")?;
    let serialized = serde_yaml::to_string(&migrated).context("failed to serialize migrated manifest")?;

    if write {
        std::fs::write(path, &serialized).with_context(|| format!("failed to write {}", path.display()))?;
    } else {
        print!("{serialized}");
    }
    Ok(0)
}

fn trigger_remote(url: &str, remote: &str) -> Result<i32> {
    let client = reqwest::blocking::Client::builder().timeout(Duration::from_secs(10)).build()?;
    let response = client.post(format!("{url}/trigger")).body(remote.to_string()).send().context("failed to reach control plane")?;
    let status = response.status();
    let body = response.text().unwrap_or_default();
    println!("{body}");
    Ok(if status.is_success() { 0 } else { 1 })
}

fn query_status(url: &str) -> Result<i32> {
    let client = reqwest::blocking::Client::builder().timeout(Duration::from_secs(10)).build()?;
    let response = client.get(format!("{url}/status")).send().context("failed to reach control plane")?;
    let status = response.status();
    let body = response.text().unwrap_or_default();
    println!("{body}");
    Ok(if status.is_success() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_subcommand_with_defaults() {
        let cli = Cli::parse_from(["holdfast", "run"]);
        match cli.cmd {
            Commands::Run { workdir, .. } => assert_eq!(workdir, PathBuf::from(".holdfast/work")),
            _ => panic!("expected Run subcommand"),
        }
    }

    #[test]
    fn cli_parses_daemon_bind_override() {
        let cli = Cli::parse_from(["holdfast", "daemon", "--bind", "0.0.0.0:9000"]);
        match cli.cmd {
            Commands::Daemon { bind, .. } => assert_eq!(bind.as_deref(), Some("0.0.0.0:9000")),
            _ => panic!("expected Daemon subcommand"),
        }
    }
}
