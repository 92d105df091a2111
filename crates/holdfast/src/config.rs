//! Configuration file (`.holdfast.toml`) loading, environment-variable
//! overrides, and CLI-override merging.
//!
//! Project-root discovery walks upward from the current directory looking
//! for a `.holdfast/` marker directory, the same way the teacher's
//! `.shipper.toml` discovery walked for a workspace root. Layering is CLI
//! flags win, else environment variables, else the config file, else a
//! computed default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use holdfast_types::AlertSeverity;

const MARKER_DIR: &str = ".holdfast";
const CONFIG_FILE: &str = ".holdfast.toml";

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_lock_timeout() -> Duration {
    Duration::from_secs(3600)
}
fn default_snapshot_retention() -> usize {
    10
}
fn default_control_plane_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_max_attempts() -> u32 {
    6
}
fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}
fn default_jitter() -> f64 {
    0.5
}
fn default_run_history() -> usize {
    20
}
fn default_sms_min_severity() -> AlertSeverity {
    AlertSeverity::Error
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from(".holdfast/staging")
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from(".holdfast/backups")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from(".holdfast/logs")
}
fn default_appdata_dir() -> PathBuf {
    PathBuf::from(".holdfast/appdata")
}
fn default_tunnel_provider() -> TunnelProvider {
    TunnelProvider::None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Minimum severity the webhook provider forwards; `None` forwards
    /// everything.
    #[serde(default)]
    pub webhook_min_severity: Option<AlertSeverity>,
    #[serde(default)]
    pub email_to: Option<String>,
    #[serde(default)]
    pub email_min_severity: Option<AlertSeverity>,
    #[serde(default)]
    pub sms_url: Option<String>,
    /// SMS defaults to suppressing anything below `Error` — a chatty SMS
    /// gateway is the one alert channel an operator actually pays for per
    /// message.
    #[serde(default = "default_sms_min_severity")]
    pub sms_min_severity: AlertSeverity,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_secret: None,
            webhook_min_severity: None,
            email_to: None,
            email_min_severity: None,
            sms_url: None,
            sms_min_severity: default_sms_min_severity(),
        }
    }
}

/// Which tunnel provider (if any) fronts the control plane's HTTP listener
/// for webhook delivery from a git forge that can't reach a home-lab host
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelProvider {
    None,
    Cloudflared,
    Tailscale,
    Ngrok,
}

impl TunnelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProvider::None => "none",
            TunnelProvider::Cloudflared => "cloudflared",
            TunnelProvider::Tailscale => "tailscale",
            TunnelProvider::Ngrok => "ngrok",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeWebhookSecrets {
    #[serde(default)]
    pub generic: Option<String>,
    #[serde(default)]
    pub github: Option<String>,
    #[serde(default)]
    pub gitlab: Option<String>,
    #[serde(default)]
    pub gitea: Option<String>,
    #[serde(default)]
    pub bitbucket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_control_plane_bind")]
    pub bind: String,
    #[serde(default)]
    pub rpc_socket: Option<PathBuf>,
    /// Deprecated alias for `webhook_secrets.generic`; still honored for
    /// backward compatibility with a single-forge setup.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub webhook_secrets: ForgeWebhookSecrets,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind: default_control_plane_bind(),
            rpc_socket: None,
            webhook_secret: None,
            webhook_secrets: ForgeWebhookSecrets::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldfastConfig {
    pub repo_remote: String,
    #[serde(default)]
    pub manifest_root: PathBuf,
    #[serde(default)]
    pub pinned_ref: Option<String>,
    /// Paths (relative to the fetched repo root) of encrypted secret
    /// documents to decrypt before rendering. Decrypted contents live only
    /// in memory for the life of a run, never written to disk.
    #[serde(default)]
    pub secret_paths: Vec<PathBuf>,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention: usize,
    #[serde(default = "default_run_history")]
    pub run_history: usize,
    /// SSH remote (`user@host`) the Deploy stage mirrors rendered output to.
    /// `None` means deploy locally into `deployed_dir`.
    #[serde(default)]
    pub deploy_target: Option<String>,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_appdata_dir")]
    pub appdata_dir: PathBuf,
    #[serde(default = "default_tunnel_provider")]
    pub tunnel_provider: TunnelProvider,
    /// Name of the container the Signal stage reload-signals after a
    /// successful Compose (e.g. a reverse-proxy container that needs a
    /// config reload). `None` skips the Signal stage's actual signal.
    #[serde(default)]
    pub signal_container: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
}

impl HoldfastConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: HoldfastConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Look for `.holdfast.toml` starting at `start` and walking upward
    /// through parent directories until a `.holdfast/` marker directory (or
    /// the filesystem root) is reached. Returns `Ok(None)` if no config
    /// file is found before hitting the marker or root.
    pub fn discover(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Ok(Some((Self::load_from_file(&config_path)?, dir)));
            }
            if dir.join(MARKER_DIR).is_dir() {
                return Ok(None);
            }
            if !dir.pop() {
                return Ok(None);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.repo_remote.trim().is_empty() {
            bail!("repo_remote must not be empty");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.max_delay < self.retry.base_delay {
            bail!("retry.max_delay must be >= retry.base_delay");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            bail!("retry.jitter must be between 0.0 and 1.0");
        }
        if self.snapshot_retention == 0 {
            bail!("snapshot_retention must be at least 1");
        }
        Ok(())
    }

    /// Apply environment variable overrides (`HOLDFAST_*`), then the given
    /// CLI overrides on top: CLI wins over env, env wins over file.
    pub fn apply_overrides(mut self, cli: CliOverrides) -> Self {
        if let Ok(remote) = std::env::var("HOLDFAST_REPO_REMOTE") {
            self.repo_remote = remote;
        }
        if let Ok(bind) = std::env::var("HOLDFAST_CONTROL_PLANE_BIND") {
            self.control_plane.bind = bind;
        }

        if let Some(remote) = cli.repo_remote {
            self.repo_remote = remote;
        }
        if let Some(interval) = cli.poll_interval {
            self.poll_interval = interval;
        }
        if let Some(bind) = cli.control_plane_bind {
            self.control_plane.bind = bind;
        }
        self
    }
}

/// CLI-supplied overrides, merged over config-file/env values by
/// [`HoldfastConfig::apply_overrides`].
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub repo_remote: Option<String>,
    pub poll_interval: Option<Duration>,
    pub control_plane_bind: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::tempdir;

    fn base_config() -> HoldfastConfig {
        HoldfastConfig {
            repo_remote: "git@example.com:org/repo.git".to_string(),
            manifest_root: PathBuf::new(),
            pinned_ref: None,
            secret_paths: Vec::new(),
            poll_interval: default_poll_interval(),
            lock_timeout: default_lock_timeout(),
            snapshot_retention: default_snapshot_retention(),
            run_history: default_run_history(),
            deploy_target: None,
            staging_dir: default_staging_dir(),
            backup_dir: default_backup_dir(),
            log_dir: default_log_dir(),
            appdata_dir: default_appdata_dir(),
            tunnel_provider: default_tunnel_provider(),
            signal_container: None,
            retry: RetryConfig::default(),
            alert: AlertConfig::default(),
            control_plane: ControlPlaneConfig::default(),
        }
    }

    #[test]
    fn load_from_file_applies_defaults() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CONFIG_FILE);
        fs::write(&path, "repo_remote = \"git@example.com:org/repo.git\"\n").expect("write config");

        let config = HoldfastConfig::load_from_file(&path).expect("load");
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.snapshot_retention, 10);
    }

    #[test]
    fn validate_rejects_empty_remote() {
        let mut config = base_config();
        config.repo_remote = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_max_delay_below_base_delay() {
        let mut config = base_config();
        config.retry.max_delay = Duration::from_secs(1);
        config.retry.base_delay = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn discover_stops_at_marker_directory_with_no_config() {
        let td = tempdir().expect("tempdir");
        fs::create_dir_all(td.path().join(MARKER_DIR)).expect("mkdir marker");
        let nested = td.path().join("a/b/c");
        fs::create_dir_all(&nested).expect("mkdir nested");

        let result = HoldfastConfig::discover(&nested).expect("discover");
        assert!(result.is_none());
    }

    #[test]
    #[serial]
    fn discover_finds_config_in_ancestor_directory() {
        let td = tempdir().expect("tempdir");
        fs::write(
            td.path().join(CONFIG_FILE),
            "repo_remote = \"git@example.com:org/repo.git\"\n",
        )
        .expect("write config");
        let nested = td.path().join("a/b");
        fs::create_dir_all(&nested).expect("mkdir nested");

        let (config, root) = HoldfastConfig::discover(&nested).expect("discover").expect("found");
        assert_eq!(config.repo_remote, "git@example.com:org/repo.git");
        assert_eq!(root, td.path());
    }

    #[test]
    #[serial]
    fn apply_overrides_cli_wins_over_env_and_file() {
        let mut config = base_config();
        config.repo_remote = "file-remote".to_string();

        unsafe { std::env::set_var("HOLDFAST_REPO_REMOTE", "env-remote") };
        let cli = CliOverrides { repo_remote: Some("cli-remote".to_string()), ..Default::default() };
        let merged = config.apply_overrides(cli);
        unsafe { std::env::remove_var("HOLDFAST_REPO_REMOTE") };

        assert_eq!(merged.repo_remote, "cli-remote");
    }
}
