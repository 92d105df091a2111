//! # holdfast-types
//!
//! Core domain types for the holdfast GitOps reconciliation engine: manifest
//! documents, rendered output, pipeline/run state, snapshots, locks and
//! alerts.
//!
//! Durations are serialized as milliseconds so state persisted to disk is
//! stable across `humantime`-string and millisecond-count config inputs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a human-readable string or a u64 of milliseconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds so it roundtrips with [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn default_api_version() -> String {
    "holdfast/v1".to_string()
}

/// The kind-tagged envelope every manifest document is wrapped in on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDocument {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub kind: ManifestKind,
    #[serde(default)]
    pub metadata: ManifestMetadata,
    pub spec: ManifestSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ManifestKind {
    Provision,
    Service,
    Stack,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Kind-specific body of a manifest. The `kind` field in [`ManifestDocument`]
/// determines which variant is expected; `ManifestSpec` itself is untagged
/// since the YAML shape already disambiguates (the wire schema carries
/// `kind` as a sibling, not nested inside `spec`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestSpec {
    Provision(ProvisionSpec),
    Service(ServiceSpec),
    Stack(StackSpec),
}

/// A host-level resource: a directory tree, a set of files to template out,
/// or a shell of config that services depend on existing before they start.
///
/// `includes` names sibling provisions (by manifest name, not path) this one
/// extends; the resolver merges them children-first so a later include's
/// `compose`/`proxy`/`health` fragments and `vars` win over an earlier one's.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub compose: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub proxy: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub health: BTreeMap<String, serde_yaml::Value>,
}

/// A single deployable unit: an image/compose fragment, the provisions it
/// needs, the ports it exposes, and how readiness is determined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub image: String,
    #[serde(default)]
    pub provisions: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub health: Option<HealthCheckSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub path: Option<String>,
    #[serde(default, deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub interval: Duration,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

fn default_health_retries() -> u32 {
    3
}

/// A named collection of services and provisions composed together,
/// optionally including other stack files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSpec {
    pub services: Vec<String>,
    #[serde(default)]
    pub include: Vec<PathBuf>,
}

/// The result of rendering a resolved manifest tree: one compose document,
/// one reverse-proxy document, and one health-check map, keyed by service
/// name so the Pipeline can diff per-service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderOutput {
    pub compose: BTreeMap<String, serde_yaml::Value>,
    pub proxy: BTreeMap<String, serde_yaml::Value>,
    pub health: BTreeMap<String, HealthCheckSpec>,
    /// sha256 of the rendered output, used for the no-change fast path.
    pub content_hash: String,
}

/// The reconciliation daemon's coarse-grained lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// What caused a reconciliation run to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSource {
    Poll,
    Webhook { remote: String },
    Manual { operator: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
    NoChange,
}

/// One completed (or in-flight) reconciliation run, kept in the daemon's
/// bounded run-history ring buffer and persisted as the current record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub stages: Vec<StageRecord>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: PipelineStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub detail: Option<String>,
}

/// The nine-stage reconciliation pipeline, driven as an explicit state
/// machine rather than a fixed closure chain so it can be resumed,
/// cancelled mid-stage, and reported on stage-by-stage.
///
/// `AcquireLock` runs first and `ReleaseLock` runs last, unconditionally, on
/// any exit path (success, failure, or cancellation) — the reconcile lock
/// must never be left held because a later stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    AcquireLock,
    FetchRepo,
    DecryptSecrets,
    RenderTemplates,
    Backup,
    Deploy,
    Compose,
    Signal,
    ReleaseLock,
}

impl PipelineStage {
    pub const ORDER: [PipelineStage; 9] = [
        PipelineStage::AcquireLock,
        PipelineStage::FetchRepo,
        PipelineStage::DecryptSecrets,
        PipelineStage::RenderTemplates,
        PipelineStage::Backup,
        PipelineStage::Deploy,
        PipelineStage::Compose,
        PipelineStage::Signal,
        PipelineStage::ReleaseLock,
    ];

    pub fn next(self) -> Option<PipelineStage> {
        let idx = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

/// Metadata describing a point-in-time snapshot of the deployed state,
/// stored as a tar.gz bundle plus this JSON sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: String,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub run_id: Option<String>,
    pub files: BTreeMap<PathBuf, String>,
}

pub const SNAPSHOT_MANIFEST_VERSION: &str = "holdfast.snapshot.v1";

/// Git context captured for the FetchRepo stage and embedded in run records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitContext {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub dirty: Option<bool>,
}

/// A retained snapshot eligible for restore, as surfaced by the backup
/// retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub archive_path: PathBuf,
    pub size_bytes: u64,
}

/// Lock metadata persisted alongside the advisory lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    /// Distinguishes a reconciliation lock from a provisioning lock so the
    /// two never contend with each other.
    pub scope: LockScope,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    Reconcile,
    Provision,
}

/// A posted alert, handed to every configured [provider] for fan-out.
///
/// [provider]: https://docs.rs/holdfast/latest/holdfast/alert/trait.AlertProvider.html
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub title: String,
    pub body: String,
    pub run_id: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

/// Response body for the control-plane's `/status` endpoint and the RPC
/// `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: DaemonState,
    pub current_run: Option<RunRecord>,
    pub recent_runs: Vec<RunRecord>,
}

/// Response to a `/trigger` request or RPC `trigger` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub accepted: bool,
    pub run_id: Option<String>,
    pub reason: Option<String>,
}

/// Response to the RPC `config` command: a redacted view of the running
/// config, safe to hand to a local operator over the Unix socket. Secret
/// paths, webhook secrets, and alert provider credentials never appear
/// here — only what's needed to sanity-check what the daemon is doing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub repo_remote: String,
    pub manifest_root: String,
    pub poll_interval_secs: u64,
    pub lock_timeout_secs: u64,
    pub snapshot_retention: usize,
    pub deploy_target: Option<String>,
    pub tunnel_provider: String,
    pub signal_container: Option<String>,
    pub secret_path_count: usize,
}
