//! Point-in-time snapshots of the deployed state directory, stored as a
//! tar.gz bundle with a JSON sidecar manifest (path -> sha256), and the
//! retention policy that prunes old [`BackupEntry`]s.
//!
//! Grounded on the atomic-write-then-rename idiom and schema-version
//! tagging used for state persistence elsewhere in this workspace, paired
//! with `tar`/`flate2` for the archive itself.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

use holdfast_types::{BackupEntry, SNAPSHOT_MANIFEST_VERSION, SnapshotManifest};

const SNAPSHOTS_DIR: &str = "snapshots";

/// Per-entry cap enforced during [`restore`], independent of whatever the
/// `tar` crate itself tolerates: a corrupted or maliciously crafted archive
/// declaring a huge entry size is rejected before any bytes are written.
const MAX_EXTRACTED_FILE_BYTES: u64 = 1 << 30;

fn snapshots_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(SNAPSHOTS_DIR)
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Create a snapshot of every file under `deployed_dir`, writing
/// `<id>.tar.gz` and `<id>.json` into the state directory's snapshots
/// subdirectory.
pub fn create(state_dir: &Path, deployed_dir: &Path, run_id: Option<&str>) -> Result<SnapshotManifest> {
    let dir = snapshots_dir(state_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create snapshots dir {}", dir.display()))?;

    let snapshot_id = format!("{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
    let archive_path = dir.join(format!("{snapshot_id}.tar.gz"));
    let tmp_archive = archive_path.with_extension("tar.gz.tmp");

    let mut files = BTreeMap::new();
    {
        let tar_gz = File::create(&tmp_archive)
            .with_context(|| format!("failed to create {}", tmp_archive.display()))?;
        let enc = GzEncoder::new(tar_gz, Compression::default());
        let mut builder = tar::Builder::new(enc);

        if deployed_dir.exists() {
            for entry in walk_files(deployed_dir)? {
                let relative = entry
                    .strip_prefix(deployed_dir)
                    .unwrap_or(&entry)
                    .to_path_buf();
                files.insert(relative.clone(), sha256_file(&entry)?);
                builder
                    .append_path_with_name(&entry, &relative)
                    .with_context(|| format!("failed to add {} to snapshot archive", entry.display()))?;
            }
        }

        builder.finish().context("failed to finalize snapshot archive")?;
    }
    fs::rename(&tmp_archive, &archive_path)
        .with_context(|| format!("failed to rename snapshot archive to {}", archive_path.display()))?;

    let manifest = SnapshotManifest {
        schema_version: SNAPSHOT_MANIFEST_VERSION.to_string(),
        snapshot_id: snapshot_id.clone(),
        created_at: Utc::now(),
        run_id: run_id.map(|s| s.to_string()),
        files,
    };

    let manifest_path = dir.join(format!("{snapshot_id}.json"));
    let tmp_manifest = manifest_path.with_extension("json.tmp");
    {
        let mut f = File::create(&tmp_manifest)
            .with_context(|| format!("failed to create {}", tmp_manifest.display()))?;
        f.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;
        f.sync_all().context("failed to sync snapshot manifest")?;
    }
    fs::rename(&tmp_manifest, &manifest_path)
        .with_context(|| format!("failed to rename snapshot manifest to {}", manifest_path.display()))?;

    Ok(manifest)
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("failed to read dir {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Restore `snapshot_id` from `state_dir` into `dest_dir`, overwriting any
/// existing files with the same relative path. Entries are unpacked one at a
/// time rather than via a blanket `Archive::unpack`, so each one's declared
/// size can be checked against [`MAX_EXTRACTED_FILE_BYTES`] before it is
/// written to disk.
pub fn restore(state_dir: &Path, snapshot_id: &str, dest_dir: &Path) -> Result<()> {
    let archive_path = snapshots_dir(state_dir).join(format!("{snapshot_id}.tar.gz"));
    if !archive_path.exists() {
        bail!("no snapshot named {snapshot_id} found in {}", state_dir.display());
    }

    let tar_gz = File::open(&archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let dec = GzDecoder::new(tar_gz);
    let mut archive = tar::Archive::new(dec);
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("failed to create restore target {}", dest_dir.display()))?;

    for entry in archive.entries().with_context(|| format!("failed to read snapshot {snapshot_id}"))? {
        let mut entry = entry.with_context(|| format!("failed to read an entry of snapshot {snapshot_id}"))?;
        let size = entry.header().size().with_context(|| format!("entry in snapshot {snapshot_id} has no size"))?;
        if size > MAX_EXTRACTED_FILE_BYTES {
            let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            bail!(
                "snapshot {snapshot_id} entry {path} is {size} bytes, exceeding the {MAX_EXTRACTED_FILE_BYTES} byte extraction cap"
            );
        }
        entry.unpack_in(dest_dir).with_context(|| format!("failed to unpack an entry of snapshot {snapshot_id}"))?;
    }

    Ok(())
}

/// List every retained snapshot, most recent first.
pub fn list(state_dir: &Path) -> Result<Vec<BackupEntry>> {
    let dir = snapshots_dir(state_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let manifest: SnapshotManifest = serde_json::from_str(&fs::read_to_string(&path)?)
            .with_context(|| format!("failed to parse snapshot manifest {}", path.display()))?;
        let archive_path = path.with_extension("tar.gz");
        let size_bytes = fs::metadata(&archive_path).map(|m| m.len()).unwrap_or(0);
        entries.push(BackupEntry {
            snapshot_id: manifest.snapshot_id,
            created_at: manifest.created_at,
            archive_path,
            size_bytes,
        });
    }
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(entries)
}

/// Additive-by-default retention: delete the oldest snapshots beyond
/// `keep`, returning how many were removed.
pub fn prune(state_dir: &Path, keep: usize) -> Result<usize> {
    let entries = list(state_dir)?;
    let mut removed = 0;
    for entry in entries.into_iter().skip(keep) {
        let manifest_path = snapshots_dir(state_dir).join(format!("{}.json", entry.snapshot_id));
        let _ = fs::remove_file(&entry.archive_path);
        let _ = fs::remove_file(&manifest_path);
        removed += 1;
    }
    Ok(removed)
}
