//! Manifest loading, dependency resolution, and lint.
//!
//! A Stack names the Services it composes (directly, or transitively via
//! `include`); [`resolve`] walks that tree, collects every Service and the
//! Provisions it references, interpolates `${var}` placeholders from each
//! Provision's `vars` map, and runs [`lint::lint_services`] before handing
//! the result to the Render stage.

pub mod cycle;
pub mod interpolate;
pub mod lint;
pub mod migrate;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use holdfast_types::{ManifestDocument, ManifestKind, ManifestSpec, ProvisionSpec, ServiceSpec};

pub use lint::LintFinding;

/// The fully resolved manifest tree for one Stack: every Service and
/// Provision it (transitively) names, keyed by manifest name.
#[derive(Debug, Clone, Default)]
pub struct ResolvedManifest {
    pub services: BTreeMap<String, ServiceSpec>,
    pub provisions: BTreeMap<String, ProvisionSpec>,
}

/// Load and migrate a single manifest file.
pub fn load_file(path: &Path) -> Result<ManifestDocument> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    migrate::load(&text).with_context(|| format!("failed to parse manifest {}", path.display()))
}

/// Resolve a Stack manifest rooted at `stack_path`, following `include`
/// and service/provision name references within `manifest_dir`.
pub fn resolve(stack_path: &Path, manifest_dir: &Path) -> Result<ResolvedManifest> {
    let doc = load_file(stack_path)?;
    let ManifestSpec::Stack(stack) = doc.spec else {
        bail!("{} is not a Stack manifest", stack_path.display());
    };

    let mut resolved = ResolvedManifest::default();
    let mut visited_files: Vec<PathBuf> = vec![stack_path.to_path_buf()];

    for service_name in &stack.services {
        load_service(service_name, manifest_dir, &mut resolved)?;
    }

    for included in &stack.include {
        let included_path = manifest_dir.join(included);
        if visited_files.contains(&included_path) {
            continue;
        }
        visited_files.push(included_path.clone());
        let included_doc = load_file(&included_path)?;
        if let ManifestSpec::Stack(inner) = included_doc.spec {
            for service_name in &inner.services {
                load_service(service_name, manifest_dir, &mut resolved)?;
            }
        }
    }

    let findings = lint::lint_services(&resolved.services);
    if !findings.is_empty() {
        let joined = findings.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ");
        bail!("manifest lint failed: {joined}");
    }

    interpolate_provisions_into_services(&mut resolved)?;

    Ok(resolved)
}

fn load_service(name: &str, manifest_dir: &Path, resolved: &mut ResolvedManifest) -> Result<()> {
    if resolved.services.contains_key(name) {
        return Ok(());
    }

    let candidate = manifest_dir.join(format!("{name}.yaml"));
    let doc = load_file(&candidate)?;
    let ManifestSpec::Service(service) = doc.spec else {
        bail!("{} is not a Service manifest", candidate.display());
    };

    for provision_name in &service.provisions {
        load_provision(provision_name, manifest_dir, resolved)?;
    }

    resolved.services.insert(name.to_string(), service);
    Ok(())
}

fn load_provision(name: &str, manifest_dir: &Path, resolved: &mut ResolvedManifest) -> Result<()> {
    if resolved.provisions.contains_key(name) {
        return Ok(());
    }

    let mut raw: BTreeMap<String, ProvisionSpec> = BTreeMap::new();
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    collect_provision_graph(name, manifest_dir, &mut raw, &mut graph)?;

    if let Some(cycle) = cycle::find_cycle(&graph) {
        bail!("provision include cycle detected: {cycle}");
    }

    let mut memo: BTreeMap<String, ProvisionSpec> = BTreeMap::new();
    let merged = merge_provision(name, &raw, &mut memo);
    resolved.provisions.insert(name.to_string(), merged);
    Ok(())
}

/// Load `name` and every provision it (transitively) includes into `raw`,
/// recording each edge in `graph` so the caller can run cycle detection
/// before attempting to merge anything.
fn collect_provision_graph(
    name: &str,
    manifest_dir: &Path,
    raw: &mut BTreeMap<String, ProvisionSpec>,
    graph: &mut BTreeMap<String, Vec<String>>,
) -> Result<()> {
    if raw.contains_key(name) {
        return Ok(());
    }

    let candidate = manifest_dir.join(format!("{name}.yaml"));
    let doc = load_file(&candidate)?;
    let ManifestSpec::Provision(provision) = doc.spec else {
        bail!("{} is not a Provision manifest", candidate.display());
    };

    graph.insert(name.to_string(), provision.includes.clone());
    let includes = provision.includes.clone();
    raw.insert(name.to_string(), provision);

    for include in &includes {
        collect_provision_graph(include, manifest_dir, raw, graph)?;
    }
    Ok(())
}

/// Merge `name`'s transitive includes children-first: each include is fully
/// merged before `name`'s own `vars`/`compose`/`proxy`/`health` are layered
/// on top, so a later include and the provision's own fields win over an
/// earlier one's.
fn merge_provision(
    name: &str,
    raw: &BTreeMap<String, ProvisionSpec>,
    memo: &mut BTreeMap<String, ProvisionSpec>,
) -> ProvisionSpec {
    if let Some(cached) = memo.get(name) {
        return cached.clone();
    }

    let own = raw.get(name).cloned().unwrap_or_default();
    let mut merged = ProvisionSpec { path: own.path.clone(), ..Default::default() };

    for include in &own.includes {
        let child = merge_provision(include, raw, memo);
        merged.vars.extend(child.vars);
        merged.compose.extend(child.compose);
        merged.proxy.extend(child.proxy);
        merged.health.extend(child.health);
    }

    merged.vars.extend(own.vars.clone());
    merged.compose.extend(own.compose.clone());
    merged.proxy.extend(own.proxy.clone());
    merged.health.extend(own.health.clone());
    merged.includes = own.includes.clone();

    memo.insert(name.to_string(), merged.clone());
    merged
}

fn interpolate_provisions_into_services(resolved: &mut ResolvedManifest) -> Result<()> {
    let mut merged_vars: BTreeMap<String, String> = BTreeMap::new();
    for provision in resolved.provisions.values() {
        for (k, v) in &provision.vars {
            merged_vars.insert(k.clone(), v.clone());
        }
    }

    for service in resolved.services.values_mut() {
        service.image = interpolate::interpolate(&service.image, &merged_vars)?;
    }

    Ok(())
}

/// True if `doc`'s kind matches `expected`, used by the `lint`/`render` CLI
/// entry points to give a clear error before attempting to resolve.
pub fn expect_kind(doc: &ManifestDocument, expected: ManifestKind) -> Result<()> {
    if doc.kind != expected {
        bail!("expected a {expected:?} manifest, found {:?}", doc.kind);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).expect("write manifest");
    }

    #[test]
    fn resolves_stack_with_service_and_provision() {
        let td = tempdir().expect("tempdir");
        let dir = td.path();

        write(
            dir,
            "base.yaml",
            "apiVersion: holdfast/v1\nkind: Provision\nspec:\n  path: /srv\n  vars:\n    host: example.com\n",
        );
        write(
            dir,
            "web.yaml",
            "apiVersion: holdfast/v1\nkind: Service\nspec:\n  image: ${host}\n  provisions: [base]\n  ports:\n    - host: 8080\n      container: 80\n",
        );
        write(
            dir,
            "stack.yaml",
            "apiVersion: holdfast/v1\nkind: Stack\nspec:\n  services: [web]\n",
        );

        let resolved = resolve(&dir.join("stack.yaml"), dir).expect("resolve");
        assert_eq!(resolved.services.len(), 1);
        assert_eq!(resolved.provisions.len(), 1);
        assert_eq!(resolved.services["web"].image, "example.com");
    }

    #[test]
    fn resolve_rejects_non_stack_root() {
        let td = tempdir().expect("tempdir");
        let dir = td.path();
        write(
            dir,
            "stack.yaml",
            "apiVersion: holdfast/v1\nkind: Service\nspec:\n  image: nginx:latest\n",
        );
        assert!(resolve(&dir.join("stack.yaml"), dir).is_err());
    }

    #[test]
    fn provision_includes_are_merged_children_first() {
        let td = tempdir().expect("tempdir");
        let dir = td.path();

        write(
            dir,
            "base.yaml",
            "apiVersion: holdfast/v1\nkind: Provision\nspec:\n  path: /srv/base\n  vars:\n    tier: base\n  compose:\n    network_mode: bridge\n",
        );
        write(
            dir,
            "overlay.yaml",
            "apiVersion: holdfast/v1\nkind: Provision\nspec:\n  path: /srv/overlay\n  includes: [base]\n  vars:\n    tier: overlay\n",
        );
        write(
            dir,
            "web.yaml",
            "apiVersion: holdfast/v1\nkind: Service\nspec:\n  image: nginx\n  provisions: [overlay]\n",
        );
        write(
            dir,
            "stack.yaml",
            "apiVersion: holdfast/v1\nkind: Stack\nspec:\n  services: [web]\n",
        );

        let resolved = resolve(&dir.join("stack.yaml"), dir).expect("resolve");
        let overlay = &resolved.provisions["overlay"];
        assert_eq!(overlay.vars.get("tier").map(String::as_str), Some("overlay"));
        assert!(overlay.compose.contains_key("network_mode"));
    }

    #[test]
    fn provision_include_cycle_is_rejected() {
        let td = tempdir().expect("tempdir");
        let dir = td.path();

        write(dir, "a.yaml", "apiVersion: holdfast/v1\nkind: Provision\nspec:\n  path: /srv/a\n  includes: [b]\n");
        write(dir, "b.yaml", "apiVersion: holdfast/v1\nkind: Provision\nspec:\n  path: /srv/b\n  includes: [a]\n");
        write(
            dir,
            "web.yaml",
            "apiVersion: holdfast/v1\nkind: Service\nspec:\n  image: nginx\n  provisions: [a]\n",
        );
        write(
            dir,
            "stack.yaml",
            "apiVersion: holdfast/v1\nkind: Stack\nspec:\n  services: [web]\n",
        );

        let err = resolve(&dir.join("stack.yaml"), dir).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn resolve_surfaces_lint_failures() {
        let td = tempdir().expect("tempdir");
        let dir = td.path();
        write(
            dir,
            "a.yaml",
            "apiVersion: holdfast/v1\nkind: Service\nspec:\n  image: img\n  ports:\n    - host: 8080\n      container: 1\n",
        );
        write(
            dir,
            "b.yaml",
            "apiVersion: holdfast/v1\nkind: Service\nspec:\n  image: img\n  ports:\n    - host: 8080\n      container: 2\n",
        );
        write(
            dir,
            "stack.yaml",
            "apiVersion: holdfast/v1\nkind: Stack\nspec:\n  services: [a, b]\n",
        );

        let err = resolve(&dir.join("stack.yaml"), dir).unwrap_err();
        assert!(err.to_string().contains("lint failed"));
    }
}
