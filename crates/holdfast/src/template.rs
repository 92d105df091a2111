//! Templating for rendered compose/proxy/health documents.
//!
//! Each Service's `config` map (and its image reference) may contain
//! Jinja-style `{{ ... }}` expressions; [`Engine`] renders them against the
//! Stack's merged variable context. Rendering is sandboxed to the
//! repository root: [`include_file`] and `from_json_file` filters resolve
//! paths relative to that root and refuse to walk above it, per the "signals
//! as posted events" / "sandboxed template file access" design note.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use sha2::{Digest, Sha256};

use holdfast_types::{HealthCheckSpec, ProvisionSpec, RenderOutput, ServiceSpec};

pub struct Engine {
    env: Environment<'static>,
    root: PathBuf,
}

impl Engine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut env = Environment::new();
        env.add_filter("to_snake_case", to_snake_case);

        let sandbox_root = root.clone();
        env.add_filter("include_file", move |path: String| -> Result<String, minijinja::Error> {
            let resolved = resolve_sandboxed(&sandbox_root, &path).map_err(to_minijinja_err)?;
            std::fs::read_to_string(&resolved).map_err(|e| to_minijinja_err(anyhow::anyhow!(e)))
        });

        let sandbox_root = root.clone();
        env.add_filter("from_json_file", move |path: String| -> Result<minijinja::Value, minijinja::Error> {
            let resolved = resolve_sandboxed(&sandbox_root, &path).map_err(to_minijinja_err)?;
            let text = std::fs::read_to_string(&resolved).map_err(|e| to_minijinja_err(anyhow::anyhow!(e)))?;
            let value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| to_minijinja_err(anyhow::anyhow!("{path} is not valid JSON: {e}")))?;
            Ok(minijinja::Value::from_serialize(&value))
        });

        Engine { env, root }
    }

    pub fn render_str(&self, template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
        let ctx: BTreeMap<&str, &str> = vars.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        self.env
            .render_str(template, context! { vars => ctx })
            .with_context(|| format!("failed to render template in {}", self.root.display()))
    }

    /// Render every Service into a compose document, a proxy document, and
    /// a health-check map, producing the output the DiffCheck stage hashes
    /// and compares against the last applied state. Each referenced
    /// Provision's `compose`/`proxy`/`health` sub-document fragments are
    /// merged into the service's own entry first, so a provision can supply
    /// defaults (volumes, networks, proxy headers) that the service's own
    /// fields then override.
    pub fn render(
        &self,
        services: &BTreeMap<String, ServiceSpec>,
        provisions: &BTreeMap<String, ProvisionSpec>,
        vars: &BTreeMap<String, String>,
    ) -> Result<RenderOutput> {
        let mut compose = BTreeMap::new();
        let mut proxy = BTreeMap::new();
        let mut health = BTreeMap::new();

        for (name, service) in services {
            let image = self.render_str(&service.image, vars)?;

            let mut compose_entry = serde_yaml::Mapping::new();
            let mut proxy_entry = serde_yaml::Mapping::new();
            for provision_name in &service.provisions {
                if let Some(provision) = provisions.get(provision_name) {
                    merge_yaml_fragments(&mut compose_entry, &provision.compose);
                    merge_yaml_fragments(&mut proxy_entry, &provision.proxy);
                }
            }

            compose_entry.insert("image".into(), image.clone().into());
            if !service.ports.is_empty() {
                let ports: Vec<String> = service
                    .ports
                    .iter()
                    .map(|p| format!("{}:{}/{}", p.host, p.container, p.protocol))
                    .collect();
                compose_entry.insert("ports".into(), ports.into());
            }
            if !service.depends_on.is_empty() {
                compose_entry.insert(
                    "depends_on".into(),
                    service.depends_on.clone().into_iter().collect::<Vec<_>>().into(),
                );
            }
            compose.insert(name.clone(), serde_yaml::Value::Mapping(compose_entry));

            if !service.ports.is_empty() {
                proxy_entry.insert(
                    "upstream".into(),
                    format!("{}:{}", name, service.ports[0].container).into(),
                );
            }
            if !proxy_entry.is_empty() {
                proxy.insert(name.clone(), serde_yaml::Value::Mapping(proxy_entry));
            }

            if let Some(check) = &service.health {
                health.insert(name.clone(), check.clone());
            } else {
                health.insert(
                    name.clone(),
                    HealthCheckSpec { path: None, interval: std::time::Duration::from_secs(30), retries: 3 },
                );
            }
        }

        let content_hash = hash_render(&compose, &proxy);

        Ok(RenderOutput { compose, proxy, health, content_hash })
    }
}

/// Overlay `fragments` onto `mapping`, string-keying each entry the same
/// way a Provision's `compose`/`proxy` maps are keyed. Later calls (a later
/// provision in a service's `provisions` list) overwrite earlier ones;
/// the caller applies a service's own fields after every provision, so
/// those always win last.
fn merge_yaml_fragments(mapping: &mut serde_yaml::Mapping, fragments: &BTreeMap<String, serde_yaml::Value>) {
    for (key, value) in fragments {
        mapping.insert(key.clone().into(), value.clone());
    }
}

fn hash_render(
    compose: &BTreeMap<String, serde_yaml::Value>,
    proxy: &BTreeMap<String, serde_yaml::Value>,
) -> String {
    let mut hasher = Sha256::new();
    if let Ok(bytes) = serde_yaml::to_string(compose) {
        hasher.update(bytes.as_bytes());
    }
    if let Ok(bytes) = serde_yaml::to_string(proxy) {
        hasher.update(bytes.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn resolve_sandboxed(root: &Path, relative: &str) -> Result<PathBuf> {
    let joined = root.join(relative);
    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let canonical = joined
        .canonicalize()
        .with_context(|| format!("template file {relative} does not exist under {}", root.display()))?;
    if !canonical.starts_with(&canonical_root) {
        bail!("template file {relative} escapes the repository root");
    }
    Ok(canonical)
}

fn to_snake_case(value: String) -> String {
    value.replace(['-', ' '], "_").to_lowercase()
}

fn to_minijinja_err(e: anyhow::Error) -> minijinja::Error {
    minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_types::PortMapping;
    use tempfile::tempdir;

    #[test]
    fn renders_simple_string_template() {
        let td = tempdir().expect("tempdir");
        let engine = Engine::new(td.path());
        let mut vars = BTreeMap::new();
        vars.insert("name".to_string(), "example.com".to_string());
        let out = engine.render_str("host is {{ vars.name }}", &vars).expect("render");
        assert_eq!(out, "host is example.com");
    }

    #[test]
    fn render_produces_deterministic_content_hash() {
        let td = tempdir().expect("tempdir");
        let engine = Engine::new(td.path());
        let mut services = BTreeMap::new();
        services.insert(
            "web".to_string(),
            ServiceSpec {
                image: "nginx:latest".to_string(),
                provisions: vec![],
                ports: vec![PortMapping { host: 8080, container: 80, protocol: "tcp".to_string() }],
                depends_on: vec![],
                config: Default::default(),
                health: None,
            },
        );

        let out1 = engine.render(&services, &BTreeMap::new(), &BTreeMap::new()).expect("render 1");
        let out2 = engine.render(&services, &BTreeMap::new(), &BTreeMap::new()).expect("render 2");
        assert_eq!(out1.content_hash, out2.content_hash);
        assert!(out1.compose.contains_key("web"));
        assert!(out1.proxy.contains_key("web"));
    }

    #[test]
    fn sandbox_rejects_paths_escaping_root() {
        let td = tempdir().expect("tempdir");
        let err = resolve_sandboxed(td.path(), "../../etc/passwd");
        assert!(err.is_err() || !err.unwrap().starts_with(td.path()));
    }

    #[test]
    fn rendered_compose_document_matches_snapshot() {
        let td = tempdir().expect("tempdir");
        let engine = Engine::new(td.path());
        let mut services = BTreeMap::new();
        services.insert(
            "web".to_string(),
            ServiceSpec {
                image: "nginx:1.27".to_string(),
                provisions: vec![],
                ports: vec![PortMapping { host: 8080, container: 80, protocol: "tcp".to_string() }],
                depends_on: vec!["db".to_string()],
                config: Default::default(),
                health: None,
            },
        );
        services.insert(
            "db".to_string(),
            ServiceSpec {
                image: "postgres:16".to_string(),
                provisions: vec![],
                ports: vec![],
                depends_on: vec![],
                config: Default::default(),
                health: None,
            },
        );

        let out = engine.render(&services, &BTreeMap::new(), &BTreeMap::new()).expect("render");

        // BTreeMap keys sort alphabetically regardless of insertion order.
        let compose_keys: Vec<&str> = out.compose.keys().map(|s| s.as_str()).collect();
        insta::assert_snapshot!(compose_keys.join(","), @"db,web");

        let proxy_keys: Vec<&str> = out.proxy.keys().map(|s| s.as_str()).collect();
        insta::assert_snapshot!(proxy_keys.join(","), @"web");

        let health_keys: Vec<&str> = out.health.keys().map(|s| s.as_str()).collect();
        insta::assert_snapshot!(health_keys.join(","), @"db,web");
    }
}
