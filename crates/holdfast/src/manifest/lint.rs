//! Static checks run over a resolved set of services before rendering:
//! port collisions and `depends_on` cycles.

use std::collections::BTreeMap;

use holdfast_types::ServiceSpec;

use super::cycle::{Cycle, find_cycle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintFinding {
    PortConflict { host_port: u16, services: Vec<String> },
    DependencyCycle(Cycle),
    UnknownDependency { service: String, missing: String },
}

impl std::fmt::Display for LintFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LintFinding::PortConflict { host_port, services } => {
                write!(f, "host port {host_port} is claimed by more than one service: {}", services.join(", "))
            }
            LintFinding::DependencyCycle(cycle) => write!(f, "dependency cycle: {cycle}"),
            LintFinding::UnknownDependency { service, missing } => {
                write!(f, "service '{service}' depends on unknown service '{missing}'")
            }
        }
    }
}

/// Lint a resolved service map. Returns every finding rather than stopping
/// at the first, so a single `lint` invocation reports the whole problem
/// set at once.
pub fn lint_services(services: &BTreeMap<String, ServiceSpec>) -> Vec<LintFinding> {
    let mut findings = Vec::new();

    let mut by_port: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for (name, spec) in services {
        for port in &spec.ports {
            by_port.entry(port.host).or_default().push(name.clone());
        }
    }
    for (host_port, mut owners) in by_port {
        if owners.len() > 1 {
            owners.sort();
            findings.push(LintFinding::PortConflict { host_port, services: owners });
        }
    }

    for (name, spec) in services {
        for dep in &spec.depends_on {
            if !services.contains_key(dep) {
                findings.push(LintFinding::UnknownDependency {
                    service: name.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }

    let graph: BTreeMap<String, Vec<String>> = services
        .iter()
        .map(|(name, spec)| (name.clone(), spec.depends_on.clone()))
        .collect();
    if let Some(cycle) = find_cycle(&graph) {
        findings.push(LintFinding::DependencyCycle(cycle));
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_types::PortMapping;

    fn service(ports: &[u16], depends_on: &[&str]) -> ServiceSpec {
        ServiceSpec {
            image: "img".to_string(),
            provisions: vec![],
            ports: ports
                .iter()
                .map(|p| PortMapping { host: *p, container: *p, protocol: "tcp".to_string() })
                .collect(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            config: Default::default(),
            health: None,
        }
    }

    #[test]
    fn clean_graph_has_no_findings() {
        let mut services = BTreeMap::new();
        services.insert("a".to_string(), service(&[8080], &[]));
        services.insert("b".to_string(), service(&[8081], &["a"]));
        assert!(lint_services(&services).is_empty());
    }

    #[test]
    fn detects_port_conflict() {
        let mut services = BTreeMap::new();
        services.insert("a".to_string(), service(&[8080], &[]));
        services.insert("b".to_string(), service(&[8080], &[]));
        let findings = lint_services(&services);
        assert!(findings.iter().any(|f| matches!(f, LintFinding::PortConflict { host_port: 8080, .. })));
    }

    #[test]
    fn detects_unknown_dependency() {
        let mut services = BTreeMap::new();
        services.insert("a".to_string(), service(&[], &["ghost"]));
        let findings = lint_services(&services);
        assert!(findings.iter().any(|f| matches!(f, LintFinding::UnknownDependency { .. })));
    }

    #[test]
    fn detects_dependency_cycle() {
        let mut services = BTreeMap::new();
        services.insert("a".to_string(), service(&[], &["b"]));
        services.insert("b".to_string(), service(&[], &["a"]));
        let findings = lint_services(&services);
        assert!(findings.iter().any(|f| matches!(f, LintFinding::DependencyCycle(_))));
    }
}
