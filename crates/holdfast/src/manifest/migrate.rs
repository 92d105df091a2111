//! Migration of unversioned legacy manifest files into the
//! `apiVersion`/`kind`/`spec` envelope.
//!
//! Legacy files carry no `apiVersion`/`kind` at all; their shape is the only
//! signal of intent. `classify` applies the structural cues from
//! `SPEC_FULL.md` §3 (an `includes` list with no `kind` is a Provision, a
//! `config`/`uses` pair is a Service, an `include` list naming other files
//! is a Stack) before wrapping the raw YAML body into a proper
//! [`ManifestDocument`].

use anyhow::{Context, Result, bail};
use holdfast_types::{ManifestDocument, ManifestKind, ManifestMetadata, ManifestSpec};
use serde_yaml::Value;

/// Parse a manifest file's text, migrating it to the current envelope if it
/// is legacy (no `apiVersion`/`kind` fields present).
pub fn load(text: &str) -> Result<ManifestDocument> {
    let raw: Value = serde_yaml::from_str(text).context("manifest is not valid YAML")?;

    if raw.get("apiVersion").is_some() && raw.get("kind").is_some() {
        return serde_yaml::from_str(text).context("failed to parse versioned manifest");
    }

    migrate_legacy(raw)
}

fn migrate_legacy(raw: Value) -> Result<ManifestDocument> {
    let mapping = raw.as_mapping().context("legacy manifest must be a YAML mapping")?;

    let kind = if mapping.contains_key("include") {
        ManifestKind::Stack
    } else if mapping.contains_key("config") || mapping.contains_key("uses") || mapping.contains_key("provisions") {
        ManifestKind::Service
    } else if mapping.contains_key("includes") {
        ManifestKind::Provision
    } else {
        bail!("could not classify legacy manifest: none of include/config/uses/provisions/includes present");
    };

    let spec = match kind {
        ManifestKind::Provision => ManifestSpec::Provision(
            serde_yaml::from_value(raw.clone()).context("failed to migrate legacy Provision body")?,
        ),
        ManifestKind::Service => ManifestSpec::Service(
            serde_yaml::from_value(raw.clone()).context("failed to migrate legacy Service body")?,
        ),
        ManifestKind::Stack => ManifestSpec::Stack(
            serde_yaml::from_value(raw.clone()).context("failed to migrate legacy Stack body")?,
        ),
    };

    Ok(ManifestDocument {
        api_version: "holdfast/v1".to_string(),
        kind,
        metadata: ManifestMetadata::default(),
        spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_service_is_classified_and_migrated() {
        let yaml = "image: nginx:latest\nconfig: {}\n";
        let doc = load(yaml).expect("load");
        assert_eq!(doc.kind, ManifestKind::Service);
        assert_eq!(doc.api_version, "holdfast/v1");
    }

    #[test]
    fn legacy_stack_is_classified() {
        let yaml = "services: [web]\ninclude: [other.yaml]\n";
        let doc = load(yaml).expect("load");
        assert_eq!(doc.kind, ManifestKind::Stack);
    }

    #[test]
    fn legacy_provision_is_classified() {
        let yaml = "path: /srv/app\nincludes: [templates/app]\n";
        let doc = load(yaml).expect("load");
        assert_eq!(doc.kind, ManifestKind::Provision);
    }

    #[test]
    fn versioned_manifest_is_parsed_directly() {
        let yaml = "apiVersion: holdfast/v1\nkind: Service\nspec:\n  image: nginx:latest\n";
        let doc = load(yaml).expect("load");
        assert_eq!(doc.kind, ManifestKind::Service);
    }

    #[test]
    fn unclassifiable_manifest_is_an_error() {
        let yaml = "foo: bar\n";
        assert!(load(yaml).is_err());
    }

    #[test]
    fn migration_is_idempotent() {
        let legacy = "image: nginx:latest\nconfig: {}\n";
        let migrated = load(legacy).expect("first migration");
        let reserialized = serde_yaml::to_string(&migrated).expect("serialize");
        let migrated_again = load(&reserialized).expect("second load");
        assert_eq!(migrated.kind, migrated_again.kind);
        assert_eq!(migrated.api_version, migrated_again.api_version);
    }
}
