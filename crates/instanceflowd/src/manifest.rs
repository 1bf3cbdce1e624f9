//! Record manifests accepted by `apply`
//!
//! ```yaml
//! metadata:
//!   name: web
//!   labels:
//!     team: platform
//! spec:
//!   amiId: ami-0abcdef
//!   instanceType: t3.small
//!   region: us-east-1
//! ```
//!
//! A file may hold several documents separated by `---`.

use anyhow::Context;
use instanceflow_controlplane::{DesiredInstanceSpec, InstanceRecord, RecordKey};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub metadata: ManifestMeta,
    pub spec: DesiredInstanceSpec,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Manifest {
    pub fn key(&self) -> RecordKey {
        match &self.metadata.namespace {
            Some(namespace) => RecordKey::new(namespace, &self.metadata.name),
            None => RecordKey::named(&self.metadata.name),
        }
    }

    pub fn into_record(self) -> InstanceRecord {
        let mut record = InstanceRecord::new(&self.key(), self.spec);
        record.metadata.labels = self.metadata.labels;
        record
    }
}

pub fn parse(content: &str) -> anyhow::Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("document {} is not valid YAML", index + 1))?;
        if value.is_null() {
            continue;
        }
        let manifest: Manifest = serde_yaml::from_value(value)
            .with_context(|| format!("document {} is not a valid manifest", index + 1))?;
        if manifest.metadata.name.trim().is_empty() {
            anyhow::bail!("document {} has an empty metadata.name", index + 1);
        }
        manifests.push(manifest);
    }
    Ok(manifests)
}

pub fn load(path: &Path) -> anyhow::Result<Vec<Manifest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse(&content).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_document() {
        let manifests = parse(
            r#"
metadata:
  name: web
  labels:
    team: platform
spec:
  amiId: ami-1
  instanceType: t3.small
  region: us-east-1
  associatePublicIp: true
  storage:
    rootVolume:
      sizeGb: 20
"#,
        )
        .unwrap();

        assert_eq!(manifests.len(), 1);
        let record = manifests.into_iter().next().unwrap().into_record();
        assert_eq!(record.key(), RecordKey::named("web"));
        assert_eq!(record.metadata.labels["team"], "platform");
        assert!(record.spec.associate_public_ip);
        assert_eq!(record.spec.storage.root_volume.unwrap().size_gb, 20);
    }

    #[test]
    fn test_parse_multiple_documents() {
        let manifests = parse(
            r#"
metadata:
  name: web
spec: {amiId: ami-1, instanceType: t3.small, region: us-east-1}
---
metadata:
  name: db
  namespace: data
spec: {amiId: ami-2, instanceType: r6g.large, region: eu-west-1}
---
"#,
        )
        .unwrap();

        let keys: Vec<String> = manifests.iter().map(|m| m.key().to_string()).collect();
        assert_eq!(keys, vec!["default/web", "data/db"]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = parse(
            r#"
metadata:
  name: web
spec:
  amiId: ami-1
  instanceType: t3.small
  region: us-east-1
status:
  state: running
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = parse("metadata: {name: ''}\nspec: {amiId: a, instanceType: b, region: c}\n");
        assert!(result.is_err());
    }
}
