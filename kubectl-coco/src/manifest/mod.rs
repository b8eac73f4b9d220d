// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Multi-document Kubernetes manifests.
//!
//! Documents stay untyped [`serde_yaml::Value`] trees so that unknown keys
//! round-trip verbatim; [`Kind`] tells where the pod spec and the pod
//! template metadata of each document live.

mod pod;
mod service;

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use serde_yaml::{Mapping, Value};

use crate::{Error, Result};

/// Suffix appended to the file stem of the transformed manifest.
pub const OUTPUT_SUFFIX: &str = "-coco";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Pod,
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    Job,
}

impl WorkloadKind {
    fn from_kind(kind: &str) -> Option<Self> {
        Some(match kind {
            "Pod" => Self::Pod,
            "Deployment" => Self::Deployment,
            "StatefulSet" => Self::StatefulSet,
            "DaemonSet" => Self::DaemonSet,
            "ReplicaSet" => Self::ReplicaSet,
            "Job" => Self::Job,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Workload(WorkloadKind),
    Service,
    Secret,
    Other(String),
}

impl Kind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "Service" => Kind::Service,
            "Secret" => Kind::Secret,
            other => WorkloadKind::from_kind(other)
                .map(Kind::Workload)
                .unwrap_or_else(|| Kind::Other(other.to_string())),
        }
    }

    pub fn is_workload(&self) -> bool {
        matches!(self, Kind::Workload(_))
    }
}

/// One YAML document.
#[derive(Clone, Debug)]
pub struct Manifest {
    kind: Kind,
    doc: Value,
    /// Source text, written back as-is while the document is untouched.
    raw: Option<String>,
    modified: bool,
}

impl Manifest {
    pub fn from_value(doc: Value) -> Result<Self> {
        let root = doc
            .as_mapping()
            .ok_or_else(|| Error::Manifest("document is not a mapping".into()))?;
        let kind = root
            .get("kind")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Manifest("document has no `kind`".into()))?;
        let has_name = root
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .is_some_and(|n| !n.is_empty());
        if !has_name {
            return Err(Error::Manifest(format!("{kind} has no `metadata.name`")));
        }

        Ok(Self {
            kind: Kind::parse(kind),
            doc,
            raw: None,
            modified: true,
        })
    }

    fn from_source(raw: &str, path: &str, index: usize) -> Result<Option<Self>> {
        let doc: Value = serde_yaml::from_str(raw).map_err(|source| Error::ManifestParse {
            path: path.to_string(),
            index,
            source,
        })?;
        if doc.is_null() {
            return Ok(None);
        }

        let mut manifest = Self::from_value(doc)
            .map_err(|e| Error::Manifest(format!("document {index} of {path}: {e}")))?;
        manifest.raw = Some(raw.to_string());
        manifest.modified = false;
        Ok(Some(manifest))
    }

    /// Load a file that holds exactly one document.
    pub fn load_single(path: &Path) -> Result<Self> {
        let mut set = ManifestSet::load_multi(path)?;
        match set.manifests.len() {
            1 => Ok(set.manifests.remove(0)),
            n => Err(Error::Manifest(format!(
                "{} holds {n} documents, expected exactly one",
                path.display()
            ))),
        }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn get_kind(&self) -> &str {
        self.doc
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get_name(&self) -> &str {
        self.doc
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The namespace, when the document sets a non-empty one.
    pub fn get_namespace(&self) -> Option<&str> {
        self.doc
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
    }

    pub fn value(&self) -> &Value {
        &self.doc
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    fn root_mut(&mut self) -> Result<&mut Mapping> {
        self.modified = true;
        self.doc
            .as_mapping_mut()
            .ok_or_else(|| Error::Manifest("document is not a mapping".into()))
    }

    fn workload_kind(&self) -> Result<WorkloadKind> {
        match self.kind {
            Kind::Workload(kind) => Ok(kind),
            _ => Err(Error::Manifest(format!(
                "{} {} is not a workload",
                self.get_kind(),
                self.get_name()
            ))),
        }
    }

    /// Pod spec: `spec` for a bare Pod, `spec.template.spec` for controllers.
    pub fn get_pod_spec(&self) -> Result<&Mapping> {
        let kind = self.workload_kind()?;
        let spec = self
            .doc
            .get("spec")
            .ok_or_else(|| self.missing("spec"))?;
        let pod_spec = match kind {
            WorkloadKind::Pod => spec,
            _ => spec
                .get("template")
                .and_then(|t| t.get("spec"))
                .ok_or_else(|| self.missing("spec.template.spec"))?,
        };
        pod_spec
            .as_mapping()
            .ok_or_else(|| Error::Manifest(format!("pod spec of {} is not a mapping", self.get_name())))
    }

    pub fn pod_spec_mut(&mut self) -> Result<&mut Mapping> {
        let kind = self.workload_kind()?;
        let name = self.get_name().to_string();
        let missing = |field: &str| Error::Manifest(format!("{name} has no `{field}`"));
        let root = self.root_mut()?;
        let spec = root
            .get_mut("spec")
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| missing("spec"))?;
        match kind {
            WorkloadKind::Pod => Ok(spec),
            _ => spec
                .get_mut("template")
                .and_then(|t| t.get_mut("spec"))
                .and_then(Value::as_mapping_mut)
                .ok_or_else(|| missing("spec.template.spec")),
        }
    }

    /// Metadata of the pod: `metadata` for a bare Pod, `spec.template.metadata`
    /// for controllers. Never the controller's own metadata.
    pub fn pod_template_metadata(&self) -> Option<&Mapping> {
        let metadata = match self.workload_kind().ok()? {
            WorkloadKind::Pod => self.doc.get("metadata")?,
            _ => self.doc.get("spec")?.get("template")?.get("metadata")?,
        };
        metadata.as_mapping()
    }

    pub fn pod_template_metadata_mut(&mut self) -> Result<&mut Mapping> {
        let kind = self.workload_kind()?;
        let name = self.get_name().to_string();
        let root = self.root_mut()?;
        match kind {
            WorkloadKind::Pod => mapping_entry(root, "metadata"),
            _ => {
                let template = root
                    .get_mut("spec")
                    .and_then(Value::as_mapping_mut)
                    .and_then(|spec| spec.get_mut("template"))
                    .and_then(Value::as_mapping_mut)
                    .ok_or_else(|| Error::Manifest(format!("{name} has no `spec.template`")))?;
                mapping_entry(template, "metadata")
            }
        }
    }

    pub fn get_pod_labels(&self) -> BTreeMap<String, String> {
        string_map(self.pod_template_metadata().and_then(|m| m.get("labels")))
    }

    pub fn get_annotation(&self, key: &str) -> Option<&str> {
        self.pod_template_metadata()?
            .get("annotations")?
            .get(key)?
            .as_str()
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) -> Result<()> {
        let metadata = self.pod_template_metadata_mut()?;
        let annotations = mapping_entry(metadata, "annotations")?;
        annotations.insert(Value::from(key), Value::from(value));
        Ok(())
    }

    pub fn set_runtime_class(&mut self, runtime_class: &str) -> Result<()> {
        let spec = self.pod_spec_mut()?;
        spec.insert(
            Value::from("runtimeClassName"),
            Value::from(runtime_class),
        );
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        match (&self.raw, self.modified) {
            (Some(raw), false) => Ok(format!("{}\n", raw.trim_matches('\n'))),
            _ => Ok(serde_yaml::to_string(&self.doc)?),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?)
            .map_err(|e| Error::io(format!("write manifest {}", path.display()), e))
    }

    fn missing(&self, field: &str) -> Error {
        Error::Manifest(format!("{} has no `{field}`", self.get_name()))
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.get_kind(), self.get_name())
    }
}

/// Ordered documents of one manifest file.
#[derive(Clone, Debug, Default)]
pub struct ManifestSet {
    manifests: Vec<Manifest>,
}

impl ManifestSet {
    pub fn load_multi(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read manifest {}", path.display()), e))?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Split `content` on `---` document separators and parse each part.
    pub fn parse(content: &str, source: &str) -> Result<Self> {
        let mut manifests = Vec::new();
        for (index, raw) in split_documents(content).iter().enumerate() {
            if let Some(manifest) = Manifest::from_source(raw, source, index)? {
                manifests.push(manifest);
            }
        }

        if manifests.is_empty() {
            return Err(Error::Manifest(format!("{source} holds no documents")));
        }
        Ok(Self { manifests })
    }

    pub fn manifests(&self) -> &[Manifest] {
        &self.manifests
    }

    pub fn push(&mut self, manifest: Manifest) {
        self.manifests.push(manifest);
    }

    /// Replace the document of the same kind and name, or append.
    pub fn upsert(&mut self, manifest: Manifest) {
        match self
            .manifests
            .iter_mut()
            .find(|m| m.get_kind() == manifest.get_kind() && m.get_name() == manifest.get_name())
        {
            Some(existing) => *existing = manifest,
            None => self.manifests.push(manifest),
        }
    }

    fn primary_index(&self) -> Option<usize> {
        self.manifests.iter().position(|m| m.kind.is_workload())
    }

    /// First workload document in document order.
    pub fn get_primary_manifest(&self) -> Option<&Manifest> {
        self.primary_index().map(|i| &self.manifests[i])
    }

    pub fn get_primary_manifest_mut(&mut self) -> Option<&mut Manifest> {
        self.primary_index().map(move |i| &mut self.manifests[i])
    }

    /// First Service document in document order.
    pub fn get_service_manifest(&self) -> Option<&Manifest> {
        self.manifests.iter().find(|m| m.kind == Kind::Service)
    }

    pub fn to_yaml(&self) -> Result<String> {
        let docs = self
            .manifests
            .iter()
            .map(Manifest::to_yaml)
            .collect::<Result<Vec<_>>>()?;
        Ok(docs.join("---\n"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?)
            .map_err(|e| Error::io(format!("write manifest {}", path.display()), e))
    }

    /// Write the set next to `input` as `<stem>-coco<ext>` and return that path.
    pub fn backup(&self, input: &Path) -> Result<PathBuf> {
        let path = backup_path(input);
        self.save(&path)?;
        Ok(path)
    }
}

/// `app.yaml` → `app-coco.yaml`. Re-running on an output keeps its name.
pub fn backup_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = stem.strip_suffix(OUTPUT_SUFFIX).unwrap_or(&stem);
    let file_name = match input.extension() {
        Some(ext) => format!("{stem}{OUTPUT_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{OUTPUT_SUFFIX}"),
    };
    input.with_file_name(file_name)
}

fn split_documents(content: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        let is_separator = line.trim_end() == "---" || line.starts_with("--- ");
        if is_separator {
            docs.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    docs.push(current);
    docs.retain(|d| {
        d.lines().any(|l| {
            let l = l.trim();
            !l.is_empty() && !l.starts_with('#')
        })
    });
    docs
}

pub(crate) fn mapping_entry<'a>(map: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping> {
    let entry = map
        .entry(Value::from(key))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if entry.is_null() {
        *entry = Value::Mapping(Mapping::new());
    }
    entry
        .as_mapping_mut()
        .ok_or_else(|| Error::Manifest(format!("`{key}` is not a mapping")))
}

pub(crate) fn sequence_entry<'a>(map: &'a mut Mapping, key: &str) -> Result<&'a mut Vec<Value>> {
    let entry = map
        .entry(Value::from(key))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if entry.is_null() {
        *entry = Value::Sequence(Vec::new());
    }
    entry
        .as_sequence_mut()
        .ok_or_else(|| Error::Manifest(format!("`{key}` is not a list")))
}

pub(crate) fn get_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_mapping)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use rstest::rstest;

    use super::*;

    pub(crate) fn parse_one(yaml: &str) -> Manifest {
        ManifestSet::parse(yaml, "test.yaml")
            .unwrap()
            .manifests
            .remove(0)
    }

    const MULTI: &str = r#"# leading comment
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  ports:
  - port: 80
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: shop
spec:
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
      - name: web
        image: nginx
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: extra
data:
  key:   "spaced   value"
"#;

    #[test]
    fn load_multi_orders_documents() {
        let set = ManifestSet::parse(MULTI, "multi.yaml").unwrap();
        assert_eq!(set.manifests().len(), 3);
        let primary = set.get_primary_manifest().unwrap();
        assert_eq!(primary.get_kind(), "Deployment");
        assert_eq!(primary.get_namespace(), Some("shop"));
        assert_eq!(set.get_service_manifest().unwrap().get_name(), "web");
        assert_eq!(
            primary.get_pod_labels(),
            BTreeMap::from([("app".to_string(), "web".to_string())])
        );
    }

    #[test]
    fn untouched_documents_keep_their_bytes() {
        let mut set = ManifestSet::parse(MULTI, "multi.yaml").unwrap();
        set.get_primary_manifest_mut()
            .unwrap()
            .set_runtime_class("kata-cc")
            .unwrap();
        let out = set.to_yaml().unwrap();
        assert!(out.starts_with("# leading comment\napiVersion: v1\nkind: Service\n"));
        assert!(out.contains("key:   \"spaced   value\""));
        assert!(out.contains("runtimeClassName: kata-cc"));
        assert_eq!(out.matches("---\n").count(), 2);
    }

    #[rstest]
    #[case("kind: Pod\nmetadata: {}\n")]
    #[case("metadata:\n  name: x\n")]
    #[case("- a\n- b\n")]
    fn invalid_documents(#[case] yaml: &str) {
        assert!(matches!(
            ManifestSet::parse(yaml, "bad.yaml"),
            Err(Error::Manifest(_))
        ));
    }

    #[test]
    fn unparsable_yaml() {
        assert!(matches!(
            ManifestSet::parse("kind: [unclosed\n", "bad.yaml"),
            Err(Error::ManifestParse { index: 0, .. })
        ));
    }

    #[test]
    fn empty_file() {
        assert!(ManifestSet::parse("---\n# nothing\n---\n", "empty.yaml").is_err());
    }

    #[rstest]
    #[case("Pod", false)]
    #[case("Deployment", true)]
    #[case("StatefulSet", true)]
    #[case("DaemonSet", true)]
    #[case("ReplicaSet", true)]
    #[case("Job", true)]
    fn annotation_placement(#[case] kind: &str, #[case] templated: bool) {
        let yaml = if templated {
            format!("kind: {kind}\nmetadata:\n  name: app\nspec:\n  template:\n    spec:\n      containers: []\n")
        } else {
            format!("kind: {kind}\nmetadata:\n  name: app\nspec:\n  containers: []\n")
        };
        let mut manifest = parse_one(&yaml);
        manifest.set_annotation("io.example/key", "v").unwrap();
        assert_eq!(manifest.get_annotation("io.example/key"), Some("v"));

        let doc = manifest.value();
        let outer = doc["metadata"].get("annotations");
        let template = doc["spec"]
            .get("template")
            .and_then(|t| t.get("metadata"))
            .and_then(|m| m.get("annotations"));
        if templated {
            assert!(outer.is_none());
            assert_eq!(template.unwrap()["io.example/key"], Value::from("v"));
        } else {
            assert_eq!(outer.unwrap()["io.example/key"], Value::from("v"));
            assert!(template.is_none());
        }
    }

    #[test]
    fn pod_spec_errors() {
        let mut no_template = parse_one("kind: Deployment\nmetadata:\n  name: d\nspec:\n  replicas: 1\n");
        assert!(no_template.get_pod_spec().is_err());
        assert!(no_template.set_runtime_class("kata").is_err());

        let no_spec = parse_one("kind: Pod\nmetadata:\n  name: p\n");
        assert!(no_spec.get_pod_spec().is_err());

        let service = parse_one("kind: Service\nmetadata:\n  name: s\nspec: {}\n");
        assert!(service.get_pod_spec().is_err());
    }

    #[test]
    fn upsert_replaces_same_kind_and_name() {
        let mut set = ManifestSet::parse(MULTI, "multi.yaml").unwrap();
        let secret = |value: &str| {
            Manifest::from_value(
                serde_yaml::from_str(&format!("kind: Secret\nmetadata:\n  name: web\nstringData:\n  k: {value}\n"))
                    .unwrap(),
            )
            .unwrap()
        };
        set.upsert(secret("a"));
        set.upsert(secret("b"));
        assert_eq!(set.manifests().len(), 4);
        assert_eq!(set.manifests()[3].value()["stringData"]["k"], Value::from("b"));
    }

    #[rstest]
    #[case("deploy/app.yaml", "deploy/app-coco.yaml")]
    #[case("app.yml", "app-coco.yml")]
    #[case("app", "app-coco")]
    #[case("app-coco.yaml", "app-coco.yaml")]
    fn backup_names(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(backup_path(Path::new(input)), PathBuf::from(expected));
    }

    #[test]
    fn save_and_load_single() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pod.yaml");
        let mut manifest = parse_one("kind: Pod\nmetadata:\n  name: p\nspec:\n  containers: []\n");
        manifest.set_runtime_class("kata-cc").unwrap();
        manifest.save(&path).unwrap();

        let loaded = Manifest::load_single(&path).unwrap();
        assert_eq!(
            loaded.get_pod_spec().unwrap().get("runtimeClassName"),
            Some(&Value::from("kata-cc"))
        );
    }
}
