// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    net::IpAddr,
    path::Path,
    sync::Mutex,
    time::Duration,
};

use super::{Cluster, SecretData, DEFAULT_NAMESPACE};
use crate::{Error, Result};

/// In-memory [`Cluster`]. Copies into pods and applied manifests are
/// recorded instead of sent anywhere.
#[derive(Debug)]
pub struct MockCluster {
    namespace: String,
    secrets: BTreeMap<(String, String), SecretData>,
    service_accounts: BTreeMap<(String, String), String>,
    nodes: Vec<IpAddr>,
    runtime_classes: BTreeSet<String>,
    /// `(namespace, label selector)` → pod names
    pods: BTreeMap<(String, String), Vec<String>>,
    pod_ready: bool,
    reject_apply: bool,
    pod_files: Mutex<BTreeMap<String, Vec<u8>>>,
    applied: Mutex<Vec<String>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.into(),
            secrets: BTreeMap::new(),
            service_accounts: BTreeMap::new(),
            nodes: Vec::new(),
            runtime_classes: BTreeSet::new(),
            pods: BTreeMap::new(),
            pod_ready: true,
            reject_apply: false,
            pod_files: Mutex::new(BTreeMap::new()),
            applied: Mutex::new(Vec::new()),
        }
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_secret(mut self, namespace: &str, name: &str, secret: SecretData) -> Self {
        self.secrets.insert((namespace.into(), name.into()), secret);
        self
    }

    pub fn with_service_account(mut self, namespace: &str, name: &str, pull_secret: &str) -> Self {
        self.service_accounts
            .insert((namespace.into(), name.into()), pull_secret.into());
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<IpAddr>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_runtime_class(mut self, name: &str) -> Self {
        self.runtime_classes.insert(name.into());
        self
    }

    pub fn with_pod(mut self, namespace: &str, label_selector: &str, name: &str) -> Self {
        self.pods
            .entry((namespace.into(), label_selector.into()))
            .or_default()
            .push(name.into());
        self
    }

    pub fn with_pod_ready(mut self, ready: bool) -> Self {
        self.pod_ready = ready;
        self
    }

    pub fn rejecting_apply(mut self) -> Self {
        self.reject_apply = true;
        self
    }

    /// Files copied into pods, keyed by `<namespace>/<pod>:<absolute path>`.
    pub fn pod_files(&self) -> BTreeMap<String, Vec<u8>> {
        self.pod_files
            .lock()
            .map(|files| files.clone())
            .unwrap_or_default()
    }

    /// Content of every applied manifest, in order.
    pub fn applied(&self) -> Vec<String> {
        self.applied
            .lock()
            .map(|applied| applied.clone())
            .unwrap_or_default()
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io(format!("read {}", dir.display()), e))?;
    for entry in entries {
        let path = entry
            .map_err(|e| Error::io(format!("read {}", dir.display()), e))?
            .path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let content = fs::read(&path).map_err(|e| Error::io(format!("read {}", path.display()), e))?;
        let relative = path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        out.push((relative, content));
    }
    Ok(())
}

impl Cluster for MockCluster {
    fn current_namespace(&self) -> Result<String> {
        Ok(self.namespace.clone())
    }

    fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData> {
        self.secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::Resolution(format!("secret {namespace}/{name} not found")))
    }

    fn get_service_account_pull_secret(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .service_accounts
            .get(&(namespace.to_string(), service_account.to_string()))
            .cloned())
    }

    fn node_addresses(&self) -> Result<Vec<IpAddr>> {
        Ok(self.nodes.clone())
    }

    fn has_runtime_class(&self, name: &str) -> Result<bool> {
        Ok(self.runtime_classes.contains(name))
    }

    fn find_pod(&self, namespace: &str, label_selector: &str) -> Result<String> {
        match self
            .pods
            .get(&(namespace.to_string(), label_selector.to_string()))
            .map(Vec::as_slice)
        {
            Some([name]) => Ok(name.clone()),
            Some(names) if names.len() > 1 => Err(Error::Cluster(format!(
                "{} pods match {label_selector} in namespace {namespace}",
                names.len()
            ))),
            _ => Err(Error::Cluster(format!(
                "no pod matches {label_selector} in namespace {namespace}"
            ))),
        }
    }

    fn wait_pod_ready(&self, namespace: &str, pod: &str, timeout: Duration) -> Result<()> {
        if self.pod_ready {
            return Ok(());
        }
        Err(Error::Cluster(format!(
            "pod {namespace}/{pod} not ready after {}s",
            timeout.as_secs()
        )))
    }

    fn copy_to_pod(&self, namespace: &str, pod: &str, local_dir: &Path, remote_dir: &str) -> Result<()> {
        let mut files = Vec::new();
        collect_files(local_dir, local_dir, &mut files)?;
        let mut pod_files = self
            .pod_files
            .lock()
            .map_err(|_| Error::Cluster("mock cluster state poisoned".into()))?;
        for (relative, content) in files {
            let target = format!("{}/{relative}", remote_dir.trim_end_matches('/'));
            pod_files.insert(format!("{namespace}/{pod}:{target}"), content);
        }
        Ok(())
    }

    fn apply(&self, manifest: &Path) -> Result<()> {
        if self.reject_apply {
            return Err(Error::Cluster(format!(
                "admission webhook denied {}",
                manifest.display()
            )));
        }
        let content = fs::read_to_string(manifest)
            .map_err(|e| Error::io(format!("read {}", manifest.display()), e))?;
        self.applied
            .lock()
            .map_err(|_| Error::Cluster("mock cluster state poisoned".into()))?
            .push(content);
        Ok(())
    }
}
