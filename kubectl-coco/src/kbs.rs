// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Upload resources into the repository of the Trustee KBS pod.
//!
//! Writes are last-writer-wins per path, there is no locking between
//! concurrent callers.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fs,
    path::Path,
    time::Duration,
};

use log::info;

use crate::{cluster::Cluster, Error, Result};

pub const KBS_REPOSITORY_BASE: &str = "/opt/confidential-containers/kbs/repository";

pub const KBS_POD_SELECTOR: &str = "app=kbs";

pub const KBS_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Resource the default attestation check fetches.
pub const ATTESTATION_STATUS_PATH: &str = "default/attestation-status/status";

pub const ATTESTATION_STATUS_VALUE: &[u8] = b"success";

/// Add one resource. Keys that only differ in leading dots share a
/// repository path, so a second write to a path is refused.
pub fn add_resource(resources: &mut BTreeMap<String, Vec<u8>>, path: String, content: Vec<u8>) -> Result<()> {
    match resources.entry(path) {
        Entry::Occupied(entry) => Err(Error::Resolution(format!(
            "two resources map to KBS path {}",
            entry.key()
        ))),
        Entry::Vacant(entry) => {
            entry.insert(content);
            Ok(())
        }
    }
}

/// [`add_resource`] for every entry of `other`.
pub fn merge_resources(resources: &mut BTreeMap<String, Vec<u8>>, other: BTreeMap<String, Vec<u8>>) -> Result<()> {
    other
        .into_iter()
        .try_for_each(|(path, content)| add_resource(resources, path, content))
}

pub struct KbsPopulator<'a> {
    cluster: &'a dyn Cluster,
    namespace: String,
    timeout: Duration,
}

impl<'a> KbsPopulator<'a> {
    /// `namespace` is the one the KBS pod runs in.
    pub fn new(cluster: &'a dyn Cluster, namespace: &str) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            timeout: KBS_READY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Write every `path → content` below [`KBS_REPOSITORY_BASE`]. On failure
    /// the error lists every path.
    pub fn upload(&self, resources: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }

        self.try_upload(resources).map_err(|e| Error::Population {
            missing: resources.keys().cloned().collect(),
            source: Box::new(e),
        })?;

        info!(
            "uploaded {} resources to KBS in namespace {}",
            resources.len(),
            self.namespace
        );
        Ok(())
    }

    fn try_upload(&self, resources: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let pod = self.cluster.find_pod(&self.namespace, KBS_POD_SELECTOR)?;
        self.cluster
            .wait_pod_ready(&self.namespace, &pod, self.timeout)?;

        let staging = tempfile::tempdir().map_err(|e| Error::io("create staging directory", e))?;
        stage(staging.path(), resources)?;
        self.cluster
            .copy_to_pod(&self.namespace, &pod, staging.path(), KBS_REPOSITORY_BASE)
    }
}

/// Mirror the repository tree of `resources` below `root`.
fn stage(root: &Path, resources: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    for (path, content) in resources {
        let relative = Path::new(path);
        if relative.is_absolute() || path.split('/').any(|s| s.is_empty() || s == "..") {
            return Err(Error::Resolution(format!("invalid KBS resource path {path}")));
        }

        let target = root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }
        fs::write(&target, content).map_err(|e| Error::io(format!("write {}", target.display()), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::cluster::MockCluster;

    fn resources() -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            ("default/db/pw".to_string(), b"hunter2".to_vec()),
            (ATTESTATION_STATUS_PATH.to_string(), ATTESTATION_STATUS_VALUE.to_vec()),
        ])
    }

    #[test]
    fn upload_mirrors_tree() {
        let cluster = MockCluster::new().with_pod("trustee", KBS_POD_SELECTOR, "kbs-0");
        KbsPopulator::new(&cluster, "trustee")
            .upload(&resources())
            .unwrap();

        let files = cluster.pod_files();
        assert_eq!(
            files["trustee/kbs-0:/opt/confidential-containers/kbs/repository/default/db/pw"],
            b"hunter2".to_vec()
        );
        assert_eq!(
            files["trustee/kbs-0:/opt/confidential-containers/kbs/repository/default/attestation-status/status"],
            b"success".to_vec()
        );
    }

    #[rstest]
    #[case::no_pod(MockCluster::new())]
    #[case::not_ready(MockCluster::new()
        .with_pod("trustee", KBS_POD_SELECTOR, "kbs-0")
        .with_pod_ready(false))]
    #[case::two_pods(MockCluster::new()
        .with_pod("trustee", KBS_POD_SELECTOR, "kbs-0")
        .with_pod("trustee", KBS_POD_SELECTOR, "kbs-1"))]
    fn failures_list_missing_paths(#[case] cluster: MockCluster) {
        let err = KbsPopulator::new(&cluster, "trustee")
            .upload(&resources())
            .unwrap_err();
        match err {
            Error::Population { missing, .. } => {
                assert_eq!(missing, vec!["default/attestation-status/status", "default/db/pw"])
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(cluster.pod_files().is_empty());
    }

    #[test]
    fn colliding_paths_are_refused() {
        let mut resources = BTreeMap::new();
        add_resource(&mut resources, "default/s/a".into(), b"1".to_vec()).unwrap();
        assert!(matches!(
            add_resource(&mut resources, "default/s/a".into(), b"2".to_vec()),
            Err(Error::Resolution(_))
        ));
        assert_eq!(resources["default/s/a"], b"1".to_vec());

        let other = BTreeMap::from([
            ("default/t/b".to_string(), b"3".to_vec()),
            ("default/s/a".to_string(), b"4".to_vec()),
        ]);
        assert!(merge_resources(&mut resources, other).is_err());
    }

    #[rstest]
    #[case("../escape")]
    #[case("/abs/path")]
    #[case("a//b")]
    fn rejects_bad_paths(#[case] path: &str) {
        let dir = tempfile::tempdir().unwrap();
        let resources = BTreeMap::from([(path.to_string(), b"x".to_vec())]);
        assert!(stage(dir.path(), &resources).is_err());
    }
}
