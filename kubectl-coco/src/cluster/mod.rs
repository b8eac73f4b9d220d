// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The cluster capabilities the transformation needs.

mod kubectl;
mod mock;

use std::{collections::BTreeMap, net::IpAddr, path::Path, time::Duration};

pub use kubectl::KubectlCluster;
pub use mock::MockCluster;

use crate::Result;

/// Namespace assumed when neither the manifest nor the context names one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Decoded content of a K8s Secret.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretData {
    pub r#type: Option<String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl SecretData {
    pub fn new<K: Into<String>, V: Into<Vec<u8>>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            r#type: None,
            data: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

pub trait Cluster {
    /// Namespace of the current context, [`DEFAULT_NAMESPACE`] if unset.
    fn current_namespace(&self) -> Result<String>;

    fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData>;

    /// First imagePullSecret of a ServiceAccount. `None` when the account
    /// does not exist or has none.
    fn get_service_account_pull_secret(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<Option<String>>;

    /// External and internal addresses of every node.
    fn node_addresses(&self) -> Result<Vec<IpAddr>>;

    fn has_runtime_class(&self, name: &str) -> Result<bool>;

    /// Name of the only pod matching `label_selector`.
    fn find_pod(&self, namespace: &str, label_selector: &str) -> Result<String>;

    fn wait_pod_ready(&self, namespace: &str, pod: &str, timeout: Duration) -> Result<()>;

    /// Copy the content of `local_dir` into `remote_dir` of the pod.
    fn copy_to_pod(&self, namespace: &str, pod: &str, local_dir: &Path, remote_dir: &str) -> Result<()>;

    fn apply(&self, manifest: &Path) -> Result<()>;
}
