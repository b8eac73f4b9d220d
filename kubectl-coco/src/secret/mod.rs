// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Secret references of a pod spec and how each one gets rewritten.

mod detect;
mod rewrite;

use std::collections::BTreeMap;

use log::debug;

pub use detect::{detect_secrets, service_account_name};
pub use rewrite::{RewriteOutcome, SecretRewriter, SEALED_SUFFIX};

use crate::{cluster::Cluster, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageType {
    Env,
    EnvFrom,
    Volume,
    /// `secret` source of a projected volume. It keeps reading the renamed
    /// `-sealed` Secret, so its keys must end up in there.
    Projected,
    ImagePullSecrets,
}

/// One `items` entry of a secret volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyToPath {
    pub key: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretUsage {
    pub r#type: UsageType,
    pub container_name: String,
    pub env_var_name: String,
    pub key: String,
    pub volume_name: String,
    pub mount_path: String,
    /// Item selector of a volume usage, empty when the whole secret is projected.
    pub items: Vec<KeyToPath>,
}

impl SecretUsage {
    pub(crate) fn new(r#type: UsageType) -> Self {
        Self {
            r#type,
            container_name: String::new(),
            env_var_name: String::new(),
            key: String::new(),
            volume_name: String::new(),
            mount_path: String::new(),
            items: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,
    /// Empty when the manifest names no namespace.
    pub namespace: String,
    pub keys: Vec<String>,
    /// At least one usage needs the full key set from the cluster.
    pub needs_lookup: bool,
    pub usages: Vec<SecretUsage>,
}

impl SecretReference {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            keys: Vec::new(),
            needs_lookup: false,
            usages: Vec::new(),
        }
    }

    pub(crate) fn add_key(&mut self, key: &str) {
        if !self.keys.iter().any(|k| k == key) {
            self.keys.push(key.to_string());
        }
    }

    pub fn has_usage(&self, r#type: UsageType) -> bool {
        self.usages.iter().any(|u| u.r#type == r#type)
    }

    /// Whether anything but `imagePullSecrets` uses the secret.
    pub fn has_workload_usage(&self) -> bool {
        self.usages
            .iter()
            .any(|u| u.r#type != UsageType::ImagePullSecrets)
    }
}

/// A reference whose namespace and keys are settled, with the values read
/// from the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSecret {
    pub reference: SecretReference,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl ResolvedSecret {
    /// Keys to upload and seal, in reference order.
    pub fn keys(&self) -> &[String] {
        &self.reference.keys
    }
}

/// Read every referenced secret. References without a namespace resolve
/// against `namespace`. Ones that need a lookup take every key of the secret.
pub fn inspect(
    references: Vec<SecretReference>,
    cluster: &dyn Cluster,
    namespace: &str,
) -> Result<Vec<ResolvedSecret>> {
    references
        .into_iter()
        .map(|mut reference| {
            if reference.namespace.is_empty() {
                reference.namespace = namespace.to_string();
            }
            let secret = cluster.get_secret(&reference.namespace, &reference.name)?;
            debug!(
                "secret {}/{} has keys {:?}",
                reference.namespace,
                reference.name,
                secret.data.keys().collect::<Vec<_>>()
            );

            if reference.needs_lookup {
                for key in secret.data.keys() {
                    reference.add_key(key);
                }
            }

            if reference.keys.is_empty() {
                return Err(Error::Resolution(format!(
                    "secret {}/{} has no keys",
                    reference.namespace, reference.name
                )));
            }
            if let Some(missing) = reference.keys.iter().find(|k| !secret.data.contains_key(*k)) {
                return Err(Error::Resolution(format!(
                    "secret {}/{} has no key {missing}",
                    reference.namespace, reference.name
                )));
            }

            Ok(ResolvedSecret {
                reference,
                data: secret.data,
            })
        })
        .collect()
}
