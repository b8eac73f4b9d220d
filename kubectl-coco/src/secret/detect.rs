// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde_yaml::Value;

use super::{KeyToPath, SecretReference, SecretUsage, UsageType};
use crate::{manifest::Manifest, Result};

const DEFAULT_SERVICE_ACCOUNT: &str = "default";

fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn list<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_sequence)
        .into_iter()
        .flatten()
}

/// References keyed by secret name, in order of first appearance.
struct Collector {
    namespace: String,
    references: Vec<SecretReference>,
}

impl Collector {
    fn entry(&mut self, name: &str) -> &mut SecretReference {
        let index = match self.references.iter().position(|r| r.name == name) {
            Some(index) => index,
            None => {
                self.references
                    .push(SecretReference::new(name, &self.namespace));
                self.references.len() - 1
            }
        };
        &mut self.references[index]
    }

    fn container(&mut self, container: &Value) {
        let container_name = str_at(container, "name").unwrap_or_default();

        for env in list(container, "env") {
            let Some(key_ref) = env.get("valueFrom").and_then(|v| v.get("secretKeyRef")) else {
                continue;
            };
            let (Some(secret), Some(key)) = (str_at(key_ref, "name"), str_at(key_ref, "key")) else {
                continue;
            };
            let reference = self.entry(secret);
            reference.add_key(key);
            let mut usage = SecretUsage::new(UsageType::Env);
            usage.container_name = container_name.into();
            usage.env_var_name = str_at(env, "name").unwrap_or_default().into();
            usage.key = key.into();
            reference.usages.push(usage);
        }

        for env_from in list(container, "envFrom") {
            let Some(secret) = env_from.get("secretRef").and_then(|r| str_at(r, "name")) else {
                continue;
            };
            let reference = self.entry(secret);
            reference.needs_lookup = true;
            let mut usage = SecretUsage::new(UsageType::EnvFrom);
            usage.container_name = container_name.into();
            reference.usages.push(usage);
        }
    }

    /// A `secret` volume or a `secret` source of a projected volume.
    fn volume_source(&mut self, secret: &str, source: &Value, volume_name: &str, r#type: UsageType) {
        let items: Vec<KeyToPath> = list(source, "items")
            .filter_map(|item| {
                let key = str_at(item, "key")?;
                Some(KeyToPath {
                    key: key.into(),
                    path: str_at(item, "path").unwrap_or(key).into(),
                })
            })
            .collect();

        let reference = self.entry(secret);
        if items.is_empty() {
            reference.needs_lookup = true;
        }
        for item in &items {
            reference.add_key(&item.key);
        }
        let mut usage = SecretUsage::new(r#type);
        usage.volume_name = volume_name.into();
        usage.items = items;
        reference.usages.push(usage);
    }
}

/// Every Secret reference of the pod spec of `manifest`.
pub fn detect_secrets(manifest: &Manifest) -> Result<Vec<SecretReference>> {
    let spec = Value::Mapping(manifest.get_pod_spec()?.clone());
    let mut collector = Collector {
        namespace: manifest.get_namespace().unwrap_or_default().to_string(),
        references: Vec::new(),
    };

    for container in list(&spec, "containers").chain(list(&spec, "initContainers")) {
        collector.container(container);
    }

    for volume in list(&spec, "volumes") {
        let volume_name = str_at(volume, "name").unwrap_or_default();
        if let Some(source) = volume.get("secret") {
            if let Some(secret) = str_at(source, "secretName") {
                collector.volume_source(secret, source, volume_name, UsageType::Volume);
            }
        }
        if let Some(projected) = volume.get("projected") {
            for source in list(projected, "sources").filter_map(|s| s.get("secret")) {
                if let Some(secret) = str_at(source, "name") {
                    collector.volume_source(secret, source, volume_name, UsageType::Projected);
                }
            }
        }
    }

    for pull_secret in list(&spec, "imagePullSecrets") {
        let Some(secret) = str_at(pull_secret, "name") else {
            continue;
        };
        let reference = collector.entry(secret);
        reference.needs_lookup = true;
        reference
            .usages
            .push(SecretUsage::new(UsageType::ImagePullSecrets));
    }

    // Second pass: where each secret volume is mounted.
    for reference in collector.references.iter_mut() {
        for usage in reference
            .usages
            .iter_mut()
            .filter(|u| u.r#type == UsageType::Volume)
        {
            let mount = list(&spec, "containers")
                .chain(list(&spec, "initContainers"))
                .find_map(|container| {
                    list(container, "volumeMounts")
                        .find(|m| str_at(m, "name") == Some(usage.volume_name.as_str()))
                        .map(|m| (container, m))
                });
            if let Some((container, mount)) = mount {
                usage.container_name = str_at(container, "name").unwrap_or_default().into();
                usage.mount_path = str_at(mount, "mountPath").unwrap_or_default().into();
            }
        }
    }

    Ok(collector.references)
}

/// ServiceAccount the pod runs as.
pub fn service_account_name(manifest: &Manifest) -> String {
    manifest
        .get_pod_spec()
        .ok()
        .and_then(|spec| spec.get("serviceAccountName"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SERVICE_ACCOUNT)
        .to_string()
}
