// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{
    net::IpAddr,
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};

use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use log::debug;
use serde::{de::DeserializeOwned, Deserialize};

use super::{Cluster, SecretData, DEFAULT_NAMESPACE};
use crate::{Error, Result};

const NOT_FOUND: &str = "NotFound";

/// `kubectl get ... -o json` of a list. Item kinds are checked by the
/// item types themselves.
#[derive(Deserialize)]
struct ItemList<T> {
    items: Vec<T>,
}

struct CommandOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

/// [`Cluster`] backed by the `kubectl` binary and its current context.
#[derive(Clone, Debug)]
pub struct KubectlCluster {
    binary: String,
}

impl Default for KubectlCluster {
    fn default() -> Self {
        Self {
            binary: "kubectl".into(),
        }
    }
}

impl KubectlCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(&self.binary)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .args(args)
            .output()
            .map_err(|e| Error::io(format!("failed to run {}", self.binary), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!(
            "{} {} exited with {}",
            self.binary,
            args.join(" "),
            output.status
        );

        Ok(CommandOutput {
            stdout,
            stderr,
            success: output.status.success(),
        })
    }

    /// Run and fail on a non-zero exit status.
    fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.success {
            return Err(Error::Cluster(format!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    fn get_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let stdout = self.run_checked(args)?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

impl Cluster for KubectlCluster {
    fn current_namespace(&self) -> Result<String> {
        let stdout =
            self.run_checked(&["config", "view", "--minify", "-o", "jsonpath={..namespace}"])?;
        let namespace = stdout.trim();
        Ok(if namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            namespace.to_string()
        })
    }

    fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData> {
        let secret: Secret = self
            .get_json(&["get", "secret", name, "-n", namespace, "-o", "json"])
            .map_err(|e| Error::Resolution(format!("cannot read secret {namespace}/{name}: {e}")))?;

        let mut data: std::collections::BTreeMap<String, Vec<u8>> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        for (k, v) in secret.string_data.unwrap_or_default() {
            data.entry(k).or_insert_with(|| v.into_bytes());
        }

        Ok(SecretData {
            r#type: secret.type_,
            data,
        })
    }

    fn get_service_account_pull_secret(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<Option<String>> {
        let args = [
            "get",
            "serviceaccount",
            service_account,
            "-n",
            namespace,
            "-o",
            "json",
        ];
        let output = self.run(&args)?;
        if !output.success {
            if output.stderr.contains(NOT_FOUND) {
                return Ok(None);
            }
            return Err(Error::Cluster(format!(
                "cannot read serviceaccount {namespace}/{service_account}: {}",
                output.stderr.trim()
            )));
        }

        let account: serde_json::Value = serde_json::from_str(&output.stdout)?;
        Ok(account["imagePullSecrets"]
            .as_array()
            .and_then(|list| list.first())
            .and_then(|s| s["name"].as_str())
            .filter(|name| !name.is_empty())
            .map(str::to_string))
    }

    fn node_addresses(&self) -> Result<Vec<IpAddr>> {
        let nodes: ItemList<Node> = self.get_json(&["get", "nodes", "-o", "json"])?;
        let mut addresses = Vec::new();
        for wanted in ["ExternalIP", "InternalIP"] {
            for node in &nodes.items {
                let Some(status_addresses) = node.status.as_ref().and_then(|s| s.addresses.as_ref())
                else {
                    continue;
                };
                for address in status_addresses.iter().filter(|a| a.type_ == wanted) {
                    match address.address.parse::<IpAddr>() {
                        Ok(ip) if !addresses.contains(&ip) => addresses.push(ip),
                        Ok(_) => {}
                        Err(_) => debug!("skip non-IP node address {}", address.address),
                    }
                }
            }
        }
        Ok(addresses)
    }

    fn has_runtime_class(&self, name: &str) -> Result<bool> {
        let output = self.run(&["get", "runtimeclass", name, "-o", "name"])?;
        if output.success {
            return Ok(true);
        }
        if output.stderr.contains(NOT_FOUND) {
            return Ok(false);
        }
        Err(Error::Cluster(format!(
            "cannot read runtimeclass {name}: {}",
            output.stderr.trim()
        )))
    }

    fn find_pod(&self, namespace: &str, label_selector: &str) -> Result<String> {
        let pods: ItemList<Pod> =
            self.get_json(&["get", "pods", "-n", namespace, "-l", label_selector, "-o", "json"])?;
        let names: Vec<String> = pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect();
        match &names[..] {
            [name] => Ok(name.clone()),
            [] => Err(Error::Cluster(format!(
                "no pod matches {label_selector} in namespace {namespace}"
            ))),
            _ => Err(Error::Cluster(format!(
                "{} pods match {label_selector} in namespace {namespace}: {}",
                names.len(),
                names.join(", ")
            ))),
        }
    }

    fn wait_pod_ready(&self, namespace: &str, pod: &str, timeout: Duration) -> Result<()> {
        let target = format!("pod/{pod}");
        let timeout = format!("--timeout={}s", timeout.as_secs());
        self.run_checked(&[
            "wait",
            "--for=condition=Ready",
            &target,
            "-n",
            namespace,
            &timeout,
        ])?;
        Ok(())
    }

    fn copy_to_pod(&self, namespace: &str, pod: &str, local_dir: &Path, remote_dir: &str) -> Result<()> {
        let source = format!("{}/.", local_dir.display());
        let destination = format!("{namespace}/{pod}:{remote_dir}");
        self.run_checked(&["cp", &source, &destination])?;
        Ok(())
    }

    fn apply(&self, manifest: &Path) -> Result<()> {
        let path = manifest.display().to_string();
        self.run_checked(&["apply", "-f", &path])?;
        Ok(())
    }
}
