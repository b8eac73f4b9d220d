// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde_yaml::Value;

use super::{get_str, Kind, Manifest, ManifestSet};
use crate::{Error, Result};

impl Manifest {
    /// Names the Service is reachable under inside the cluster.
    pub fn service_dns_names(&self, namespace: &str) -> Vec<String> {
        let name = self.get_name();
        vec![
            name.to_string(),
            format!("{name}.{namespace}"),
            format!("{name}.{namespace}.svc"),
            format!("{name}.{namespace}.svc.cluster.local"),
        ]
    }
}

impl ManifestSet {
    /// Resolve the container port behind the first port of the Service.
    ///
    /// A numeric `targetPort` is returned as is, a named one is looked up in
    /// the containers of the primary workload, a missing one falls back to
    /// `port`.
    pub fn get_service_target_port(&self) -> Result<u16> {
        let service = self
            .get_service_manifest()
            .ok_or_else(|| Error::Resolution("manifest has no Service".into()))?;
        service_target_port(service, self.get_primary_manifest())
    }
}

fn service_target_port(service: &Manifest, workload: Option<&Manifest>) -> Result<u16> {
    if service.kind != Kind::Service {
        return Err(Error::Manifest(format!("{service} is not a Service")));
    }

    let port = service
        .value()
        .get("spec")
        .and_then(|s| s.get("ports"))
        .and_then(Value::as_sequence)
        .and_then(|ports| ports.first())
        .ok_or_else(|| Error::Resolution(format!("{service} declares no ports")))?;

    match port.get("targetPort").or_else(|| port.get("port")) {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| Error::Resolution(format!("{service} has an invalid port {n}"))),
        Some(Value::String(name)) => {
            // A quoted number is still a number.
            if let Ok(number) = name.parse::<u16>() {
                return Ok(number);
            }
            let workload = workload.ok_or_else(|| {
                Error::Resolution(format!("named port {name} needs a workload to resolve"))
            })?;
            resolve_named_port(workload, name)
        }
        _ => Err(Error::Resolution(format!("{service} has no usable port"))),
    }
}

fn resolve_named_port(workload: &Manifest, port_name: &str) -> Result<u16> {
    let spec = workload.get_pod_spec()?;
    spec.get("containers")
        .and_then(Value::as_sequence)
        .into_iter()
        .flatten()
        .flat_map(|c| c.get("ports").and_then(Value::as_sequence).into_iter().flatten())
        .find(|p| get_str(p, "name") == Some(port_name))
        .and_then(|p| p.get("containerPort"))
        .and_then(Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| {
            Error::Resolution(format!(
                "named port {port_name} not found in containers of {workload}"
            ))
        })
}
