// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Inject the `coco-secure-access` mTLS sidecar. Its server certificate is
//! signed by the developer CA and handed over through KBS, so only an
//! attested pod can serve it.

use std::{collections::BTreeMap, net::IpAddr};

use k8s_openapi::{
    api::core::v1::{
        Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, ResourceRequirements,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use log::info;
use resource_uri::ResourceUri;

use crate::{config::SidecarConfig, manifest::ManifestSet, pki::CertificateAuthority, Error, Result};

pub const SIDECAR_CONTAINER_NAME: &str = "coco-secure-access";

const TLS_SECRET_PREFIX: &str = "sidecar-tls";
const SERVER_CERT_KEY: &str = "server-cert";
const SERVER_KEY_KEY: &str = "server-key";

/// Where `kubectl-coco init-sidecar` stores the client CA.
pub fn client_ca_uri() -> ResourceUri {
    ResourceUri::new("default", TLS_SECRET_PREFIX, "client-ca")
}

#[derive(Debug)]
pub struct SidecarInjection {
    pub forward_port: u16,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    /// KBS repository path → content, server certificate and key.
    pub kbs_resources: BTreeMap<String, Vec<u8>>,
}

pub struct SidecarInjector<'a> {
    config: &'a SidecarConfig,
    ca: &'a CertificateAuthority,
}

impl<'a> SidecarInjector<'a> {
    pub fn new(config: &'a SidecarConfig, ca: &'a CertificateAuthority) -> Self {
        Self { config, ca }
    }

    fn forward_port(&self, set: &ManifestSet) -> Result<u16> {
        if self.config.forward_port > 0 {
            return Ok(self.config.forward_port);
        }
        set.get_service_target_port().map_err(|e| {
            Error::Resolution(format!(
                "no sidecar forward port: set sidecar.forward_port or add a Service ({e})"
            ))
        })
    }

    /// Add the sidecar to the primary workload of `set`. `node_addresses`
    /// and `extra_sans` end up in the server certificate next to the Service
    /// DNS names.
    pub fn inject(
        &self,
        set: &mut ManifestSet,
        namespace: &str,
        node_addresses: &[IpAddr],
        extra_sans: &[String],
    ) -> Result<SidecarInjection> {
        let forward_port = self.forward_port(set)?;
        if node_addresses.is_empty() {
            return Err(Error::Resolution(
                "no node addresses found for the sidecar certificate".into(),
            ));
        }

        let app = set
            .get_primary_manifest()
            .ok_or_else(|| Error::Manifest("manifest has no workload".into()))?
            .get_name()
            .to_string();

        let mut dns_names = set
            .get_service_manifest()
            .map(|service| service.service_dns_names(namespace))
            .unwrap_or_default();
        let mut ip_addresses = node_addresses.to_vec();
        for san in extra_sans {
            match san.parse::<IpAddr>() {
                Ok(ip) if !ip_addresses.contains(&ip) => ip_addresses.push(ip),
                Ok(_) => {}
                Err(_) if !dns_names.contains(san) => dns_names.push(san.clone()),
                Err(_) => {}
            }
        }

        let issued = self
            .ca
            .issue_server_cert(&app, &dns_names, &ip_addresses)?;
        let secret = format!("{TLS_SECRET_PREFIX}-{app}");
        let cert_uri = ResourceUri::new(namespace, &secret, SERVER_CERT_KEY);
        let key_uri = ResourceUri::new(namespace, &secret, SERVER_KEY_KEY);

        let container = self.container(&cert_uri, &key_uri, forward_port);
        set.get_primary_manifest_mut()
            .ok_or_else(|| Error::Manifest("manifest has no workload".into()))?
            .add_sidecar_container(serde_yaml::to_value(container)?)?;

        info!(
            "injected {SIDECAR_CONTAINER_NAME} into {app}, forwarding {} to {forward_port}",
            self.config.https_port
        );

        Ok(SidecarInjection {
            forward_port,
            dns_names,
            ip_addresses,
            kbs_resources: BTreeMap::from([
                (cert_uri.resource_path(), issued.cert_pem.into_bytes()),
                (key_uri.resource_path(), issued.key_pem.into_bytes()),
            ]),
        })
    }

    fn container(&self, cert_uri: &ResourceUri, key_uri: &ResourceUri, forward_port: u16) -> Container {
        let literal = |name: &str, value: String| EnvVar {
            name: name.into(),
            value: Some(value),
            ..Default::default()
        };
        let downward = |name: &str, field: &str| EnvVar {
            name: name.into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: field.into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        Container {
            name: SIDECAR_CONTAINER_NAME.into(),
            image: Some(self.config.image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("https".into()),
                container_port: i32::from(self.config.https_port),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            env: Some(vec![
                literal("TLS_CERT_URI", cert_uri.whole_uri()),
                literal("TLS_KEY_URI", key_uri.whole_uri()),
                literal("CLIENT_CA_URI", client_ca_uri().whole_uri()),
                literal("HTTPS_PORT", self.config.https_port.to_string()),
                literal("FORWARD_PORT", forward_port.to_string()),
                downward("POD_NAME", "metadata.name"),
                downward("POD_NAMESPACE", "metadata.namespace"),
            ]),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity(self.config.cpu_limit.clone())),
                    ("memory".to_string(), Quantity(self.config.memory_limit.clone())),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
