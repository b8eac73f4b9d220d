// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::env;

use resource_uri::ResourceUri;

use crate::{Error, Result};

pub const DEFAULT_HTTPS_PORT: u16 = 8443;
pub const DEFAULT_CDH_ENDPOINT: &str = "http://127.0.0.1:8006";

pub const TLS_CERT_URI: &str = "TLS_CERT_URI";
pub const TLS_KEY_URI: &str = "TLS_KEY_URI";
pub const CLIENT_CA_URI: &str = "CLIENT_CA_URI";
pub const HTTPS_PORT: &str = "HTTPS_PORT";
pub const FORWARD_PORT: &str = "FORWARD_PORT";
pub const POD_NAME: &str = "POD_NAME";
pub const POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const CDH_ENDPOINT: &str = "CDH_ENDPOINT";

/// Everything the sidecar is told through its environment.
#[derive(Clone, Debug, PartialEq)]
pub struct SidecarEnv {
    pub tls_cert_uri: ResourceUri,
    pub tls_key_uri: ResourceUri,
    pub client_ca_uri: ResourceUri,
    pub https_port: u16,

    /// Loopback port of the application, `0` disables the reverse proxy.
    pub forward_port: u16,

    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub cdh_endpoint: String,
}

impl SidecarEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let uri = |name: &str| -> Result<ResourceUri> {
            let value = get(name).ok_or_else(|| Error::Env(format!("{name} is required")))?;
            ResourceUri::try_from(value.trim()).map_err(|e| Error::Env(format!("{name}: {e}")))
        };

        let port = |name: &str, default: u16| -> Result<u16> {
            match get(name) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Env(format!("{name} is not a port: {value}"))),
                None => Ok(default),
            }
        };

        let https_port = port(HTTPS_PORT, DEFAULT_HTTPS_PORT)?;
        if https_port == 0 {
            return Err(Error::Env(format!("{HTTPS_PORT} must not be 0")));
        }

        Ok(Self {
            tls_cert_uri: uri(TLS_CERT_URI)?,
            tls_key_uri: uri(TLS_KEY_URI)?,
            client_ca_uri: uri(CLIENT_CA_URI)?,
            https_port,
            forward_port: port(FORWARD_PORT, 0)?,
            pod_name: get(POD_NAME),
            pod_namespace: get(POD_NAMESPACE),
            cdh_endpoint: get(CDH_ENDPOINT).unwrap_or_else(|| DEFAULT_CDH_ENDPOINT.into()),
        })
    }
}
