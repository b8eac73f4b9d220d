// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use config::{Config as ConfigBuilder, File, FileFormat};
use log::{debug, info};
use serde::Deserialize;

use crate::{Error, Result};

pub const DEFAULT_RUNTIME_CLASS: &str = "kata-cc";
pub const DEFAULT_INIT_CONTAINER_IMAGE: &str = "docker.io/curlimages/curl:8.11.0";
pub const DEFAULT_SIDECAR_IMAGE: &str = "ghcr.io/confidential-devhub/coco-secure-access:latest";
pub const DEFAULT_SIDECAR_HTTPS_PORT: u16 = 8443;

const CONFIG_PATH_ENV: &str = "COCO_CONFIG_PATH";
const DEFAULT_CONFIG_FILE: &str = ".kube/coco-config.toml";
const DEFAULT_CA_DIR: &str = ".kube/coco-sidecar";

pub fn default_init_container_cmd() -> Vec<String> {
    vec![
        "sh".into(),
        "-c".into(),
        "curl -sf http://127.0.0.1:8006/cdh/resource/default/attestation-status/status".into(),
    ]
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct SidecarConfig {
    pub enabled: bool,

    pub image: String,

    pub https_port: u16,

    /// Application port to reverse-proxy. `0` means resolve it from the Service.
    pub forward_port: u16,

    pub cpu_limit: String,

    pub memory_limit: String,

    /// Where the developer CA and client certificate live.
    pub ca_dir: Option<PathBuf>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: DEFAULT_SIDECAR_IMAGE.into(),
            https_port: DEFAULT_SIDECAR_HTTPS_PORT,
            forward_port: 0,
            cpu_limit: "100m".into(),
            memory_limit: "128Mi".into(),
            ca_dir: None,
        }
    }
}

impl SidecarConfig {
    pub fn ca_dir(&self) -> PathBuf {
        self.ca_dir
            .clone()
            .unwrap_or_else(|| home_dir().join(DEFAULT_CA_DIR))
    }
}

/// Input of one `apply` run.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub trustee_server: String,

    /// Namespace of the Trustee deployment. Derived from `trustee_server`
    /// when not given.
    #[serde(default)]
    pub trustee_namespace: Option<String>,

    pub runtime_class: String,

    #[serde(default)]
    pub trustee_ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub kata_agent_policy: Option<PathBuf>,

    pub init_container_image: String,

    pub init_container_cmd: Vec<String>,

    #[serde(default)]
    pub container_policy_uri: Option<String>,

    #[serde(default)]
    pub registry_cred_uri: Option<String>,

    #[serde(default)]
    pub registry_config_uri: Option<String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub sidecar: SidecarConfig,
}

/// File-backed material referenced by [`Config`], read once before any effect.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GuestMaterials {
    pub trustee_ca_cert: Option<String>,
    pub kata_agent_policy: Option<String>,
}

impl Config {
    /// A config with every default filled in, pointing at `trustee_server`.
    pub fn new(trustee_server: &str) -> Self {
        Self {
            trustee_server: trustee_server.into(),
            trustee_namespace: None,
            runtime_class: DEFAULT_RUNTIME_CLASS.into(),
            trustee_ca_cert: None,
            kata_agent_policy: None,
            init_container_image: DEFAULT_INIT_CONTAINER_IMAGE.into(),
            init_container_cmd: default_init_container_cmd(),
            container_policy_uri: None,
            registry_cred_uri: None,
            registry_config_uri: None,
            annotations: BTreeMap::new(),
            sidecar: SidecarConfig::default(),
        }
    }

    /// Path given on the command line, then `COCO_CONFIG_PATH`, then
    /// `$HOME/.kube/coco-config.toml`.
    pub fn resolve_path(config_path: Option<PathBuf>) -> PathBuf {
        config_path
            .or_else(|| {
                env::var(CONFIG_PATH_ENV).ok().map(|path| {
                    debug!("Read config path from env: {path}");
                    PathBuf::from(path)
                })
            })
            .unwrap_or_else(|| home_dir().join(DEFAULT_CONFIG_FILE))
    }

    pub fn from_file(config_path: &Path) -> Result<Self> {
        let path = config_path.display().to_string();
        info!("Use configuration file {path}");
        if !config_path.exists() {
            return Err(Error::Config(format!("config file {path} not found")));
        }

        let sidecar = SidecarConfig::default();
        let wrap = |source| Error::ConfigFile {
            path: path.clone(),
            source,
        };
        let c = ConfigBuilder::builder()
            .set_default("runtime_class", DEFAULT_RUNTIME_CLASS)
            .and_then(|b| b.set_default("init_container_image", DEFAULT_INIT_CONTAINER_IMAGE))
            .and_then(|b| b.set_default("init_container_cmd", default_init_container_cmd()))
            .and_then(|b| b.set_default("sidecar.enabled", sidecar.enabled))
            .and_then(|b| b.set_default("sidecar.image", sidecar.image.clone()))
            .and_then(|b| b.set_default("sidecar.https_port", sidecar.https_port as i64))
            .and_then(|b| b.set_default("sidecar.forward_port", sidecar.forward_port as i64))
            .and_then(|b| b.set_default("sidecar.cpu_limit", sidecar.cpu_limit.clone()))
            .and_then(|b| b.set_default("sidecar.memory_limit", sidecar.memory_limit.clone()))
            .map_err(wrap)?
            .add_source(File::new(&path, FileFormat::Toml))
            .build()
            .map_err(wrap)?;

        let config: Config = c.try_deserialize().map_err(wrap)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trustee_server.trim().is_empty() {
            return Err(Error::Config("trustee_server is required".into()));
        }
        let url = url::Url::parse(&self.trustee_server).map_err(|e| {
            Error::Config(format!(
                "trustee_server {} is not a URL: {e}",
                self.trustee_server
            ))
        })?;
        if url.host_str().unwrap_or_default().is_empty() {
            return Err(Error::Config(format!(
                "trustee_server {} has no host",
                self.trustee_server
            )));
        }
        if self.runtime_class.trim().is_empty() {
            return Err(Error::Config("runtime_class must not be empty".into()));
        }
        if self.sidecar.https_port == 0 {
            return Err(Error::Config("sidecar.https_port must not be 0".into()));
        }
        Ok(())
    }

    pub fn load_materials(&self) -> Result<GuestMaterials> {
        let read = |path: &Option<PathBuf>, what: &str| -> Result<Option<String>> {
            path.as_ref()
                .map(|p| {
                    fs::read_to_string(p).map_err(|e| {
                        Error::Config(format!("cannot read {what} {}: {e}", p.display()))
                    })
                })
                .transpose()
        };

        Ok(GuestMaterials {
            trustee_ca_cert: read(&self.trustee_ca_cert, "trustee_ca_cert")?,
            kata_agent_policy: read(&self.kata_agent_policy, "kata_agent_policy")?,
        })
    }

    /// Namespace the KBS pod runs in: the configured one, otherwise the
    /// hostname label before the first dot of `trustee_server`.
    pub fn trustee_namespace(&self) -> Result<String> {
        if let Some(ns) = self.trustee_namespace.as_ref().filter(|ns| !ns.is_empty()) {
            return Ok(ns.clone());
        }

        let url = url::Url::parse(&self.trustee_server)
            .map_err(|e| Error::Config(format!("trustee_server is not a URL: {e}")))?;
        let host = url.host_str().unwrap_or_default();
        match host.split('.').next() {
            Some(prefix) if !prefix.is_empty() => Ok(prefix.to_string()),
            _ => Err(Error::Config(format!(
                "cannot derive the trustee namespace from {}",
                self.trustee_server
            ))),
        }
    }

    /// Custom pod annotations without the empty values.
    pub fn custom_annotations(&self) -> impl Iterator<Item = (&String, &String)> {
        self.annotations.iter().filter(|(_, v)| !v.is_empty())
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
