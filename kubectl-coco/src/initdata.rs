// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Initdata configures the guest attestation agent, the confidential data
//! hub and the kata agent policy. It travels gzip'ed and base64'ed in a pod
//! annotation. The format is described in
//! <https://github.com/confidential-containers/trustee/blob/main/kbs/docs/initdata.md>

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use resource_uri::ResourceUri;
use serde::Serialize;

use crate::{
    config::{Config, GuestMaterials},
    Error, Result,
};

pub const INITDATA_ANNOTATION: &str = "io.katacontainers.config.hypervisor.cc_init_data";

pub const INITDATA_VERSION: &str = "0.1.0";

const ALGORITHM: &str = "sha256";

const CDH_SOCKET: &str = "unix:///run/confidential-containers/cdh.sock";

const KBC_NAME: &str = "cc_kbc";

const LITERAL_DELIMITER: &str = "'''";

/// Allows everything but exec, reading container output and replacing the
/// policy at runtime.
pub const DEFAULT_POLICY: &str = r#"package agent_policy

default AddARPNeighborsRequest := true
default AddSwapRequest := true
default CloseStdinRequest := true
default CopyFileRequest := true
default CreateContainerRequest := true
default CreateSandboxRequest := true
default DestroySandboxRequest := true
default ExecProcessRequest := false
default GetMetricsRequest := true
default GetOOMEventRequest := true
default GuestDetailsRequest := true
default ListInterfacesRequest := true
default ListRoutesRequest := true
default MemHotplugByProbeRequest := true
default OnlineCPUMemRequest := true
default PauseContainerRequest := true
default PullImageRequest := true
default ReadStreamRequest := false
default RemoveContainerRequest := true
default RemoveStaleVirtiofsShareMountsRequest := true
default ReseedRandomDevRequest := true
default ResumeContainerRequest := true
default SetGuestDateTimeRequest := true
default SetPolicyRequest := false
default SignalProcessRequest := true
default StartContainerRequest := true
default StartTracingRequest := true
default StatsContainerRequest := true
default StopTracingRequest := true
default TtyWinResizeRequest := true
default UpdateContainerRequest := true
default UpdateEphemeralMountsRequest := true
default UpdateInterfaceRequest := true
default UpdateRoutesRequest := true
default WaitProcessRequest := true
default WriteStreamRequest := true
"#;

#[derive(Serialize)]
struct KbsTokenConfig<'a> {
    url: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    cert: Option<&'a str>,
}

#[derive(Serialize)]
struct TokenConfigs<'a> {
    kbs: KbsTokenConfig<'a>,
}

#[derive(Serialize)]
struct AaConfig<'a> {
    token_configs: TokenConfigs<'a>,
}

#[derive(Serialize)]
struct KbsConfig<'a> {
    name: &'a str,

    url: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    kbs_cert: Option<&'a str>,
}

#[derive(Serialize, Default)]
struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_security_policy_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    authenticated_registry_credentials_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    registry_configuration_uri: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_root_certificates: Vec<String>,
}

impl ImageConfig {
    fn is_empty(&self) -> bool {
        self.image_security_policy_uri.is_none()
            && self.authenticated_registry_credentials_uri.is_none()
            && self.registry_configuration_uri.is_none()
            && self.extra_root_certificates.is_empty()
    }
}

#[derive(Serialize)]
struct CdhConfig<'a> {
    socket: &'a str,

    credentials: Vec<String>,

    kbc: KbsConfig<'a>,

    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<ImageConfig>,
}

fn render<T: Serialize>(what: &str, value: &T) -> Result<String> {
    toml::to_string(value).map_err(|e| Error::Initdata(format!("{what}: {e}")))
}

fn literal(name: &str, content: &str) -> Result<String> {
    if content.contains(LITERAL_DELIMITER) {
        return Err(Error::Initdata(format!(
            "{name} must not contain {LITERAL_DELIMITER}"
        )));
    }
    Ok(format!("'{name}' = {LITERAL_DELIMITER}\n{content}\n{LITERAL_DELIMITER}\n"))
}

/// The initdata TOML document.
///
/// CDH takes a single registry credential: `registry_cred_uri` from the
/// config wins, otherwise the first of `image_pull_secrets`. Later pull
/// secrets are not wired through.
pub fn render_toml(
    config: &Config,
    materials: &GuestMaterials,
    image_pull_secrets: &[ResourceUri],
) -> Result<String> {
    let cert = materials.trustee_ca_cert.as_deref();

    let aa = AaConfig {
        token_configs: TokenConfigs {
            kbs: KbsTokenConfig {
                url: &config.trustee_server,
                cert,
            },
        },
    };

    let image = ImageConfig {
        image_security_policy_uri: config.container_policy_uri.clone(),
        authenticated_registry_credentials_uri: config
            .registry_cred_uri
            .clone()
            .or_else(|| image_pull_secrets.first().map(ResourceUri::whole_uri)),
        registry_configuration_uri: config.registry_config_uri.clone(),
        extra_root_certificates: cert.map(str::to_string).into_iter().collect(),
    };
    let cdh = CdhConfig {
        socket: CDH_SOCKET,
        credentials: Vec::new(),
        kbc: KbsConfig {
            name: KBC_NAME,
            url: &config.trustee_server,
            kbs_cert: cert,
        },
        image: Some(image).filter(|i| !i.is_empty()),
    };

    let policy = materials
        .kata_agent_policy
        .as_deref()
        .unwrap_or(DEFAULT_POLICY);

    let mut toml = format!("version = '{INITDATA_VERSION}'\nalgorithm = '{ALGORITHM}'\n\n[data]\n");
    toml.push_str(&literal("aa.toml", &render("aa.toml", &aa)?)?);
    toml.push('\n');
    toml.push_str(&literal("cdh.toml", &render("cdh.toml", &cdh)?)?);
    toml.push('\n');
    toml.push_str(&literal("policy.rego", policy)?);
    Ok(toml)
}

/// Value of the [`INITDATA_ANNOTATION`] annotation.
pub fn generate(
    config: &Config,
    materials: &GuestMaterials,
    image_pull_secrets: &[ResourceUri],
) -> Result<String> {
    let toml = render_toml(config, materials, image_pull_secrets)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(toml.as_bytes())
        .map_err(|e| Error::io("compress initdata", e))?;
    let gzipped = encoder
        .finish()
        .map_err(|e| Error::io("compress initdata", e))?;
    Ok(STANDARD.encode(gzipped))
}

/// Inverse of [`generate`], returns the TOML document.
pub fn decode(annotation: &str) -> Result<String> {
    let gzipped = STANDARD
        .decode(annotation.trim())
        .map_err(|e| Error::Initdata(format!("annotation is not base64: {e}")))?;
    let mut toml = String::new();
    GzDecoder::new(&gzipped[..])
        .read_to_string(&mut toml)
        .map_err(|e| Error::io("decompress initdata", e))?;
    Ok(toml)
}
