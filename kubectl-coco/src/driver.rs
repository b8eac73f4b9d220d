// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Sequences the whole `apply` pipeline. Nothing reaches the cluster before
//! every in-memory step succeeded; the written `-coco` file stays behind on
//! failure.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use k8s_openapi::api::core::v1::Container;
use log::{debug, info, warn};
use resource_uri::ResourceUri;

use crate::{
    cluster::Cluster,
    config::Config,
    initdata::{self, INITDATA_ANNOTATION},
    kbs::{self, KbsPopulator, ATTESTATION_STATUS_PATH, ATTESTATION_STATUS_VALUE},
    manifest::ManifestSet,
    pki::{init_sidecar_ca, CertificateAuthority, SidecarCaFiles},
    secret::{
        detect_secrets, inspect, service_account_name, SecretReference, SecretRewriter,
        SecretUsage, UsageType,
    },
    sidecar::{client_ca_uri, SidecarInjection, SidecarInjector},
    Error, Result,
};

pub const ATTESTATION_CHECK_CONTAINER: &str = "coco-attestation-check";

#[derive(Clone, Debug)]
pub struct ApplyOptions {
    pub manifest: PathBuf,

    /// Run `kubectl apply` on the result.
    pub apply: bool,

    /// Populate KBS.
    pub upload: bool,

    /// Overrides `sidecar.enabled` when set.
    pub sidecar: Option<bool>,

    /// Extra SANs of the sidecar server certificate.
    pub sidecar_sans: Vec<String>,

    /// Prepend the attestation check initContainer.
    pub init_container: bool,

    /// Inherit the ServiceAccount pull secret when the pod names none.
    pub service_account_lookup: bool,
}

impl ApplyOptions {
    pub fn new(manifest: impl Into<PathBuf>) -> Self {
        Self {
            manifest: manifest.into(),
            apply: true,
            upload: true,
            sidecar: None,
            sidecar_sans: Vec::new(),
            init_container: true,
            service_account_lookup: true,
        }
    }
}

/// Result of the in-memory part of the pipeline.
#[derive(Debug)]
pub struct Transformed {
    pub manifests: ManifestSet,

    /// Namespace the workload and its secrets live in.
    pub namespace: String,

    /// KBS repository path → content, including the attestation status.
    pub kbs_resources: BTreeMap<String, Vec<u8>>,

    pub image_pull_secret_uris: Vec<ResourceUri>,

    pub sidecar: Option<SidecarInjection>,
}

#[derive(Debug)]
pub struct ApplyReport {
    /// The written `-coco` manifest.
    pub output: PathBuf,

    pub transformed: Transformed,
}

pub struct Driver<'a> {
    config: &'a Config,
    cluster: &'a dyn Cluster,
}

impl<'a> Driver<'a> {
    pub fn new(config: &'a Config, cluster: &'a dyn Cluster) -> Self {
        Self { config, cluster }
    }

    fn attestation_check_container(&self) -> Result<serde_yaml::Value> {
        let container = Container {
            name: ATTESTATION_CHECK_CONTAINER.into(),
            image: Some(self.config.init_container_image.clone()),
            command: Some(self.config.init_container_cmd.clone()),
            ..Default::default()
        };
        Ok(serde_yaml::to_value(container)?)
    }

    /// Pull secret inherited from the ServiceAccount of the pod, if the pod
    /// names none itself.
    fn inherited_pull_secret(
        &self,
        references: &[SecretReference],
        namespace: &str,
        service_account: &str,
    ) -> Result<Option<SecretReference>> {
        if references
            .iter()
            .any(|r| r.has_usage(UsageType::ImagePullSecrets))
        {
            return Ok(None);
        }

        let Some(name) = self
            .cluster
            .get_service_account_pull_secret(namespace, service_account)?
        else {
            debug!("serviceaccount {namespace}/{service_account} has no pull secret");
            return Ok(None);
        };
        info!("Inherit pull secret {name} from serviceaccount {service_account}");

        let mut reference = SecretReference::new(&name, namespace);
        reference.needs_lookup = true;
        reference
            .usages
            .push(SecretUsage::new(UsageType::ImagePullSecrets));
        Ok(Some(reference))
    }

    /// Everything but the effects: load, rewrite and annotate.
    pub fn transform(&self, options: &ApplyOptions) -> Result<Transformed> {
        let materials = self.config.load_materials()?;
        let mut manifests = ManifestSet::load_multi(&options.manifest)?;

        let primary = manifests
            .get_primary_manifest()
            .ok_or_else(|| Error::Manifest(format!("{} holds no workload", options.manifest.display())))?;
        let namespace = match primary.get_namespace() {
            Some(namespace) => namespace.to_string(),
            None => self.cluster.current_namespace()?,
        };
        info!("Transform {primary} in namespace {namespace}");

        let mut references = detect_secrets(primary)?;
        if options.service_account_lookup {
            let service_account = service_account_name(primary);
            if let Some(inherited) = self.inherited_pull_secret(&references, &namespace, &service_account)? {
                references.push(inherited);
            }
        }
        info!("Found {} secret references", references.len());
        let resolved = inspect(references, self.cluster, &namespace)?;

        let primary = manifests
            .get_primary_manifest_mut()
            .ok_or_else(|| Error::Manifest("manifest has no workload".into()))?;
        let outcome = SecretRewriter::new(&self.config.init_container_image).rewrite(primary, &resolved)?;

        primary.set_runtime_class(&self.config.runtime_class)?;
        for (key, value) in self.config.custom_annotations() {
            primary.set_annotation(key, value)?;
        }
        if options.init_container {
            primary.add_init_container(self.attestation_check_container()?)?;
        }

        let initdata = initdata::generate(self.config, &materials, &outcome.image_pull_secret_uris)?;
        primary.set_annotation(INITDATA_ANNOTATION, &initdata)?;
        info!("Set {INITDATA_ANNOTATION} on {primary}");

        let mut kbs_resources = outcome.kbs_resources;
        let sidecar = if options.sidecar.unwrap_or(self.config.sidecar.enabled) {
            let ca = CertificateAuthority::load(&self.config.sidecar.ca_dir())?;
            let nodes = self.cluster.node_addresses()?;
            let injection = SidecarInjector::new(&self.config.sidecar, &ca).inject(
                &mut manifests,
                &namespace,
                &nodes,
                &options.sidecar_sans,
            )?;
            kbs::merge_resources(&mut kbs_resources, injection.kbs_resources.clone())?;
            Some(injection)
        } else {
            None
        };

        for sealed in outcome.sealed_secrets {
            manifests.upsert(sealed);
        }

        kbs::add_resource(
            &mut kbs_resources,
            ATTESTATION_STATUS_PATH.to_string(),
            ATTESTATION_STATUS_VALUE.to_vec(),
        )?;

        Ok(Transformed {
            manifests,
            namespace,
            kbs_resources,
            image_pull_secret_uris: outcome.image_pull_secret_uris,
            sidecar,
        })
    }

    /// Transform, write `<stem>-coco<ext>`, populate KBS, then apply.
    pub fn apply(&self, options: &ApplyOptions) -> Result<ApplyReport> {
        let trustee_namespace = self.config.trustee_namespace()?;
        let transformed = self.transform(options)?;

        let output = transformed.manifests.backup(&options.manifest)?;
        info!("Wrote {}", output.display());

        if options.upload {
            KbsPopulator::new(self.cluster, &trustee_namespace).upload(&transformed.kbs_resources)?;
        } else {
            info!("Skip KBS upload of {} resources", transformed.kbs_resources.len());
        }

        if options.apply {
            self.check_runtime_class();
            self.apply_file(&output)?;
            info!("Applied {}", output.display());
        }

        Ok(ApplyReport { output, transformed })
    }

    fn check_runtime_class(&self) {
        match self.cluster.has_runtime_class(&self.config.runtime_class) {
            Ok(true) => {}
            Ok(false) => warn!(
                "runtimeclass {} does not exist on the cluster, pods will not schedule",
                self.config.runtime_class
            ),
            Err(e) => warn!("cannot check runtimeclass {}: {e}", self.config.runtime_class),
        }
    }

    fn apply_file(&self, path: &Path) -> Result<()> {
        self.cluster.apply(path).map_err(|e| Error::Apply {
            path: path.display().to_string(),
            source: Box::new(e),
        })
    }

    /// Create the sidecar CA and client certificate, and publish the CA in
    /// KBS for the sidecars to verify clients against.
    pub fn init_sidecar(&self, upload: bool) -> Result<SidecarCaFiles> {
        let (ca, files) = init_sidecar_ca(&self.config.sidecar.ca_dir())?;
        info!("Client certificate written to {}", files.client_cert.display());

        if upload {
            let resources = BTreeMap::from([(
                client_ca_uri().resource_path(),
                ca.cert_pem()?.into_bytes(),
            )]);
            KbsPopulator::new(self.cluster, &self.config.trustee_namespace()?).upload(&resources)?;
            info!("Uploaded client CA to {}", client_ca_uri());
        }
        Ok(files)
    }
}
