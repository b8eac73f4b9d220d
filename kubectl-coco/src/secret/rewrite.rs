// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use log::{debug, info};
use resource_uri::ResourceUri;
use serde_yaml::{Mapping, Value};

use super::{ResolvedSecret, SecretUsage, UsageType};
use crate::{kbs, manifest::Manifest, sealed, Error, Result};

/// Suffix of the generated Secret holding sealed literals.
pub const SEALED_SUFFIX: &str = "-sealed";

const INIT_CONTAINER_PREFIX: &str = "get-secrets-";

/// CDH as seen from inside the guest.
const CDH_ENDPOINT: &str = "http://127.0.0.1:8006";

/// Keys tried first when a pull secret is wired through CDH.
const DOCKER_CONFIG_KEYS: [&str; 2] = [".dockerconfigjson", ".dockercfg"];

#[derive(Debug, Default)]
pub struct RewriteOutcome {
    /// `<name>-sealed` Secret documents to apply with the workload.
    pub sealed_secrets: Vec<Manifest>,

    /// KBS repository path → content.
    pub kbs_resources: BTreeMap<String, Vec<u8>>,

    /// One URI per image pull secret, in reference order.
    pub image_pull_secret_uris: Vec<ResourceUri>,
}

pub struct SecretRewriter {
    init_container_image: String,
}

impl SecretRewriter {
    pub fn new(init_container_image: &str) -> Self {
        Self {
            init_container_image: init_container_image.into(),
        }
    }

    /// Rewrite every usage of `secrets` in `manifest`.
    pub fn rewrite(&self, manifest: &mut Manifest, secrets: &[ResolvedSecret]) -> Result<RewriteOutcome> {
        let mut outcome = RewriteOutcome::default();

        for secret in secrets {
            let reference = &secret.reference;
            let namespace = reference.namespace.as_str();
            let name = reference.name.as_str();

            let mut sealed = BTreeMap::new();
            for key in secret.keys() {
                let uri = ResourceUri::new(namespace, name, key);
                let content = secret.data.get(key).ok_or_else(|| {
                    Error::Resolution(format!("secret {namespace}/{name} has no key {key}"))
                })?;
                kbs::add_resource(&mut outcome.kbs_resources, uri.resource_path(), content.clone())
                    .map_err(|_| {
                        Error::Resolution(format!(
                            "secret {namespace}/{name}: key {key} collides with another key on KBS path {}",
                            uri.resource_path()
                        ))
                    })?;
                sealed.insert(key.clone(), sealed::encode(&uri)?);
            }

            for usage in &reference.usages {
                match usage.r#type {
                    UsageType::Env => {
                        let value = sealed.get(&usage.key).ok_or_else(|| {
                            Error::Resolution(format!("no sealed value for {name}/{}", usage.key))
                        })?;
                        manifest.convert_env_secret_to_sealed(
                            &usage.container_name,
                            &usage.env_var_name,
                            value,
                        )?;
                    }
                    UsageType::EnvFrom => {
                        let vars: Vec<(String, String)> = secret
                            .keys()
                            .iter()
                            .filter_map(|k| Some((k.clone(), sealed.get(k)?.clone())))
                            .collect();
                        manifest.convert_env_from_secret(&usage.container_name, name, &vars)?;
                    }
                    UsageType::Volume | UsageType::Projected => {}
                    UsageType::ImagePullSecrets => {
                        let key = pull_secret_key(secret.keys()).ok_or_else(|| {
                            Error::Resolution(format!("pull secret {namespace}/{name} has no keys"))
                        })?;
                        let uri = ResourceUri::new(namespace, name, key);
                        if !outcome.image_pull_secret_uris.contains(&uri) {
                            outcome.image_pull_secret_uris.push(uri);
                        }
                    }
                }
            }

            let volumes: Vec<&SecretUsage> = reference
                .usages
                .iter()
                .filter(|u| u.r#type == UsageType::Volume)
                .collect();
            if !volumes.is_empty() {
                let init_container = self.download_container(secret, &volumes);
                let names: Vec<&str> = volumes.iter().map(|u| u.volume_name.as_str()).collect();
                manifest.convert_volume_secret_to_init_container(&names, init_container)?;
            }

            if reference.has_workload_usage() {
                let sealed_name = format!("{name}{SEALED_SUFFIX}");
                let renamed = manifest.replace_secret_name(name, &sealed_name)?;
                debug!("renamed {renamed} references of {name} to {sealed_name}");
                outcome
                    .sealed_secrets
                    .push(sealed_secret_manifest(&sealed_name, namespace, sealed)?);
            }

            info!(
                "rewrote secret {namespace}/{name} ({} keys, {} usages)",
                secret.keys().len(),
                reference.usages.len()
            );
        }

        Ok(outcome)
    }

    /// initContainer that fetches every file of the secret volumes from CDH.
    fn download_container(&self, secret: &ResolvedSecret, volumes: &[&SecretUsage]) -> Value {
        let reference = &secret.reference;
        let mut downloads = Vec::new();
        let mut mounts: Vec<Value> = Vec::new();

        for usage in volumes {
            let mount_path = volume_mount_path(usage);
            let files: Vec<(&str, &str)> = if usage.items.is_empty() {
                secret.keys().iter().map(|k| (k.as_str(), k.as_str())).collect()
            } else {
                usage
                    .items
                    .iter()
                    .map(|i| (i.key.as_str(), i.path.as_str()))
                    .collect()
            };
            for (key, path) in files {
                let uri = ResourceUri::new(&reference.namespace, &reference.name, key);
                let target = format!("{}/{path}", mount_path.trim_end_matches('/'));
                downloads.push(format!(
                    "curl -o {} {}",
                    shell_quote(&target),
                    shell_quote(&uri.cdh_url(CDH_ENDPOINT))
                ));
            }

            if !mounts
                .iter()
                .any(|m| m.get("name").and_then(Value::as_str) == Some(usage.volume_name.as_str()))
            {
                let mut mount = Mapping::new();
                mount.insert("name".into(), usage.volume_name.as_str().into());
                mount.insert("mountPath".into(), mount_path.into());
                mounts.push(Value::Mapping(mount));
            }
        }

        let command = vec![
            Value::from("sh"),
            Value::from("-c"),
            Value::from(downloads.join(" && ")),
        ];
        let mut container = Mapping::new();
        container.insert(
            "name".into(),
            format!("{INIT_CONTAINER_PREFIX}{}", reference.name).into(),
        );
        container.insert("image".into(), self.init_container_image.as_str().into());
        container.insert("command".into(), Value::Sequence(command));
        container.insert("volumeMounts".into(), Value::Sequence(mounts));
        Value::Mapping(container)
    }
}

/// Where the downloaded files land. A volume nobody mounts still needs a
/// target inside the initContainer.
fn volume_mount_path(usage: &SecretUsage) -> String {
    if usage.mount_path.is_empty() {
        format!("/run/secrets/{}", usage.volume_name)
    } else {
        usage.mount_path.clone()
    }
}

/// Single-quote `word` for `sh -c` unless it only holds characters the
/// shell never interprets.
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:+@%=,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn pull_secret_key(keys: &[String]) -> Option<&str> {
    DOCKER_CONFIG_KEYS
        .iter()
        .find_map(|wanted| keys.iter().find(|k| k == wanted))
        .or_else(|| keys.first())
        .map(String::as_str)
}

fn sealed_secret_manifest(name: &str, namespace: &str, sealed: BTreeMap<String, String>) -> Result<Manifest> {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()).filter(|ns: &String| !ns.is_empty()),
            ..Default::default()
        },
        type_: Some("Opaque".into()),
        string_data: Some(sealed),
        ..Default::default()
    };
    Manifest::from_value(serde_yaml::to_value(&secret)?)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        cluster::{MockCluster, SecretData},
        manifest::tests::parse_one,
        sealed::decode,
        secret::{detect_secrets, inspect},
    };

    fn run(yaml: &str, cluster: &MockCluster) -> (Manifest, RewriteOutcome) {
        let mut manifest = parse_one(yaml);
        let refs = detect_secrets(&manifest).unwrap();
        let resolved = inspect(refs, cluster, "default").unwrap();
        let outcome = SecretRewriter::new("curl:test")
            .rewrite(&mut manifest, &resolved)
            .unwrap();
        (manifest, outcome)
    }

    fn sealed_name(value: &Value) -> String {
        decode(value.as_str().unwrap()).unwrap()["name"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn env_secret() {
        let cluster = MockCluster::new().with_secret("default", "db", SecretData::new([("pw", "hunter2")]));
        let (manifest, outcome) = run(
            "kind: Pod\nmetadata:\n  name: app\nspec:\n  containers:\n  - name: c1\n    env:\n    - name: DB\n      valueFrom:\n        secretKeyRef:\n          name: db\n          key: pw\n",
            &cluster,
        );

        let env = &manifest.get_pod_spec().unwrap()["containers"][0]["env"][0];
        assert!(env.get("valueFrom").is_none());
        assert_eq!(sealed_name(&env["value"]), "kbs:///default/db/pw");
        assert_eq!(outcome.kbs_resources["default/db/pw"], b"hunter2".to_vec());

        let sealed = &outcome.sealed_secrets[0];
        assert_eq!(sealed.get_name(), "db-sealed");
        assert_eq!(sealed.value()["type"], Value::from("Opaque"));
        assert_eq!(sealed.value()["stringData"]["pw"], env["value"]);
    }

    #[test]
    fn volume_with_items_and_two_mounts() {
        let cluster = MockCluster::new().with_secret(
            "default",
            "certs",
            SecretData::new([("ca", "CA"), ("unused", "x")]),
        );
        let (manifest, outcome) = run(
            r#"
kind: Pod
metadata:
  name: app
spec:
  containers:
  - name: c1
    volumeMounts:
    - name: ca
      mountPath: /etc/ca/
  volumes:
  - name: ca
    secret:
      secretName: certs
      items:
      - key: ca
        path: ca.pem
  - name: all
    secret:
      secretName: certs
"#,
            &cluster,
        );

        let spec = manifest.get_pod_spec().unwrap();
        let inits = spec["initContainers"].as_sequence().unwrap();
        assert_eq!(inits.len(), 1);
        assert_eq!(inits[0]["name"], Value::from("get-secrets-certs"));
        assert_eq!(inits[0]["image"], Value::from("curl:test"));
        let script = inits[0]["command"][2].as_str().unwrap();
        assert!(script.starts_with(
            "curl -o /etc/ca/ca.pem http://127.0.0.1:8006/cdh/resource/default/certs/ca && "
        ));
        assert!(script.contains("curl -o /run/secrets/all/unused "));
        assert_eq!(inits[0]["volumeMounts"].as_sequence().unwrap().len(), 2);

        for volume in spec["volumes"].as_sequence().unwrap() {
            assert!(volume.get("secret").is_none());
            assert_eq!(volume["emptyDir"]["medium"], Value::from("Memory"));
        }
        assert_eq!(outcome.kbs_resources.len(), 2);
    }

    #[test]
    fn init_container_env_key_reaches_sealed_secret() {
        let cluster = MockCluster::new().with_secret(
            "default",
            "db",
            SecretData::new([("pw", "hunter2"), ("token", "t0k3n")]),
        );
        let (manifest, outcome) = run(
            r#"
kind: Pod
metadata:
  name: app
spec:
  initContainers:
  - name: migrate
    env:
    - name: TOKEN
      valueFrom:
        secretKeyRef:
          name: db
          key: token
  containers:
  - name: c1
    env:
    - name: DB
      valueFrom:
        secretKeyRef:
          name: db
          key: pw
"#,
            &cluster,
        );

        let spec = manifest.get_pod_spec().unwrap();
        let token = &spec["initContainers"][0]["env"][0];
        assert!(token.get("valueFrom").is_none());
        assert_eq!(sealed_name(&token["value"]), "kbs:///default/db/token");
        assert_eq!(outcome.kbs_resources["default/db/token"], b"t0k3n".to_vec());

        let sealed = outcome.sealed_secrets[0].value();
        assert!(sealed["stringData"].get("pw").is_some());
        assert!(sealed["stringData"].get("token").is_some());
    }

    #[test]
    fn projected_source_keys_reach_sealed_secret() {
        let cluster = MockCluster::new().with_secret(
            "default",
            "certs",
            SecretData::new([("ca.crt", "CA"), ("extra", "x")]),
        );
        let (manifest, outcome) = run(
            r#"
kind: Pod
metadata:
  name: app
spec:
  containers:
  - name: c1
    volumeMounts:
    - name: bundle
      mountPath: /etc/bundle
  volumes:
  - name: bundle
    projected:
      sources:
      - secret:
          name: certs
          items:
          - key: ca.crt
"#,
            &cluster,
        );

        let spec = manifest.get_pod_spec().unwrap();
        assert_eq!(
            spec["volumes"][0]["projected"]["sources"][0]["secret"]["name"],
            Value::from("certs-sealed")
        );
        assert!(spec.get("initContainers").is_none());

        let sealed = &outcome.sealed_secrets[0];
        assert_eq!(sealed.get_name(), "certs-sealed");
        assert!(sealed.value()["stringData"].get("ca.crt").is_some());
        assert!(sealed.value()["stringData"].get("extra").is_none());
    }

    #[test]
    fn keys_sharing_a_kbs_path_are_refused() {
        let cluster = MockCluster::new().with_secret(
            "default",
            "cfg",
            SecretData::new([("a", "1"), (".a", "2")]),
        );
        let mut manifest = parse_one(
            "kind: Pod\nmetadata:\n  name: app\nspec:\n  containers:\n  - name: c\n    envFrom:\n    - secretRef:\n        name: cfg\n",
        );
        let refs = detect_secrets(&manifest).unwrap();
        let resolved = inspect(refs, &cluster, "default").unwrap();
        assert!(matches!(
            SecretRewriter::new("curl:test").rewrite(&mut manifest, &resolved),
            Err(Error::Resolution(_))
        ));
    }

    #[rstest]
    #[case("/etc/tls/tls.crt", "/etc/tls/tls.crt")]
    #[case("/etc/app/my key", "'/etc/app/my key'")]
    #[case("/etc/app/$(id)", "'/etc/app/$(id)'")]
    #[case("/etc/app/it's", r"'/etc/app/it'\''s'")]
    fn shell_quoting(#[case] word: &str, #[case] quoted: &str) {
        assert_eq!(shell_quote(word), quoted);
    }

    #[test]
    fn volume_paths_are_quoted() {
        let cluster = MockCluster::new().with_secret("default", "odd", SecretData::new([("a;b", "x")]));
        let (manifest, _) = run(
            "kind: Pod\nmetadata:\n  name: app\nspec:\n  containers:\n  - name: c\n    volumeMounts:\n    - name: odd\n      mountPath: /etc/odd\n  volumes:\n  - name: odd\n    secret:\n      secretName: odd\n",
            &cluster,
        );
        let script = manifest.get_pod_spec().unwrap()["initContainers"][0]["command"][2]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(
            script,
            "curl -o '/etc/odd/a;b' 'http://127.0.0.1:8006/cdh/resource/default/odd/a;b'"
        );
    }

    #[rstest]
    #[case(&[(".dockerconfigjson", "{}")], "dockerconfigjson")]
    #[case(&[("other", "x"), (".dockercfg", "{}")], "dockercfg")]
    #[case(&[("zeta", "x"), ("alpha", "y")], "alpha")]
    fn pull_secret_only(#[case] data: &[(&str, &str)], #[case] key: &str) {
        let cluster = MockCluster::new().with_secret("default", "regcred", SecretData::new(data.iter().copied()));
        let yaml = "kind: Pod\nmetadata:\n  name: app\nspec:\n  imagePullSecrets:\n  - name: regcred\n  containers:\n  - name: c\n";
        let (manifest, outcome) = run(yaml, &cluster);

        assert_eq!(manifest.get_image_pull_secrets(), vec!["regcred".to_string()]);
        assert!(outcome.sealed_secrets.is_empty());
        assert_eq!(
            outcome.image_pull_secret_uris,
            vec![ResourceUri::new("default", "regcred", key)]
        );
        assert!(outcome
            .kbs_resources
            .contains_key(&format!("default/regcred/{key}")));
    }

    #[test]
    fn no_secrets_no_outcome() {
        let (_, outcome) = run(
            "kind: Pod\nmetadata:\n  name: app\nspec:\n  containers:\n  - name: c\n",
            &MockCluster::new(),
        );
        assert!(outcome.sealed_secrets.is_empty());
        assert!(outcome.kbs_resources.is_empty());
    }
}
