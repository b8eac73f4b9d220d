// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Pod spec mutations shared by every workload kind.

use serde_yaml::{Mapping, Value};

use super::{get_str, sequence_entry, Manifest};
use crate::{Error, Result};

const CONTAINERS: &str = "containers";
const INIT_CONTAINERS: &str = "initContainers";

fn name_of(value: &Value) -> Option<&str> {
    get_str(value, "name")
}

/// Replace the entry named like `item` in `list`, or insert it at `position`
/// (`None` appends).
fn upsert_named(list: &mut Vec<Value>, item: Value, position: Option<usize>) {
    let name = name_of(&item).map(str::to_string);
    if let Some(existing) = list
        .iter()
        .position(|v| name.is_some() && name_of(v) == name.as_deref())
    {
        match position {
            Some(_) => {
                list.remove(existing);
            }
            None => {
                list[existing] = item;
                return;
            }
        }
    }

    match position {
        Some(index) => list.insert(index.min(list.len()), item),
        None => list.push(item),
    }
}

/// Container or initContainer named `container`. Kubernetes keeps both
/// name sets disjoint.
fn container_mut<'a>(spec: &'a mut Mapping, container: &str) -> Result<&'a mut Mapping> {
    spec.iter_mut()
        .filter(|(key, _)| matches!(key.as_str(), Some(CONTAINERS | INIT_CONTAINERS)))
        .filter_map(|(_, value)| value.as_sequence_mut())
        .flat_map(|cs| cs.iter_mut())
        .find(|c| name_of(c) == Some(container))
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| Error::Manifest(format!("container {container} not found")))
}

/// Every secret name reference of a container, except `imagePullSecrets`
/// which live at the pod level.
fn container_secret_names(container: &mut Value) -> Vec<&mut Value> {
    let mut names = Vec::new();
    let Some(container) = container.as_mapping_mut() else {
        return names;
    };

    for (key, value) in container.iter_mut() {
        let Some(entries) = value.as_sequence_mut() else {
            continue;
        };
        match key.as_str() {
            Some("env") => {
                for env in entries {
                    if let Some(name) = env
                        .get_mut("valueFrom")
                        .and_then(|v| v.get_mut("secretKeyRef"))
                        .and_then(|r| r.get_mut("name"))
                    {
                        names.push(name);
                    }
                }
            }
            Some("envFrom") => {
                for env_from in entries {
                    if let Some(name) = env_from
                        .get_mut("secretRef")
                        .and_then(|r| r.get_mut("name"))
                    {
                        names.push(name);
                    }
                }
            }
            _ => {}
        }
    }
    names
}

impl Manifest {
    /// Prepend an initContainer. One with the same name is replaced.
    pub fn add_init_container(&mut self, container: Value) -> Result<()> {
        let spec = self.pod_spec_mut()?;
        upsert_named(sequence_entry(spec, INIT_CONTAINERS)?, container, Some(0));
        Ok(())
    }

    /// Append a container. One with the same name is replaced in place.
    pub fn add_sidecar_container(&mut self, container: Value) -> Result<()> {
        let spec = self.pod_spec_mut()?;
        upsert_named(sequence_entry(spec, CONTAINERS)?, container, None);
        Ok(())
    }

    /// Append a volume. One with the same name is replaced in place.
    pub fn add_volume(&mut self, volume: Value) -> Result<()> {
        let spec = self.pod_spec_mut()?;
        upsert_named(sequence_entry(spec, "volumes")?, volume, None);
        Ok(())
    }

    /// Mount `mount` into `container_name`, or into every container when the
    /// name is empty. A mount of the same volume at the same path is not
    /// duplicated.
    pub fn add_volume_mount_to_container(&mut self, container_name: &str, mount: Value) -> Result<()> {
        let spec = self.pod_spec_mut()?;
        let containers = spec
            .get_mut(CONTAINERS)
            .and_then(Value::as_sequence_mut)
            .ok_or_else(|| Error::Manifest("pod spec has no containers".into()))?;

        let mut matched = false;
        for container in containers.iter_mut() {
            if !container_name.is_empty() && name_of(container) != Some(container_name) {
                continue;
            }
            matched = true;
            let Some(container) = container.as_mapping_mut() else {
                continue;
            };
            let mounts = sequence_entry(container, "volumeMounts")?;
            let exists = mounts.iter().any(|m| {
                name_of(m) == name_of(&mount)
                    && get_str(m, "mountPath") == get_str(&mount, "mountPath")
            });
            if !exists {
                mounts.push(mount.clone());
            }
        }

        if !matched {
            return Err(Error::Manifest(format!("container {container_name} not found")));
        }
        Ok(())
    }

    /// Rename every reference to secret `old` in containers, initContainers
    /// and volumes. `imagePullSecrets` are left alone. Returns the number of
    /// rewritten references.
    pub fn replace_secret_name(&mut self, old: &str, new: &str) -> Result<usize> {
        let spec = self.pod_spec_mut()?;
        let mut count = 0;
        let mut rename = |value: &mut Value| {
            if value.as_str() == Some(old) {
                *value = Value::from(new);
                count += 1;
            }
        };

        for key in [CONTAINERS, INIT_CONTAINERS] {
            if let Some(containers) = spec.get_mut(key).and_then(Value::as_sequence_mut) {
                for container in containers.iter_mut() {
                    container_secret_names(container).into_iter().for_each(&mut rename);
                }
            }
        }

        if let Some(volumes) = spec.get_mut("volumes").and_then(Value::as_sequence_mut) {
            for volume in volumes.iter_mut() {
                if let Some(name) = volume
                    .get_mut("secret")
                    .and_then(|s| s.get_mut("secretName"))
                {
                    rename(name);
                }
                if let Some(sources) = volume
                    .get_mut("projected")
                    .and_then(|p| p.get_mut("sources"))
                    .and_then(Value::as_sequence_mut)
                {
                    for source in sources.iter_mut() {
                        if let Some(name) = source.get_mut("secret").and_then(|s| s.get_mut("name")) {
                            rename(name);
                        }
                    }
                }
            }
        }

        Ok(count)
    }

    /// Replace `valueFrom` of env var `env_name` in `container` with the
    /// literal `sealed` value.
    pub fn convert_env_secret_to_sealed(&mut self, container: &str, env_name: &str, sealed: &str) -> Result<()> {
        let spec = self.pod_spec_mut()?;
        let target = container_mut(spec, container)?;
        let env = target
            .get_mut("env")
            .and_then(Value::as_sequence_mut)
            .and_then(|env| env.iter_mut().find(|e| name_of(e) == Some(env_name)))
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| {
                Error::Manifest(format!("env var {env_name} not found in container {container}"))
            })?;

        env.shift_remove("valueFrom");
        env.insert(Value::from("value"), Value::from(sealed));
        Ok(())
    }

    /// Drop the `envFrom` entry of `secret_name` in `container` and add one
    /// literal env var per `(key, value)`. The entry's `prefix` is applied to
    /// key names; vars already defined through `env` win as they would in
    /// Kubernetes.
    pub fn convert_env_from_secret(
        &mut self,
        container: &str,
        secret_name: &str,
        vars: &[(String, String)],
    ) -> Result<()> {
        let spec = self.pod_spec_mut()?;
        let target = container_mut(spec, container)?;

        let env_from = target
            .get_mut("envFrom")
            .and_then(Value::as_sequence_mut)
            .ok_or_else(|| Error::Manifest(format!("container {container} has no envFrom")))?;
        let position = env_from
            .iter()
            .position(|e| get_str(&e["secretRef"], "name") == Some(secret_name))
            .ok_or_else(|| {
                Error::Manifest(format!(
                    "envFrom secretRef {secret_name} not found in container {container}"
                ))
            })?;
        let removed = env_from.remove(position);
        let prefix = get_str(&removed, "prefix").unwrap_or_default().to_string();
        if env_from.is_empty() {
            target.shift_remove("envFrom");
        }

        let env = sequence_entry(target, "env")?;
        for (key, value) in vars {
            let name = format!("{prefix}{key}");
            if env.iter().any(|e| name_of(e) == Some(name.as_str())) {
                continue;
            }
            let mut entry = Mapping::new();
            entry.insert(Value::from("name"), Value::from(name));
            entry.insert(Value::from("value"), Value::from(value.as_str()));
            env.push(Value::Mapping(entry));
        }
        Ok(())
    }

    /// Remove the secret volume `volume_name`. Returns whether it existed.
    pub fn remove_secret_volume(&mut self, volume_name: &str) -> Result<bool> {
        let spec = self.pod_spec_mut()?;
        let Some(volumes) = spec.get_mut("volumes").and_then(Value::as_sequence_mut) else {
            return Ok(false);
        };
        let before = volumes.len();
        volumes.retain(|v| !(name_of(v) == Some(volume_name) && v.get("secret").is_some()));
        Ok(volumes.len() != before)
    }

    /// Swap the secret volumes for in-memory emptyDirs of the same names and
    /// prepend `init_container`, which fills them.
    pub fn convert_volume_secret_to_init_container(
        &mut self,
        volume_names: &[&str],
        init_container: Value,
    ) -> Result<()> {
        for volume_name in volume_names {
            if !self.remove_secret_volume(volume_name)? {
                return Err(Error::Manifest(format!(
                    "secret volume {volume_name} not found in {}",
                    self.get_name()
                )));
            }
            self.add_volume(memory_empty_dir(volume_name))?;
        }
        self.add_init_container(init_container)
    }

    pub fn get_image_pull_secrets(&self) -> Vec<String> {
        self.get_pod_spec()
            .ok()
            .and_then(|spec| spec.get("imagePullSecrets"))
            .and_then(Value::as_sequence)
            .map(|list| {
                list.iter()
                    .filter_map(|s| name_of(s).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_image_pull_secrets(&mut self) -> Result<()> {
        self.pod_spec_mut()?.shift_remove("imagePullSecrets");
        Ok(())
    }
}

fn memory_empty_dir(name: &str) -> Value {
    let mut empty_dir = Mapping::new();
    empty_dir.insert(Value::from("medium"), Value::from("Memory"));
    let mut volume = Mapping::new();
    volume.insert(Value::from("name"), Value::from(name));
    volume.insert(Value::from("emptyDir"), Value::Mapping(empty_dir));
    Value::Mapping(volume)
}

#[cfg(test)]
mod tests {
    use serde_yaml::Value;

    use crate::manifest::tests::parse_one;

    const POD: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: app
spec:
  initContainers:
  - name: migrate
    image: busybox
    env:
    - name: TOKEN
      valueFrom:
        secretKeyRef:
          name: db
          key: token
  containers:
  - name: c1
    image: nginx
    env:
    - name: PLAIN
      value: x
    - name: DB
      valueFrom:
        secretKeyRef:
          name: db
          key: pw
    envFrom:
    - configMapRef:
        name: settings
    - secretRef:
        name: cfg
      prefix: APP_
    volumeMounts:
    - name: tls
      mountPath: /etc/tls
  - name: c2
    image: busybox
  imagePullSecrets:
  - name: regcred
  volumes:
  - name: tls
    secret:
      secretName: tls
  - name: bundle
    projected:
      sources:
      - secret:
          name: db
"#;

    fn container<'a>(m: &'a crate::manifest::Manifest, name: &str) -> &'a Value {
        m.get_pod_spec().unwrap()["containers"]
            .as_sequence()
            .unwrap()
            .iter()
            .find(|c| c["name"] == Value::from(name))
            .unwrap()
    }

    #[test]
    fn env_secret_to_sealed() {
        let mut m = parse_one(POD);
        m.convert_env_secret_to_sealed("c1", "DB", "sealed.x.y.z").unwrap();
        let env = &container(&m, "c1")["env"][1];
        assert_eq!(env["value"], Value::from("sealed.x.y.z"));
        assert!(env.get("valueFrom").is_none());

        assert!(m.convert_env_secret_to_sealed("c1", "MISSING", "s").is_err());
        assert!(m.convert_env_secret_to_sealed("nope", "DB", "s").is_err());
    }

    #[test]
    fn env_secret_in_init_container() {
        let mut m = parse_one(POD);
        m.convert_env_secret_to_sealed("migrate", "TOKEN", "sealed.a.b.c").unwrap();
        let env = &m.get_pod_spec().unwrap()["initContainers"][0]["env"][0];
        assert_eq!(env["value"], Value::from("sealed.a.b.c"));
        assert!(env.get("valueFrom").is_none());
    }

    #[test]
    fn env_from_expansion() {
        let mut m = parse_one(POD);
        let vars = vec![("A".to_string(), "sa".to_string()), ("B".to_string(), "sb".to_string())];
        m.convert_env_from_secret("c1", "cfg", &vars).unwrap();
        let c1 = container(&m, "c1");
        let env_from = c1["envFrom"].as_sequence().unwrap();
        assert_eq!(env_from.len(), 1);
        assert!(env_from[0].get("configMapRef").is_some());
        let names: Vec<_> = c1["env"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["PLAIN", "DB", "APP_A", "APP_B"]);

        assert!(m.convert_env_from_secret("c1", "cfg", &vars).is_err());
    }

    #[test]
    fn env_from_removed_when_empty() {
        let mut m = parse_one(
            "kind: Pod\nmetadata:\n  name: p\nspec:\n  containers:\n  - name: c\n    envFrom:\n    - secretRef:\n        name: cfg\n    env:\n    - name: A\n      value: explicit\n",
        );
        m.convert_env_from_secret("c", "cfg", &[("A".into(), "sealed".into()), ("B".into(), "sealed".into())])
            .unwrap();
        let c = container(&m, "c");
        assert!(c.get("envFrom").is_none());
        assert_eq!(c["env"][0]["value"], Value::from("explicit"));
        assert_eq!(c["env"][1]["name"], Value::from("B"));
    }

    #[test]
    fn volume_secret_to_init_container() {
        let mut m = parse_one(POD);
        let init: Value = serde_yaml::from_str("name: get-secrets-tls\nimage: curl\n").unwrap();
        m.convert_volume_secret_to_init_container(&["tls"], init).unwrap();

        let spec = m.get_pod_spec().unwrap();
        let volumes = spec["volumes"].as_sequence().unwrap();
        let tls = volumes.iter().find(|v| v["name"] == Value::from("tls")).unwrap();
        assert!(tls.get("secret").is_none());
        assert_eq!(tls["emptyDir"]["medium"], Value::from("Memory"));
        assert_eq!(spec["initContainers"][0]["name"], Value::from("get-secrets-tls"));
        assert_eq!(spec["initContainers"][1]["name"], Value::from("migrate"));
        assert_eq!(container(&m, "c1")["volumeMounts"][0]["mountPath"], Value::from("/etc/tls"));

        let init: Value = serde_yaml::from_str("name: get-secrets-tls\n").unwrap();
        assert!(m.convert_volume_secret_to_init_container(&["tls"], init).is_err());
    }

    #[test]
    fn init_containers_are_prepended_once() {
        let mut m = parse_one(POD);
        let check: Value = serde_yaml::from_str("name: check\nimage: a\n").unwrap();
        m.add_init_container(check.clone()).unwrap();
        m.add_init_container(check).unwrap();
        let inits = m.get_pod_spec().unwrap()["initContainers"].as_sequence().unwrap().clone();
        assert_eq!(inits.len(), 2);
        assert_eq!(inits[0]["name"], Value::from("check"));
    }

    #[test]
    fn sidecar_is_appended_once() {
        let mut m = parse_one(POD);
        let sidecar: Value = serde_yaml::from_str("name: proxy\nimage: a\n").unwrap();
        m.add_sidecar_container(sidecar).unwrap();
        let sidecar: Value = serde_yaml::from_str("name: proxy\nimage: b\n").unwrap();
        m.add_sidecar_container(sidecar).unwrap();
        let containers = m.get_pod_spec().unwrap()["containers"].as_sequence().unwrap().clone();
        assert_eq!(containers.len(), 3);
        assert_eq!(containers[2]["image"], Value::from("b"));
    }

    #[test]
    fn volume_mounts() {
        let mut m = parse_one(POD);
        let mount: Value = serde_yaml::from_str("name: shared\nmountPath: /shared\n").unwrap();
        m.add_volume_mount_to_container("", mount.clone()).unwrap();
        m.add_volume_mount_to_container("c2", mount.clone()).unwrap();
        assert_eq!(container(&m, "c1")["volumeMounts"].as_sequence().unwrap().len(), 2);
        assert_eq!(container(&m, "c2")["volumeMounts"].as_sequence().unwrap().len(), 1);
        assert!(m.add_volume_mount_to_container("ghost", mount).is_err());
    }

    #[test]
    fn rename_secret_references() {
        let mut m = parse_one(POD);
        assert_eq!(m.replace_secret_name("db", "db-sealed").unwrap(), 3);
        let spec = m.get_pod_spec().unwrap();
        assert_eq!(
            spec["initContainers"][0]["env"][0]["valueFrom"]["secretKeyRef"]["name"],
            Value::from("db-sealed")
        );
        assert_eq!(
            spec["volumes"][1]["projected"]["sources"][0]["secret"]["name"],
            Value::from("db-sealed")
        );
        assert_eq!(m.replace_secret_name("regcred", "regcred-sealed").unwrap(), 0);
        assert_eq!(m.get_image_pull_secrets(), vec!["regcred".to_string()]);
    }

    #[test]
    fn image_pull_secrets() {
        let mut m = parse_one(POD);
        assert_eq!(m.get_image_pull_secrets(), vec!["regcred".to_string()]);
        m.remove_image_pull_secrets().unwrap();
        assert!(m.get_image_pull_secrets().is_empty());
    }
}
