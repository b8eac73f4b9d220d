// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! ResourceUri identifies one secret key stored in the KBS repository.
//! The form is always `kbs:///<namespace>/<secret-name>/<key>`, the
//! KBS address is never part of the URI because the guest only knows the
//! KBS configured through initdata.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const RESOURCE_URI_ERROR_INFO: &str =
    "invalid kbs resource uri, should be kbs:///<namespace>/<secret>/<key>";

pub const SCHEME: &str = "kbs";

/// Path prefix of the CDH resource endpoint inside the guest.
pub const CDH_RESOURCE_PATH: &str = "/cdh/resource";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResourceUriError {
    #[error("{RESOURCE_URI_ERROR_INFO}: {0}")]
    Malformed(String),

    #[error("scheme must be kbs, got {0}")]
    Scheme(String),

    #[error("kbs address must be empty, got {0}")]
    Address(String),
}

/// Strip the leading dots of a secret key. KBS refuses repository paths
/// whose segments start with `.`, so `.dockerconfigjson` is stored as
/// `dockerconfigjson`.
pub fn normalize_key(key: &str) -> &str {
    key.trim_start_matches('.')
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceUri {
    pub namespace: String,
    pub secret: String,
    pub key: String,
}

impl ResourceUri {
    /// Build the URI of `key` in secret `secret`. The key is normalized.
    pub fn new(namespace: &str, secret: &str, key: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            secret: secret.to_string(),
            key: normalize_key(key).to_string(),
        }
    }

    pub fn whole_uri(&self) -> String {
        format!("{SCHEME}:///{}", self.resource_path())
    }

    /// Repository-relative path, e.g. `default/db/pw`.
    pub fn resource_path(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.secret, self.key)
    }

    /// Path to request from CDH, e.g. `/cdh/resource/default/db/pw`.
    pub fn cdh_path(&self) -> String {
        format!("{CDH_RESOURCE_PATH}/{}", self.resource_path())
    }

    /// Full CDH URL given its base endpoint, e.g. `http://127.0.0.1:8006`.
    pub fn cdh_url(&self, endpoint: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), self.cdh_path())
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.whole_uri())
    }
}

impl TryFrom<&str> for ResourceUri {
    type Error = ResourceUriError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let url =
            url::Url::parse(value).map_err(|_| ResourceUriError::Malformed(value.to_string()))?;

        if url.scheme() != SCHEME {
            return Err(ResourceUriError::Scheme(url.scheme().to_string()));
        }

        if let Some(host) = url.host_str() {
            if !host.is_empty() {
                return Err(ResourceUriError::Address(host.to_string()));
            }
        }

        let path = url.path().strip_prefix('/').unwrap_or_default();
        let values: Vec<&str> = path.split('/').collect();
        match values[..] {
            [namespace, secret, key]
                if !namespace.is_empty() && !secret.is_empty() && !key.is_empty() =>
            {
                Ok(Self {
                    namespace: namespace.into(),
                    secret: secret.into(),
                    key: key.into(),
                })
            }
            _ => Err(ResourceUriError::Malformed(value.to_string())),
        }
    }
}

impl Serialize for ResourceUri {
    fn serialize<S>(&self, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        ser.serialize_str(&self.whole_uri())
    }
}

impl<'de> Deserialize<'de> for ResourceUri {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let intermediate: String = Deserialize::deserialize(de)?;
        ResourceUri::try_from(&intermediate[..]).map_err(serde::de::Error::custom)
    }
}
