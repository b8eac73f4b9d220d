// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Sealed secrets reference a KBS resource that the guest fetches when the
//! container starts. The string layout is
//! `sealed`.`JWS header`.`JWS body (secret content)`.`signature`. Header and
//! signature are fixed sentinels, only the body carries information.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as b64, Engine};
use resource_uri::ResourceUri;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const VERSION: &str = "0.1.0";

const PREFIX: &str = "sealed";
const FAKE_HEADER: &str = "fakejwsheader";
const FAKE_SIGNATURE: &str = "fakesignature";
const KBS_PROVIDER: &str = "kbs";

#[derive(Error, Debug)]
pub enum SealedSecretError {
    #[error("malformed sealed secret: expected 4 '.'-separated parts, got {0}")]
    PartCount(usize),

    #[error("sealed secret body is not base64url")]
    Base64(#[from] base64::DecodeError),

    #[error("sealed secret body is not valid JSON")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct VaultSecret {
    /// KBS resource URI of the secret value
    pub name: String,

    pub provider: String,

    pub provider_settings: Map<String, Value>,

    pub annotations: Map<String, Value>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SecretContent {
    Vault(VaultSecret),
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct SealedSecret {
    pub version: String,

    #[serde(flatten)]
    pub r#type: SecretContent,
}

impl SealedSecret {
    /// A vault secret served by the KBS provider.
    pub fn for_resource(uri: &ResourceUri) -> Self {
        Self {
            version: VERSION.into(),
            r#type: SecretContent::Vault(VaultSecret {
                name: uri.whole_uri(),
                provider: KBS_PROVIDER.into(),
                provider_settings: Map::new(),
                annotations: Map::new(),
            }),
        }
    }

    pub fn to_sealed_string(&self) -> Result<String, SealedSecretError> {
        let body = serde_json::to_string(self)?;
        Ok(format!(
            "{PREFIX}.{FAKE_HEADER}.{}.{FAKE_SIGNATURE}",
            b64.encode(body)
        ))
    }

    pub fn from_sealed_string(sealed: &str) -> Result<Self, SealedSecretError> {
        let body = decode_body(sealed)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn decode_body(sealed: &str) -> Result<Vec<u8>, SealedSecretError> {
    let sections: Vec<_> = sealed.trim().split('.').collect();
    if sections.len() != 4 {
        return Err(SealedSecretError::PartCount(sections.len()));
    }

    Ok(b64.decode(sections[2])?)
}

/// Encode the sealed literal pointing at `uri`.
pub fn encode(uri: &ResourceUri) -> Result<String, SealedSecretError> {
    SealedSecret::for_resource(uri).to_sealed_string()
}

/// Decode the JSON payload of a sealed literal, for auditing.
pub fn decode(sealed: &str) -> Result<Value, SealedSecretError> {
    let body = decode_body(sealed)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Validate that `uri` has the `kbs:///ns/secret/key` shape.
pub fn parse_resource_uri(uri: &str) -> Result<ResourceUri, resource_uri::ResourceUriError> {
    ResourceUri::try_from(uri)
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use resource_uri::ResourceUri;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[test]
    fn encode_layout() {
        let uri = ResourceUri::new("default", "db", "pw");
        let sealed = encode(&uri).unwrap();
        let parts: Vec<_> = sealed.split('.').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "sealed");
        assert_eq!(parts[1], "fakejwsheader");
        assert_eq!(parts[3], "fakesignature");
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        let body = decode(&sealed).unwrap();
        assert_json_eq!(
            body,
            json!({
                "version": "0.1.0",
                "type": "vault",
                "name": "kbs:///default/db/pw",
                "provider": "kbs",
                "provider_settings": {},
                "annotations": {},
            })
        );
    }

    #[test]
    fn encode_is_deterministic() {
        let uri = ResourceUri::new("ns", "regcred", ".dockerconfigjson");
        assert_eq!(encode(&uri).unwrap(), encode(&uri).unwrap());
        let body = decode(&encode(&uri).unwrap()).unwrap();
        assert_eq!(body["name"], "kbs:///ns/regcred/dockerconfigjson");
    }

    #[rstest]
    fn no_padding(#[values(0, 1, 2, 3)] name_size: usize) {
        let uri = ResourceUri::new("default", &"s".repeat(name_size + 1), "k");
        assert!(!encode(&uri).unwrap().contains('='));
    }

    #[test]
    fn typed_round_trip() {
        let uri = ResourceUri::new("team", "api", "token");
        let secret = SealedSecret::for_resource(&uri);
        let parsed = SealedSecret::from_sealed_string(&secret.to_sealed_string().unwrap()).unwrap();
        assert_eq!(parsed, secret);
    }

    #[rstest]
    #[case("sealed.fakejwsheader.fakesignature", "malformed")]
    #[case("sealed.fakejwsheader.!!!.fakesignature", "base64")]
    #[case("sealed.fakejwsheader.bm90LWpzb24.fakesignature", "json")]
    fn decode_errors(#[case] input: &str, #[case] kind: &str) {
        let err = decode(input).unwrap_err();
        let matched = match kind {
            "malformed" => matches!(err, SealedSecretError::PartCount(3)),
            "base64" => matches!(err, SealedSecretError::Base64(_)),
            _ => matches!(err, SealedSecretError::Json(_)),
        };
        assert!(matched, "unexpected error {err:?}");
    }

    #[test]
    fn parse_uri_shape() {
        assert!(parse_resource_uri("kbs:///default/db/pw").is_ok());
        assert!(parse_resource_uri("kbs:///default/db").is_err());
    }
}
