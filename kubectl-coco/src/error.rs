// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

use crate::sealed::SealedSecretError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to load config file {path}")]
    ConfigFile {
        path: String,
        #[source]
        source: config::ConfigError,
    },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("failed to parse YAML document {index} of {path}")]
    ManifestParse {
        path: String,
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("resolution error: {0}")]
    Resolution(String),

    #[error("KBS population failed, paths not written: {}", missing.join(", "))]
    Population {
        missing: Vec<String>,
        #[source]
        source: Box<Error>,
    },

    #[error("cluster rejected {path}, the transformed manifest is kept for inspection")]
    Apply {
        path: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to render initdata: {0}")]
    Initdata(String),

    #[error("cluster command failed: {0}")]
    Cluster(String),

    #[error("sealed secret error")]
    SealedSecret(#[from] SealedSecretError),

    #[error("invalid resource uri")]
    ResourceUri(#[from] resource_uri::ResourceUriError),

    #[error("certificate operation failed: {context}")]
    Certificate {
        context: String,
        #[source]
        source: openssl::error::ErrorStack,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML serialization failed")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON (de)serialization failed")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn certificate(context: impl Into<String>) -> impl FnOnce(openssl::error::ErrorStack) -> Self {
        let context = context.into();
        move |source| Error::Certificate { context, source }
    }
}
