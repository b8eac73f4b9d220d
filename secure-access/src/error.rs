// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid environment: {0}")]
    Env(String),

    #[error("failed to fetch {uri} from CDH")]
    Fetch {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("CDH answered {status} for {uri}")]
    FetchStatus { uri: String, status: u16 },

    #[error("invalid TLS material: {0}")]
    Tls(String),

    #[error("rustls error")]
    Rustls(#[from] rustls::Error),

    #[error("failed to listen on port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error(transparent)]
    ResourceUri(#[from] resource_uri::ResourceUriError),
}
