// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use chrono::{DateTime, Utc};
use log::{info, warn};
use resource_uri::ResourceUri;
use serde::Serialize;

use crate::{Error, Result};

pub const ATTESTATION_STATUS_SUCCESS: &str = "success";

pub fn attestation_status_uri() -> ResourceUri {
    ResourceUri::new("default", "attestation-status", "status")
}

/// Attestation outcome captured once at startup.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttestationStatus {
    pub attested: bool,

    /// What CDH returned, or why nothing came back.
    pub detail: String,

    pub checked_at: DateTime<Utc>,
}

/// Client of the CDH resource endpoint inside the guest.
pub struct CdhClient {
    client: reqwest::Client,
    endpoint: String,
}

impl CdhClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch the bytes behind `uri`. Anything but 200 is an error.
    pub async fn get_resource(&self, uri: &ResourceUri) -> Result<Vec<u8>> {
        let url = uri.cdh_url(&self.endpoint);
        let fetch_error = |source| Error::Fetch {
            uri: uri.whole_uri(),
            source,
        };

        let response = self.client.get(&url).send().await.map_err(fetch_error)?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::FetchStatus {
                uri: uri.whole_uri(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(fetch_error)?;
        info!("fetched {uri} ({} bytes)", body.len());
        Ok(body.to_vec())
    }

    /// Never fails: a CDH error means the pod is not attested.
    pub async fn attestation_status(&self) -> AttestationStatus {
        let (attested, detail) = match self.get_resource(&attestation_status_uri()).await {
            Ok(body) => {
                let value = String::from_utf8_lossy(&body).trim().to_string();
                (value == ATTESTATION_STATUS_SUCCESS, value)
            }
            Err(e) => {
                warn!("attestation status unavailable: {e}");
                (false, e.to_string())
            }
        };
        AttestationStatus {
            attested,
            detail,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, net::SocketAddr};

    use hyper::{
        service::{make_service_fn, service_fn},
        Body, Request, Response, Server, StatusCode,
    };
    use rstest::rstest;

    use super::*;

    /// Serves `status` with `body` for every GET to `path`, 404 otherwise.
    async fn fake_cdh(path: &'static str, status: StatusCode, body: &'static str) -> SocketAddr {
        let make = make_service_fn(move |_| async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = if req.uri().path() == path {
                    status
                } else {
                    StatusCode::NOT_FOUND
                };
                Ok::<_, Infallible>(response)
            }))
        });
        let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn get_resource() {
        let addr = fake_cdh(
            "/cdh/resource/default/sidecar-tls/client-ca",
            StatusCode::OK,
            "PEM",
        )
        .await;
        let client = CdhClient::new(&format!("http://{addr}/"));
        let uri = ResourceUri::new("default", "sidecar-tls", "client-ca");
        assert_eq!(client.get_resource(&uri).await.unwrap(), b"PEM");

        let missing = ResourceUri::new("default", "sidecar-tls", "other");
        assert!(matches!(
            client.get_resource(&missing).await,
            Err(Error::FetchStatus { status: 404, .. })
        ));
    }

    #[rstest]
    #[case(StatusCode::OK, "success\n", true)]
    #[case(StatusCode::OK, "failed", false)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, "success", false)]
    #[tokio::test]
    async fn attestation(#[case] status: StatusCode, #[case] body: &'static str, #[case] attested: bool) {
        let addr = fake_cdh("/cdh/resource/default/attestation-status/status", status, body).await;
        let result = CdhClient::new(&format!("http://{addr}"))
            .attestation_status()
            .await;
        assert_eq!(result.attested, attested);
    }

    #[tokio::test]
    async fn cdh_unreachable() {
        let result = CdhClient::new("http://127.0.0.1:1").attestation_status().await;
        assert!(!result.attested);
        assert!(!result.detail.is_empty());
    }
}
