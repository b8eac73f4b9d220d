// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! mTLS front for a Confidential Containers pod. Its certificates come from
//! KBS through the local CDH, so they only exist once the pod is attested.

pub mod cdh;
pub mod config;
pub mod error;
pub mod proxy;
pub mod router;
pub mod server;
pub mod tls;

pub use error::{Error, Result};

use log::info;

use crate::{
    cdh::CdhClient,
    config::SidecarEnv,
    router::{Router, SidecarState},
    server::SidecarServer,
};

/// Fetch the TLS material, capture the attestation status and serve until
/// the process exits.
pub async fn run(env: SidecarEnv) -> Result<()> {
    let cdh = CdhClient::new(&env.cdh_endpoint);
    let cert = cdh.get_resource(&env.tls_cert_uri).await?;
    let key = cdh.get_resource(&env.tls_key_uri).await?;
    let client_ca = cdh.get_resource(&env.client_ca_uri).await?;
    let tls = tls::server_config(&cert, &key, &client_ca)?;

    let attestation = cdh.attestation_status().await;
    info!("attested: {} ({})", attestation.attested, attestation.detail);

    if env.forward_port > 0 {
        info!("forwarding to 127.0.0.1:{}", env.forward_port);
    }
    let router = Router::new(SidecarState::new(&env, attestation));
    let listener = SidecarServer::bind(env.https_port).await?;
    SidecarServer::new(tls, router).serve(listener).await
}
