// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{convert::Infallible, sync::Arc, time::Duration};

use hyper::{server::conn::Http, service::service_fn, Body, Request};
use log::{debug, info, warn};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::{router::Router, tls, Error, Result};

pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTPS front of the sidecar. Each connection is served on its own task.
pub struct SidecarServer {
    acceptor: TlsAcceptor,
    router: Arc<Router>,
}

impl SidecarServer {
    pub fn new(tls: Arc<ServerConfig>, router: Router) -> Self {
        Self {
            acceptor: TlsAcceptor::from(tls),
            router: Arc::new(router),
        }
    }

    pub async fn bind(port: u16) -> Result<TcpListener> {
        TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| Error::Bind { port, source })
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("secure-access listening on https://{addr}");
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let router = self.router.clone();
            tokio::spawn(async move {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("TLS handshake with {peer} failed: {e}");
                        return;
                    }
                };
                let common_name = tls::peer_common_name(stream.get_ref().1.peer_certificates())
                    .unwrap_or_else(|| "-".into());

                let service = service_fn(move |req: Request<Body>| {
                    let router = router.clone();
                    let common_name = common_name.clone();
                    async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_string();
                        let response = router.route(req, peer).await;
                        info!(
                            "{common_name} {peer} {method} {path} {}",
                            response.status().as_u16()
                        );
                        Ok::<_, Infallible>(response)
                    }
                });

                if let Err(e) = Http::new()
                    .http1_only(true)
                    .http1_header_read_timeout(HEADER_READ_TIMEOUT)
                    .serve_connection(stream, service)
                    .with_upgrades()
                    .await
                {
                    debug!("connection from {peer} ended: {e}");
                }
            });
        }
    }
}
