// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Reverse proxy to the application on loopback. The inbound `Host` header is
//! forwarded untouched.

use std::net::SocketAddr;

use hyper::{
    client::HttpConnector,
    header::{self, HeaderMap, HeaderName, HeaderValue},
    upgrade, Body, Client, Request, Response, StatusCode, Uri,
};
use log::{debug, warn};
use tokio::io::copy_bidirectional;

use crate::{Error, Result};

pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

#[derive(Clone, Debug)]
pub struct ReverseProxy {
    client: Client<HttpConnector>,
    port: u16,
}

impl ReverseProxy {
    pub fn new(port: u16) -> Self {
        Self {
            client: Client::new(),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Forward `req` to the backend, answering 502 when it is unreachable.
    pub async fn forward(&self, req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        match self.try_forward(req, peer).await {
            Ok(response) => response,
            Err(e) => {
                warn!("backend on port {} failed: {e}", self.port);
                let mut response = Response::new(Body::from("Bad Gateway"));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }

    async fn try_forward(&self, mut req: Request<Body>, peer: SocketAddr) -> Result<Response<Body>> {
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://127.0.0.1:{}{path}", self.port)
            .parse()
            .map_err(|e| Error::Proxy(format!("invalid backend uri: {e}")))?;
        *req.uri_mut() = uri;

        let protocol = upgrade_protocol(req.headers());
        let client_upgrade = protocol.is_some().then(|| upgrade::on(&mut req));

        strip_hop_by_hop(req.headers_mut());
        set_forwarded_headers(req.headers_mut(), peer);
        if let Some(protocol) = protocol {
            let headers = req.headers_mut();
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }

        let mut response = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::Proxy(e.to_string()))?;

        if let Some(client_upgrade) = client_upgrade {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let backend_upgrade = upgrade::on(&mut response);
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, backend_upgrade) {
                        Ok((mut client, mut backend)) => {
                            if let Err(e) = copy_bidirectional(&mut client, &mut backend).await {
                                debug!("upgraded connection closed: {e}");
                            }
                        }
                        Err(e) => warn!("connection upgrade failed: {e}"),
                    }
                });
                return Ok(response);
            }
        }

        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

/// `Upgrade` value of a request asking for a protocol switch.
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    wants_upgrade
        .then(|| headers.get(header::UPGRADE).cloned())
        .flatten()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

fn set_forwarded_headers(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();

    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(previous) if !previous.is_empty() => format!("{previous}, {ip}"),
        _ => ip.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(&ip) {
        headers.insert(X_REAL_IP, value);
    }
}
