// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use hyper::{
    header::{self, HeaderValue},
    Body, Method, Request, Response, StatusCode,
};
use serde::Serialize;

use crate::{cdh::AttestationStatus, config::SidecarEnv, proxy::ReverseProxy};

pub const STATUS_PATH: &str = "/api/status";
pub const ATTESTATION_PATH: &str = "/api/attestation";
pub const DASHBOARD_PATH: &str = "/dashboard";

/// State captured at startup. Handlers only read it.
#[derive(Clone, Debug)]
pub struct SidecarState {
    pub pod_name: String,
    pub pod_namespace: String,
    pub forward_port: u16,
    pub started_at: DateTime<Utc>,
    pub attestation: AttestationStatus,
}

impl SidecarState {
    pub fn new(env: &SidecarEnv, attestation: AttestationStatus) -> Self {
        Self {
            pod_name: env.pod_name.clone().unwrap_or_else(|| "unknown".into()),
            pod_namespace: env.pod_namespace.clone().unwrap_or_else(|| "unknown".into()),
            forward_port: env.forward_port,
            started_at: Utc::now(),
            attestation,
        }
    }
}

#[derive(Serialize)]
struct StatusBody<'a> {
    status: &'static str,
    pod_name: &'a str,
    pod_namespace: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    forward_port: Option<u16>,
    started_at: String,
}

#[derive(Serialize)]
struct AttestationBody<'a> {
    attested: bool,
    detail: &'a str,
    checked_at: String,
}

pub struct Router {
    state: SidecarState,
    proxy: Option<ReverseProxy>,
}

impl Router {
    pub fn new(state: SidecarState) -> Self {
        let proxy = (state.forward_port > 0).then(|| ReverseProxy::new(state.forward_port));
        Self { state, proxy }
    }

    pub fn state(&self) -> &SidecarState {
        &self.state
    }

    pub async fn route(&self, req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let path = req.uri().path();
        let builtin = match path {
            STATUS_PATH | ATTESTATION_PATH | DASHBOARD_PATH => true,
            "/" => self.proxy.is_none(),
            _ => false,
        };

        if builtin {
            if req.method() != Method::GET && req.method() != Method::HEAD {
                return text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
            }
            return match path {
                STATUS_PATH => self.status(),
                ATTESTATION_PATH => self.attestation(),
                _ => self.dashboard(),
            };
        }

        match &self.proxy {
            Some(proxy) => proxy.forward(req, peer).await,
            None => text(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    fn status(&self) -> Response<Body> {
        json(&StatusBody {
            status: "running",
            pod_name: &self.state.pod_name,
            pod_namespace: &self.state.pod_namespace,
            forward_port: self.proxy.as_ref().map(ReverseProxy::port),
            started_at: self.state.started_at.to_rfc3339(),
        })
    }

    fn attestation(&self) -> Response<Body> {
        let attestation = &self.state.attestation;
        json(&AttestationBody {
            attested: attestation.attested,
            detail: &attestation.detail,
            checked_at: attestation.checked_at.to_rfc3339(),
        })
    }

    fn dashboard(&self) -> Response<Body> {
        let state = &self.state;
        let (badge, class) = if state.attestation.attested {
            ("Attested", "ok")
        } else {
            ("Not attested", "fail")
        };
        let backend = match &self.proxy {
            Some(proxy) => format!(
                "<a href=\"/\">application</a> on port {}",
                proxy.port()
            ),
            None => "none".to_string(),
        };
        let page = format!(
            r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>CoCo secure access: {pod}</title>
<style>
body {{ font-family: sans-serif; margin: 2em; }}
.ok {{ color: #1a7f37; }}
.fail {{ color: #cf222e; }}
td {{ padding: 0.2em 1em 0.2em 0; }}
</style>
</head>
<body>
<h1>{pod}</h1>
<p class="{class}">{badge}</p>
<table>
<tr><td>Namespace</td><td>{namespace}</td></tr>
<tr><td>Attestation</td><td>{detail}</td></tr>
<tr><td>Checked at</td><td>{checked_at}</td></tr>
<tr><td>Started at</td><td>{started_at}</td></tr>
<tr><td>Backend</td><td>{backend}</td></tr>
</table>
</body>
</html>
"#,
            pod = escape_html(&state.pod_name),
            namespace = escape_html(&state.pod_namespace),
            detail = escape_html(&state.attestation.detail),
            checked_at = state.attestation.checked_at.to_rfc3339(),
            started_at = state.started_at.to_rfc3339(),
        );
        respond(StatusCode::OK, "text/html; charset=utf-8", Body::from(page))
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    respond(status, "text/plain; charset=utf-8", Body::from(body))
}

fn json<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(StatusCode::OK, "application/json", Body::from(body)),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain; charset=utf-8",
            Body::from(e.to_string()),
        ),
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use resource_uri::ResourceUri;
    use rstest::rstest;
    use serde_json::Value;

    use super::*;

    fn router(forward_port: u16, attested: bool) -> Router {
        let env = SidecarEnv {
            tls_cert_uri: ResourceUri::new("default", "sidecar-tls-app", "server-cert"),
            tls_key_uri: ResourceUri::new("default", "sidecar-tls-app", "server-key"),
            client_ca_uri: ResourceUri::new("default", "sidecar-tls", "client-ca"),
            https_port: 8443,
            forward_port,
            pod_name: Some("app-<0>".into()),
            pod_namespace: Some("team".into()),
            cdh_endpoint: "http://127.0.0.1:8006".into(),
        };
        let attestation = AttestationStatus {
            attested,
            detail: if attested { "success" } else { "failed" }.into(),
            checked_at: Utc::now(),
        };
        Router::new(SidecarState::new(&env, attestation))
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn status() {
        let response = router(8000, true).route(get(STATUS_PATH), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let value: Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["pod_name"], "app-<0>");
        assert_eq!(value["pod_namespace"], "team");
        assert_eq!(value["forward_port"], 8000);
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    #[tokio::test]
    async fn attestation(#[case] attested: bool) {
        let response = router(0, attested).route(get(ATTESTATION_PATH), peer()).await;
        let value: Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(value["attested"], attested);
    }

    #[rstest]
    #[case(0, "/")]
    #[case(0, DASHBOARD_PATH)]
    #[case(8000, DASHBOARD_PATH)]
    #[tokio::test]
    async fn dashboard(#[case] forward_port: u16, #[case] path: &str) {
        let response = router(forward_port, false).route(get(path), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = body(response).await;
        assert!(page.contains("app-&lt;0&gt;"));
        assert!(page.contains("Not attested"));
    }

    #[tokio::test]
    async fn unknown_path_without_backend() {
        let response = router(0, true).route(get("/foo"), peer()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn post_to_api() {
        let req = Request::builder()
            .method(Method::POST)
            .uri(STATUS_PATH)
            .body(Body::empty())
            .unwrap();
        let response = router(0, true).route(req, peer()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
