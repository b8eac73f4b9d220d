// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! mTLS listener configuration: TLS 1.3 only, and every client must present a
//! certificate signed by the developer CA.

use std::sync::Arc;

use rustls::{
    crypto::{ring, CryptoProvider},
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};

use crate::{Error, Result};

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificate in PEM".into()));
    }
    Ok(certs)
}

pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| Error::Tls(format!("failed to parse private key: {e}")))
}

pub fn server_config(cert_pem: &[u8], key_pem: &[u8], client_ca_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(client_ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("failed to add client CA: {e}")))?;
    }

    let provider = crypto_provider();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| Error::Tls(format!("client verifier error: {e}")))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(parse_certificates(cert_pem)?, parse_private_key(key_pem)?)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Common Name of the first certificate of the peer chain.
pub fn peer_common_name(chain: Option<&[CertificateDer<'_>]>) -> Option<String> {
    let cert = chain?.first()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let cn = parsed.subject().iter_common_name().next()?.as_str().ok()?;
    Some(cn.to_string())
}

#[cfg(test)]
mod tests {
    use kubectl_coco::pki::CertificateAuthority;

    use super::*;

    #[test]
    fn builds_server_config() {
        let ca = CertificateAuthority::new("test-ca").unwrap();
        let server = ca
            .issue_server_cert("app", &["localhost".into()], &["127.0.0.1".parse().unwrap()])
            .unwrap();
        let config = server_config(
            server.cert_pem.as_bytes(),
            server.key_pem.as_bytes(),
            ca.cert_pem().unwrap().as_bytes(),
        )
        .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            server_config(b"nope", b"nope", b"nope"),
            Err(Error::Tls(_))
        ));
    }

    #[test]
    fn common_name() {
        let ca = CertificateAuthority::new("test-ca").unwrap();
        let client = ca.issue_client_cert("alice").unwrap();
        let chain = parse_certificates(client.cert_pem.as_bytes()).unwrap();
        assert_eq!(peer_common_name(Some(chain.as_slice())), Some("alice".into()));
        assert_eq!(peer_common_name(None), None);
    }
}
