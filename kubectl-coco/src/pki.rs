// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The developer CA that signs both the sidecar server certificates and the
//! client certificates presented to them.

use std::{
    fs,
    net::IpAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use log::info;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509Name, X509NameBuilder, X509,
    },
};

use crate::{Error, Result};

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
pub const CLIENT_CERT_FILE: &str = "client.crt";
pub const CLIENT_KEY_FILE: &str = "client.key";

pub const CA_COMMON_NAME: &str = "coco-sidecar-ca";
pub const CLIENT_COMMON_NAME: &str = "coco-sidecar-client";

const ORGANIZATION: &str = "Confidential Containers";
const RSA_BITS: u32 = 2048;
const CA_VALIDITY_DAYS: u32 = 3650;
const CERT_VALIDITY_DAYS: u32 = 365;

/// A PEM certificate and its PKCS#8 PEM private key.
#[derive(Clone, Debug)]
pub struct CertifiedKey {
    pub cert_pem: String,
    pub key_pem: String,
}

enum Purpose<'a> {
    Server { dns: &'a [String], ips: &'a [IpAddr] },
    Client,
}

#[derive(Clone)]
pub struct CertificateAuthority {
    cert: X509,
    key: PKey<Private>,
}

impl CertificateAuthority {
    /// A fresh self-signed CA.
    pub fn new(common_name: &str) -> Result<Self> {
        self_signed(common_name).map_err(Error::certificate("generate CA"))
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let cert = X509::from_pem(cert_pem.as_bytes()).map_err(Error::certificate("parse CA certificate"))?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes())
            .map_err(Error::certificate("parse CA key"))?;
        Ok(Self { cert, key })
    }

    /// Load `ca.crt` and `ca.key` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |file: &str| {
            let path = dir.join(file);
            fs::read_to_string(&path).map_err(|e| {
                Error::Config(format!(
                    "cannot read sidecar CA {}: {e}, run `kubectl-coco init-sidecar` first",
                    path.display()
                ))
            })
        };
        let cert_pem = read(CA_CERT_FILE)?;
        let key_pem = read(CA_KEY_FILE)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn cert_pem(&self) -> Result<String> {
        to_string(self.cert.to_pem()).map_err(Error::certificate("encode CA certificate"))
    }

    pub fn key_pem(&self) -> Result<String> {
        to_string(self.key.private_key_to_pem_pkcs8()).map_err(Error::certificate("encode CA key"))
    }

    /// A server certificate for `common_name` valid for the given DNS names
    /// and addresses.
    pub fn issue_server_cert(&self, common_name: &str, dns: &[String], ips: &[IpAddr]) -> Result<CertifiedKey> {
        self.issue(common_name, Purpose::Server { dns, ips })
            .map_err(Error::certificate(format!("issue server certificate for {common_name}")))
    }

    pub fn issue_client_cert(&self, common_name: &str) -> Result<CertifiedKey> {
        self.issue(common_name, Purpose::Client)
            .map_err(Error::certificate(format!("issue client certificate for {common_name}")))
    }

    fn issue(&self, common_name: &str, purpose: Purpose) -> std::result::Result<CertifiedKey, ErrorStack> {
        let key = generate_key()?;
        let mut builder = base_builder(common_name, &key, CERT_VALIDITY_DAYS)?;
        builder.set_issuer_name(self.cert.subject_name())?;

        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        match purpose {
            Purpose::Server { dns, ips } => {
                builder.append_extension(
                    KeyUsage::new()
                        .critical()
                        .digital_signature()
                        .key_encipherment()
                        .build()?,
                )?;
                builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

                let mut san = SubjectAlternativeName::new();
                for name in dns {
                    san.dns(name);
                }
                for ip in ips {
                    san.ip(&ip.to_string());
                }
                let san = san.build(&builder.x509v3_context(Some(&*self.cert), None))?;
                builder.append_extension(san)?;
            }
            Purpose::Client => {
                builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
                builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;
            }
        }

        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&*self.cert), None))?;
        builder.append_extension(aki)?;
        builder.sign(&self.key, MessageDigest::sha256())?;

        Ok(CertifiedKey {
            cert_pem: to_string(builder.build().to_pem())?,
            key_pem: to_string(key.private_key_to_pem_pkcs8())?,
        })
    }
}

fn to_string(pem: std::result::Result<Vec<u8>, ErrorStack>) -> std::result::Result<String, ErrorStack> {
    // PEM is ASCII.
    pem.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn generate_key() -> std::result::Result<PKey<Private>, ErrorStack> {
    PKey::from_rsa(Rsa::generate(RSA_BITS)?)
}

fn subject(common_name: &str) -> std::result::Result<X509Name, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("O", ORGANIZATION)?;
    name.append_entry_by_text("CN", common_name)?;
    Ok(name.build())
}

fn random_serial() -> std::result::Result<Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    serial.to_asn1_integer()
}

fn base_builder(
    common_name: &str,
    key: &PKey<Private>,
    validity_days: u32,
) -> std::result::Result<X509Builder, ErrorStack> {
    let serial = random_serial()?;
    let name = subject(common_name)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(validity_days)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    Ok(builder)
}

fn self_signed(common_name: &str) -> std::result::Result<CertificateAuthority, ErrorStack> {
    let key = generate_key()?;
    let issuer = subject(common_name)?;
    let mut builder = base_builder(common_name, &key, CA_VALIDITY_DAYS)?;
    builder.set_issuer_name(&issuer)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()?,
    )?;
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;
    builder.sign(&key, MessageDigest::sha256())?;

    Ok(CertificateAuthority {
        cert: builder.build(),
        key,
    })
}

fn write_file(path: &Path, content: &str, mode: u32) -> Result<()> {
    fs::write(path, content).map_err(|e| Error::io(format!("write {}", path.display()), e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io(format!("chmod {}", path.display()), e))
}

/// Paths written by [`init_sidecar_ca`].
#[derive(Clone, Debug)]
pub struct SidecarCaFiles {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Create the developer CA and one client certificate in `dir`. An existing
/// CA is reused so that already deployed sidecars keep trusting clients.
pub fn init_sidecar_ca(dir: &Path) -> Result<(CertificateAuthority, SidecarCaFiles)> {
    fs::create_dir_all(dir).map_err(|e| Error::io(format!("create {}", dir.display()), e))?;

    let ca = if dir.join(CA_CERT_FILE).exists() && dir.join(CA_KEY_FILE).exists() {
        info!("Reuse sidecar CA in {}", dir.display());
        CertificateAuthority::load(dir)?
    } else {
        info!("Generate sidecar CA in {}", dir.display());
        let ca = CertificateAuthority::new(CA_COMMON_NAME)?;
        write_file(&dir.join(CA_CERT_FILE), &ca.cert_pem()?, 0o644)?;
        write_file(&dir.join(CA_KEY_FILE), &ca.key_pem()?, 0o600)?;
        ca
    };

    let client = ca.issue_client_cert(CLIENT_COMMON_NAME)?;
    let files = SidecarCaFiles {
        ca_cert: dir.join(CA_CERT_FILE),
        client_cert: dir.join(CLIENT_CERT_FILE),
        client_key: dir.join(CLIENT_KEY_FILE),
    };
    write_file(&files.client_cert, &client.cert_pem, 0o644)?;
    write_file(&files.client_key, &client.key_pem, 0o600)?;
    Ok((ca, files))
}
