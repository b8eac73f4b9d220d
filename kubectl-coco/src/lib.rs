// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Turn ordinary Kubernetes workload manifests into Confidential Containers
//! workloads: confidential runtime class, initdata, secrets served by KBS
//! after attestation and an optional mTLS sidecar.

pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
pub mod initdata;
pub mod kbs;
pub mod manifest;
pub mod pki;
pub mod sealed;
pub mod secret;
pub mod sidecar;

pub use error::{Error, Result};
