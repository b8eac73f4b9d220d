// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use secure_access::config::SidecarEnv;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let env = SidecarEnv::from_env().context("failed to read sidecar environment")?;
    secure_access::run(env)
        .await
        .context("secure-access sidecar failed")
}
