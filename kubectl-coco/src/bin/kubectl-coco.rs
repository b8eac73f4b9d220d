// Copyright (c) 2025 The Confidential Container Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! kubectl plugin that deploys workloads as Confidential Containers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kubectl_coco::{
    cluster::KubectlCluster,
    config::Config,
    driver::{ApplyOptions, Driver},
    sealed,
};

#[derive(Parser)]
#[command(name = "kubectl-coco")]
#[command(bin_name = "kubectl coco")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Subcommand)]
enum Operation {
    /// Transform a manifest, populate KBS and apply the result
    Apply(ApplyArgs),

    /// Create the sidecar client CA and publish it in KBS
    InitSidecar(InitSidecarArgs),

    /// Print the JSON payload of a sealed secret
    DecodeSealed(DecodeSealedArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Config file, defaults to $HOME/.kube/coco-config.toml
    #[arg(short, long, env = "COCO_CONFIG_PATH")]
    config: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<Config> {
        let path = Config::resolve_path(self.config.clone());
        Config::from_file(&path).with_context(|| format!("failed to load {}", path.display()))
    }
}

#[derive(Args)]
struct ApplyArgs {
    /// Manifest to transform
    #[arg(short = 'f', long = "filename")]
    manifest: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,

    /// Inject the mTLS sidecar regardless of `sidecar.enabled`
    #[arg(long)]
    sidecar: bool,

    /// Extra SAN (DNS name or IP) for the sidecar certificate
    #[arg(long = "sidecar-san")]
    sidecar_sans: Vec<String>,

    /// Only write the transformed manifest
    #[arg(long)]
    skip_apply: bool,

    /// Do not populate KBS
    #[arg(long)]
    skip_upload: bool,

    /// Do not add the attestation check initContainer
    #[arg(long)]
    no_init_container: bool,

    /// Do not inherit the ServiceAccount image pull secret
    #[arg(long)]
    no_sa_lookup: bool,
}

#[derive(Args)]
struct InitSidecarArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Do not upload the CA to KBS
    #[arg(long)]
    skip_upload: bool,
}

#[derive(Args)]
struct DecodeSealedArgs {
    /// The `sealed.` literal
    sealed: String,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();
    let cluster = KubectlCluster::new();

    match cli.operation {
        Operation::Apply(args) => {
            let config = args.config.load()?;
            let options = ApplyOptions {
                manifest: args.manifest,
                apply: !args.skip_apply,
                upload: !args.skip_upload,
                sidecar: args.sidecar.then_some(true),
                sidecar_sans: args.sidecar_sans,
                init_container: !args.no_init_container,
                service_account_lookup: !args.no_sa_lookup,
            };
            let report = Driver::new(&config, &cluster)
                .apply(&options)
                .with_context(|| format!("failed to apply {}", options.manifest.display()))?;
            println!("{}", report.output.display());
        }
        Operation::InitSidecar(args) => {
            let config = args.config.load()?;
            let files = Driver::new(&config, &cluster)
                .init_sidecar(!args.skip_upload)
                .context("failed to initialize the sidecar CA")?;
            println!("client certificate: {}", files.client_cert.display());
            println!("client key: {}", files.client_key.display());
            println!("CA certificate: {}", files.ca_cert.display());
        }
        Operation::DecodeSealed(args) => {
            let payload = sealed::decode(&args.sealed).context("failed to decode sealed secret")?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }

    Ok(())
}
