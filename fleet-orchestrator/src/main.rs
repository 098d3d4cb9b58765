// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]
use crate::cloud::{CloudApi, RegionId};
use crate::launch::SshProbePool;
use crate::orchestrator::{
    cli::{Cli, Command, RequestConfig},
    CreateOptions, OrchResult, STATE,
};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod cleanup;
mod cloud;
mod infra;
mod launch;
mod orchestrator;

#[tokio::main]
async fn main() -> OrchResult<()> {
    let unique_id = format!(
        "{}-{}",
        humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
        STATE.version
    );

    let file_appender =
        tracing_appender::rolling::daily(STATE.log_dir, format!("fleet_{}.log", unique_id));
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(non_blocking)
        .init();

    let cli = Cli::parse();
    let api: Arc<dyn CloudApi> = Arc::new(cloud::aws::Ec2Cloud::from_env());

    match cli.command {
        Command::Create(args) => {
            let config = RequestConfig::from_file(&args.request_config)?;
            let pool = SshProbePool::new(STATE.ssh_probe_pool_size);
            orchestrator::run_create(
                api,
                pool,
                &config.aws,
                &CreateOptions {
                    allow_create_infra: args.allow_create_infra,
                    infra_only: args.infra_only,
                    output: args.output,
                },
            )
            .await
        }
        Command::Cleanup(args) => {
            cleanup::run_cleanup(
                api,
                cleanup::CleanupRequest {
                    regions: args
                        .regions
                        .iter()
                        .map(|region| RegionId::from(region.as_str()))
                        .collect(),
                    user_tag: args.user_tag,
                    inventory_file: args.inventory_file,
                    delete_network: args.delete_network,
                },
            )
            .await
        }
    }
}
