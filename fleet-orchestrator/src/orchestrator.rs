// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    cloud::{CloudApi, RegionId},
    infra::{InfraRequest, RegionInfo},
    launch::{self, InstanceType, LaunchConfig, SshProbePool},
};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, warn};

pub mod cli;
mod error;
pub mod inventory;
mod state;

use cli::ProviderConfig;
use inventory::{HostSpec, Inventory};

pub use error::{OrchError, OrchResult};
pub use state::STATE;

pub struct CreateOptions {
    pub allow_create_infra: bool,
    pub infra_only: bool,
    pub output: PathBuf,
}

// The create command: reconcile infra in every requested region, then
// launch fleets region by region and merge the surviving hosts into one
// inventory. A failed region reduces the inventory; it never cancels its
// peers.
pub async fn run_create(
    api: Arc<dyn CloudApi>,
    pool: SshProbePool,
    config: &ProviderConfig,
    options: &CreateOptions,
) -> OrchResult<()> {
    let request = Arc::new(InfraRequest::from_config(config, options.allow_create_infra)?);
    let regions = request.clone().ensure_regions(&api).await?;
    if regions.is_empty() {
        return Err(OrchError::Init {
            dbg: "no region passed infra reconciliation".to_string(),
        });
    }
    info!("infra check passed for {} region(s)", regions.len());

    if options.infra_only {
        return Ok(());
    }

    let (hosts, failed_regions) = launch_all_regions(&api, &pool, config, &regions).await?;
    if failed_regions == regions.len() {
        return Err(OrchError::Init {
            dbg: "every region failed to launch".to_string(),
        });
    }

    let requested_nodes: u32 = config.regions.iter().map(|region| region.count).sum();
    let ready_nodes: u32 = hosts.iter().map(|host| host.nodes_per_host).sum();
    if ready_nodes < requested_nodes {
        warn!("provisioned {ready_nodes} of {requested_nodes} requested workload nodes");
    }

    let inventory = Inventory::new(hosts);
    inventory.save(&options.output)?;
    info!("inventory written to {}", options.output.display());
    Ok(())
}

// Fan the launch out over regions with bounded concurrency, sharing one
// probe pool. Returns the merged hosts and how many regions failed.
pub(crate) async fn launch_all_regions(
    api: &Arc<dyn CloudApi>,
    pool: &SshProbePool,
    config: &ProviderConfig,
    regions: &HashMap<RegionId, RegionInfo>,
) -> OrchResult<(Vec<HostSpec>, usize)> {
    let instance_types: Vec<InstanceType> = config
        .instance_types
        .iter()
        .map(|t| InstanceType::new(&t.name, t.nodes))
        .collect();
    let launch_cfg = Arc::new(LaunchConfig::from_provider(config));
    let semaphore = Arc::new(Semaphore::new(STATE.region_concurrency));
    let mut tasks = JoinSet::new();

    for region_request in &config.regions {
        let region_id = RegionId::from(region_request.name.as_str());
        // regions that failed infra were dropped and already logged
        let Some(info) = regions.get(&region_id) else {
            continue;
        };

        let api = api.clone();
        let pool = pool.clone();
        let info = info.clone();
        let types = instance_types.clone();
        let cfg = launch_cfg.clone();
        let semaphore = semaphore.clone();
        let count = region_request.count;
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let result =
                launch::create_instances_in_region(api, &cfg, &info, &types, count, pool).await;
            (info.region_id.clone(), result)
        });
    }

    let mut hosts = Vec::new();
    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        let (region_id, result) = joined.map_err(|err| OrchError::Init {
            dbg: format!("region task panicked: {err}"),
        })?;
        match result {
            Ok(region_hosts) => {
                info!("region {} contributed {} host(s)", region_id, region_hosts.len());
                hosts.extend(region_hosts);
            }
            Err(err @ OrchError::Auth { .. }) => return Err(err),
            Err(err) => {
                error!("launch failed in {region_id}: {err}");
                failed += 1;
            }
        }
    }
    Ok((hosts, failed))
}
