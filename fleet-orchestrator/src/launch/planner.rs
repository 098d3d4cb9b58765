// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    cloud::{ChargingMode, CloudApi, CloudError, InstanceId, RunInstancesRequest, Tag},
    infra::{RegionInfo, ZoneInfo},
    launch::{Instance, InstanceType, RegionCreateManager, SshProbePool},
    orchestrator::{cli::ProviderConfig, inventory::HostSpec, OrchError, OrchResult, STATE},
};
use std::{net::IpAddr, sync::Arc};
use tracing::{error, info, warn};

// Launch parameters shared by every region of one provider section.
#[derive(Clone, Debug)]
pub struct LaunchConfig {
    pub user_tag: String,
    pub ssh_user: String,
    pub provider: String,
    pub disk_size_gb: u32,
    pub use_spot: bool,
    pub additional_nodes: u32,
    pub tags: Vec<Tag>,
}

impl LaunchConfig {
    pub fn from_provider(config: &ProviderConfig) -> Self {
        LaunchConfig {
            user_tag: config.user_tag.clone(),
            ssh_user: config.ssh_user(),
            provider: STATE.provider_label.to_string(),
            disk_size_gb: config.disk_size_gb.unwrap_or(STATE.default_disk_size_gb),
            use_spot: config.use_spot,
            additional_nodes: 0,
            tags: vec![
                Tag::new(STATE.common_tag_key, STATE.common_tag_value),
                Tag::new(STATE.user_tag_key, &config.user_tag),
            ],
        }
    }
}

// Row-major walk over (type x zone). The position is explicit so the
// planner resumes from where it left off after waking from a wait.
struct TypeZonePlan<'a> {
    types: &'a [InstanceType],
    zones: &'a [ZoneInfo],
    position: usize,
}

impl<'a> TypeZonePlan<'a> {
    fn new(types: &'a [InstanceType], zones: &'a [ZoneInfo]) -> Self {
        TypeZonePlan {
            types,
            zones,
            position: 0,
        }
    }
}

impl<'a> Iterator for TypeZonePlan<'a> {
    type Item = (&'a InstanceType, &'a ZoneInfo);

    fn next(&mut self) -> Option<Self::Item> {
        if self.zones.is_empty() || self.position >= self.types.len() * self.zones.len() {
            return None;
        }
        let item = (
            &self.types[self.position / self.zones.len()],
            &self.zones[self.position % self.zones.len()],
        );
        self.position += 1;
        Some(item)
    }
}

// Drive one region from a node count to a list of ssh-reachable hosts,
// swapping instance types and zones whenever stock runs out. Returns the
// hosts that made it to ready; a shortfall is logged, not fatal.
pub async fn create_instances_in_region(
    api: Arc<dyn CloudApi>,
    cfg: &LaunchConfig,
    region_info: &RegionInfo,
    instance_types: &[InstanceType],
    node_count: u32,
    pool: SshProbePool,
) -> OrchResult<Vec<HostSpec>> {
    let Some(default_type) = instance_types.first() else {
        return Err(OrchError::Init {
            dbg: "request declares no instance types".to_string(),
        });
    };

    let manager = Arc::new(RegionCreateManager::with_slack(
        region_info.region_id.clone(),
        node_count,
        cfg.additional_nodes,
    ));
    let (describe_task, ssh_task) = manager.clone().spawn_tasks(api.clone(), pool);

    let outcome = drive(
        api.as_ref(),
        cfg,
        region_info,
        instance_types,
        default_type,
        node_count,
        &manager,
    )
    .await;

    manager.close();
    let _ = describe_task.await;
    let _ = ssh_task.await;

    outcome?;
    Ok(make_host_specs(manager.copy_ready(), region_info, cfg))
}

async fn drive(
    api: &dyn CloudApi,
    cfg: &LaunchConfig,
    region_info: &RegionInfo,
    instance_types: &[InstanceType],
    default_type: &InstanceType,
    node_count: u32,
    manager: &RegionCreateManager,
) -> OrchResult<()> {
    // Fast path: place the whole request in one zone with the preferred
    // type, taking the first zone that yields anything.
    let amount = node_count.div_ceil(default_type.nodes_per_host);
    for zone in &region_info.zones {
        let ids = run_instances_in_zone(api, cfg, region_info, zone, default_type, amount, false)
            .await?;
        if ids.is_empty() {
            continue;
        }
        if (ids.len() as u32) < amount {
            warn!(
                "partial launch in {}/{} even with the full minimum",
                region_info.region_id, zone.zone_id
            );
        }
        manager.submit_pending(&ids, default_type, &zone.zone_id);
        break;
    }

    // Fallback: walk every (type, zone) pair, accepting partial grants.
    // The preferred type stays in the rotation; stock exhaustion is often
    // transient.
    let mut plan = TypeZonePlan::new(instance_types, &region_info.zones);
    let mut current = plan.next();
    loop {
        let rest = manager.get_rest_nodes(false).await?;
        if rest == 0 {
            info!("region {} launch complete", region_info.region_id);
            return Ok(());
        }
        let Some((instance_type, zone)) = current else {
            break;
        };

        let amount = rest.div_ceil(instance_type.nodes_per_host);
        let ids =
            run_instances_in_zone(api, cfg, region_info, zone, instance_type, amount, true).await?;
        if !ids.is_empty() {
            manager.submit_pending(&ids, instance_type, &zone.zone_id);
        }
        if (ids.len() as u32) < amount {
            current = plan.next();
        }
    }

    // Every combination is exhausted; drain outstanding pendings and
    // report whatever shortfall remains.
    let rest = manager.get_rest_nodes(true).await?;
    if rest > 0 {
        error!(
            "cannot launch enough nodes in {}: requested {}, ready {}",
            region_info.region_id,
            node_count,
            manager.ready_nodes()
        );
    }
    Ok(())
}

async fn run_instances_in_zone(
    api: &dyn CloudApi,
    cfg: &LaunchConfig,
    region_info: &RegionInfo,
    zone: &ZoneInfo,
    instance_type: &InstanceType,
    amount: u32,
    allow_partial: bool,
) -> OrchResult<Vec<InstanceId>> {
    let request = RunInstancesRequest {
        region: region_info.region_id.clone(),
        zone: zone.zone_id.clone(),
        image_id: region_info.image_id.clone(),
        instance_type: instance_type.name.clone(),
        subnet_id: zone.subnet_id.clone(),
        security_group_id: region_info.security_group_id.clone(),
        key_pair_name: region_info.key_pair_name.clone(),
        name: STATE.instance_name(&cfg.user_tag),
        tags: cfg.tags.clone(),
        count: amount as usize,
        min_count: if allow_partial { 1 } else { amount as usize },
        disk_size_gb: cfg.disk_size_gb,
        charging: if cfg.use_spot {
            ChargingMode::Spot
        } else {
            ChargingMode::OnDemand
        },
    };

    let result = match api.run_instances(&request).await {
        // spot first, then one on-demand attempt for the same tuple
        Err(err) if err.is_no_stock() && request.charging == ChargingMode::Spot => {
            warn!(
                "no spot stock for {}/{} type {}, retrying on-demand",
                region_info.region_id, zone.zone_id, instance_type.name
            );
            api.run_instances(&request.clone().on_demand()).await
        }
        result => result,
    };

    match result {
        Ok(ids) => {
            info!(
                "created instances at {}/{}: type={}, amount={}, ids={:?}",
                region_info.region_id,
                zone.zone_id,
                instance_type.name,
                ids.len(),
                ids
            );
            Ok(ids)
        }
        Err(CloudError::Auth { dbg }) => Err(OrchError::Auth { dbg }),
        Err(err) if err.is_no_stock() => {
            warn!(
                "no stock for {}/{}, type {}, amount {}",
                region_info.region_id, zone.zone_id, instance_type.name, amount
            );
            Ok(Vec::new())
        }
        Err(err) => {
            error!(
                "run_instances failed for {}/{}: {}",
                region_info.region_id, zone.zone_id, err
            );
            Ok(Vec::new())
        }
    }
}

fn make_host_specs(
    ready: Vec<(Instance, IpAddr)>,
    region_info: &RegionInfo,
    cfg: &LaunchConfig,
) -> Vec<HostSpec> {
    ready
        .into_iter()
        .map(|(instance, ip)| HostSpec {
            ip: ip.to_string(),
            nodes_per_host: instance.instance_type.nodes_per_host,
            ssh_user: cfg.ssh_user.clone(),
            ssh_key_path: Some(region_info.ssh_key_path.display().to_string()),
            provider: cfg.provider.clone(),
            region: region_info.region_id.to_string(),
            instance_id: instance.instance_id.into_string(),
        })
        .collect()
}
