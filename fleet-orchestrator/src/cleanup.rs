// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    cloud::{
        delete_instances_with_retry, CloudApi, InstanceId, InstanceRecord, InstanceStatus,
        RegionId, StoppedMode,
    },
    infra::wait_for,
    orchestrator::{inventory::Inventory, OrchError, OrchResult, STATE},
};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct CleanupRequest {
    // empty means every region the provider exposes
    pub regions: Vec<RegionId>,
    pub user_tag: Option<String>,
    pub inventory_file: Option<PathBuf>,
    pub delete_network: bool,
}

// Instances are matched on the (common, user) tag pair so one user's
// sweep never touches another user's fleet.
#[derive(Clone, Debug)]
pub struct TagFilter {
    pub common_key: String,
    pub common_value: String,
    pub user_key: String,
    pub user_value: String,
}

impl TagFilter {
    pub fn for_user(user_tag: &str) -> Self {
        TagFilter {
            common_key: STATE.common_tag_key.to_string(),
            common_value: STATE.common_tag_value.to_string(),
            user_key: STATE.user_tag_key.to_string(),
            user_value: user_tag.to_string(),
        }
    }

    pub fn matches(&self, tags: &HashMap<String, String>) -> bool {
        tags.get(&self.common_key) == Some(&self.common_value)
            && tags.get(&self.user_key) == Some(&self.user_value)
    }
}

pub async fn run_cleanup(api: Arc<dyn CloudApi>, request: CleanupRequest) -> OrchResult<()> {
    if let Some(path) = &request.inventory_file {
        let inventory = Inventory::from_file(path)?;
        return cleanup_inventory(api.as_ref(), &inventory).await;
    }

    let user_tag = request.user_tag.clone().ok_or(OrchError::Init {
        dbg: "cleanup needs either --user-tag or --inventory-file".to_string(),
    })?;
    let regions = if request.regions.is_empty() {
        api.describe_regions().await?
    } else {
        request.regions.clone()
    };

    let filter = TagFilter::for_user(&user_tag);
    let name_prefix = STATE.infra_name(&user_tag);
    let semaphore = Arc::new(Semaphore::new(STATE.region_concurrency));
    let mut tasks = JoinSet::new();

    for region in regions.iter().cloned() {
        let api = api.clone();
        let filter = filter.clone();
        let name_prefix = name_prefix.clone();
        let semaphore = semaphore.clone();
        let delete_network = request.delete_network;
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let result =
                cleanup_region(api.as_ref(), &region, &filter, &name_prefix, delete_network).await;
            (region, result)
        });
    }

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        let (region, result) = joined.map_err(|err| OrchError::Init {
            dbg: format!("cleanup task panicked: {err}"),
        })?;
        match result {
            Ok(()) => {}
            Err(err @ OrchError::Auth { .. }) => return Err(err),
            Err(err) => {
                error!("cleanup failed in {region}: {err}");
                failed += 1;
            }
        }
    }

    if !regions.is_empty() && failed == regions.len() {
        return Err(OrchError::Init {
            dbg: "cleanup failed in every region".to_string(),
        });
    }
    Ok(())
}

pub(crate) async fn cleanup_region(
    api: &dyn CloudApi,
    region: &RegionId,
    filter: &TagFilter,
    name_prefix: &str,
    delete_network: bool,
) -> OrchResult<()> {
    info!("cleanup region {region}");

    let instances = api.list_instances(region).await?;
    let matched: Vec<InstanceRecord> = instances
        .into_iter()
        .filter(|record| filter.matches(&record.tags))
        .collect();

    if !matched.is_empty() {
        debug!("{} instance(s) to delete in {region}", matched.len());
        for record in &matched {
            stop_if_needed(api, region, record).await;
        }

        let ids: Vec<InstanceId> = matched
            .iter()
            .map(|record| record.instance_id.clone())
            .collect();
        for chunk in ids.chunks(100) {
            delete_instances_with_retry(
                api,
                region,
                chunk,
                STATE.delete_retry_count,
                STATE.delete_retry_delay,
            )
            .await?;
        }
        info!("deleted {} instance(s) in {region}", ids.len());
    }

    sweep_security_groups(api, region, name_prefix).await;
    if delete_network {
        sweep_network(api, region, name_prefix).await;
    }

    info!("cleanup region {region} done");
    Ok(())
}

async fn stop_if_needed(api: &dyn CloudApi, region: &RegionId, record: &InstanceRecord) {
    if record.status == InstanceStatus::Stopped {
        return;
    }
    if let Err(err) = api
        .stop_instance(region, &record.instance_id, true, StoppedMode::StopCharging)
        .await
    {
        warn!("failed to stop {} in {region}: {err}", record.instance_id);
        return;
    }

    let id = &record.instance_id;
    let stopped = wait_for(
        region,
        "instance stop",
        STATE.resource_ready_timeout,
        STATE.resource_poll_delay,
        || async move {
            let observed = api.describe_instances(region, std::slice::from_ref(id)).await?;
            // an id the provider already dropped needs no stop
            Ok(observed
                .first()
                .map_or(true, |obs| obs.status == InstanceStatus::Stopped))
        },
    )
    .await;
    if let Err(err) = stopped {
        warn!("instance {} in {region} never stopped: {err}", record.instance_id);
    }
}

// Best-effort: groups can stay in use until their instances are fully
// gone, and a leftover group is harmless.
async fn sweep_security_groups(api: &dyn CloudApi, region: &RegionId, name_prefix: &str) {
    match api.describe_security_groups(region, None).await {
        Ok(groups) => {
            for group in groups.iter().filter(|group| group.name.starts_with(name_prefix)) {
                match api.delete_security_group(region, &group.security_group_id).await {
                    Ok(()) => info!("deleted security group {} in {region}", group.security_group_id),
                    Err(err) => warn!(
                        "failed to delete security group {} in {region}: {err}",
                        group.security_group_id
                    ),
                }
            }
        }
        Err(err) => warn!("failed to list security groups in {region}: {err}"),
    }
}

async fn sweep_network(api: &dyn CloudApi, region: &RegionId, name_prefix: &str) {
    let vpcs = match api.describe_vpcs(region).await {
        Ok(vpcs) => vpcs,
        Err(err) => {
            warn!("failed to list vpcs in {region}: {err}");
            return;
        }
    };

    for vpc in vpcs.iter().filter(|vpc| vpc.name.starts_with(name_prefix)) {
        // subnets must go before their vpc
        if let Ok(subnets) = api.describe_subnets(region, Some(&vpc.vpc_id)).await {
            for subnet in subnets {
                if let Err(err) = api.delete_subnet(region, &subnet.subnet_id).await {
                    warn!("failed to delete subnet {} in {region}: {err}", subnet.subnet_id);
                }
            }
        }
        match api.delete_vpc(region, &vpc.vpc_id).await {
            Ok(()) => info!("deleted vpc {} in {region}", vpc.vpc_id),
            Err(err) => warn!("failed to delete vpc {} in {region}: {err}", vpc.vpc_id),
        }
    }
}

// Alternative mode: delete exactly the instances a previous run recorded.
pub(crate) async fn cleanup_inventory(api: &dyn CloudApi, inventory: &Inventory) -> OrchResult<()> {
    let mut by_region: HashMap<RegionId, Vec<InstanceId>> = HashMap::new();
    for host in &inventory.hosts {
        by_region
            .entry(RegionId::from(host.region.as_str()))
            .or_default()
            .push(InstanceId::from(host.instance_id.as_str()));
    }

    for (region, ids) in by_region {
        info!("deleting {} inventory instance(s) in {region}", ids.len());
        let observed = api.describe_instances(&region, &ids).await?;
        for obs in &observed {
            if obs.status != InstanceStatus::Stopped {
                if let Err(err) = api
                    .stop_instance(&region, &obs.instance_id, true, StoppedMode::StopCharging)
                    .await
                {
                    warn!("failed to stop {} in {region}: {err}", obs.instance_id);
                }
            }
        }
        for chunk in ids.chunks(100) {
            delete_instances_with_retry(
                api,
                &region,
                chunk,
                STATE.delete_retry_count,
                STATE.delete_retry_delay,
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::sim::SimCloud;
    use crate::cloud::{
        ChargingMode, ImageId, RunInstancesRequest, SecurityGroupId, SubnetId, Tag, ZoneId,
    };
    use crate::orchestrator::inventory::HostSpec;

    fn run_request(region: &RegionId, tags: Vec<Tag>, count: usize) -> RunInstancesRequest {
        RunInstancesRequest {
            region: region.clone(),
            zone: ZoneId::from("z1"),
            image_id: ImageId::from("img-1"),
            instance_type: "t1".to_string(),
            subnet_id: SubnetId::from("subnet-1"),
            security_group_id: SecurityGroupId::from("sg-1"),
            key_pair_name: "fleet-key".to_string(),
            name: "cleanup-test".to_string(),
            tags,
            count,
            min_count: count,
            disk_size_gb: 40,
            charging: ChargingMode::OnDemand,
        }
    }

    fn owned_tags(user: &str) -> Vec<Tag> {
        vec![
            Tag::new(STATE.common_tag_key, STATE.common_tag_value),
            Tag::new(STATE.user_tag_key, user),
        ]
    }

    #[tokio::test]
    async fn sweep_deletes_only_matching_tag_pairs() {
        let sim = Arc::new(SimCloud::new());
        let api: Arc<dyn CloudApi> = sim.clone();
        let region = RegionId::from("r1");
        sim.add_region(&region, &["z1"]);

        api.run_instances(&run_request(&region, owned_tags("alice"), 2))
            .await
            .unwrap();
        api.run_instances(&run_request(&region, owned_tags("bob"), 1))
            .await
            .unwrap();
        // common tag alone must not match
        api.run_instances(&run_request(
            &region,
            vec![Tag::new(STATE.common_tag_key, STATE.common_tag_value)],
            1,
        ))
        .await
        .unwrap();

        cleanup_region(
            api.as_ref(),
            &region,
            &TagFilter::for_user("alice"),
            "testnet-fleet-alice",
            false,
        )
        .await
        .unwrap();

        // bob's instance and the untagged one survive
        assert_eq!(sim.instance_count(&region), 2);
        let remaining = api.list_instances(&region).await.unwrap();
        assert!(remaining
            .iter()
            .all(|record| record.tags.get(STATE.user_tag_key) != Some(&"alice".to_string())));
    }

    #[tokio::test]
    async fn delete_retries_through_initializing() {
        let sim = Arc::new(SimCloud::new());
        let api: Arc<dyn CloudApi> = sim.clone();
        let region = RegionId::from("r1");
        sim.add_region(&region, &["z1"]);
        sim.fail_deletes_with_initializing(1);

        api.run_instances(&run_request(&region, owned_tags("alice"), 1))
            .await
            .unwrap();

        cleanup_region(
            api.as_ref(),
            &region,
            &TagFilter::for_user("alice"),
            "testnet-fleet-alice",
            false,
        )
        .await
        .unwrap();
        assert_eq!(sim.instance_count(&region), 0);
    }

    #[tokio::test]
    async fn network_sweep_removes_prefixed_resources() {
        let sim = Arc::new(SimCloud::new());
        let api: Arc<dyn CloudApi> = sim.clone();
        let region = RegionId::from("r1");
        sim.add_region(&region, &["z1"]);
        let vpc = sim.seed_vpc(&region, "testnet-fleet-alice", "10.0.0.0/16");
        sim.seed_subnet(&region, &vpc, "testnet-fleet-alice", "z1", "10.0.0.0/24");
        let other_vpc = sim.seed_vpc(&region, "unrelated", "10.1.0.0/16");
        sim.seed_security_group(&region, &vpc, "testnet-fleet-alice");
        sim.seed_security_group(&region, &other_vpc, "unrelated");

        cleanup_region(
            api.as_ref(),
            &region,
            &TagFilter::for_user("alice"),
            "testnet-fleet-alice",
            true,
        )
        .await
        .unwrap();

        let vpcs = api.describe_vpcs(&region).await.unwrap();
        assert_eq!(vpcs.len(), 1);
        assert_eq!(vpcs[0].name, "unrelated");
        let groups = api.describe_security_groups(&region, None).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "unrelated");
    }

    #[tokio::test]
    async fn inventory_mode_deletes_exactly_the_recorded_ids() {
        let sim = Arc::new(SimCloud::new());
        let api: Arc<dyn CloudApi> = sim.clone();
        let region = RegionId::from("r1");
        sim.add_region(&region, &["z1"]);

        let recorded = api
            .run_instances(&run_request(&region, owned_tags("alice"), 2))
            .await
            .unwrap();
        let survivor = api
            .run_instances(&run_request(&region, owned_tags("alice"), 1))
            .await
            .unwrap();

        let inventory = Inventory::new(
            recorded
                .iter()
                .map(|id| HostSpec {
                    ip: "10.0.0.1".to_string(),
                    nodes_per_host: 1,
                    ssh_user: "root".to_string(),
                    ssh_key_path: None,
                    provider: "aws".to_string(),
                    region: region.to_string(),
                    instance_id: id.to_string(),
                })
                .collect(),
        );

        cleanup_inventory(api.as_ref(), &inventory).await.unwrap();

        let remaining = api.list_instances(&region).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].instance_id, survivor[0]);
    }
}
