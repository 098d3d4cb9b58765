// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    cloud::{
        retry_mutating, CloudApi, CloudError, ImageId, IngressRule, RegionId, SecurityGroupId,
        SubnetId, Tag, VpcId, ZoneId,
    },
    orchestrator::{cli::ProviderConfig, OrchError, OrchResult, STATE},
};
use std::{collections::HashMap, future::Future, path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info};

pub mod cidr;
pub mod image;
pub mod key_pair;

use image::{BuilderContext, ImageBuildConfig};
use key_pair::LocalKeyPair;

// Poll a lookup until it reports the resource usable. Timeouts are fatal
// for the region and reported upward.
pub(crate) async fn wait_for<F, Fut>(
    region: &RegionId,
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> OrchResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchResult<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(OrchError::Infra {
                region: region.to_string(),
                dbg: format!("timed out waiting for {what}"),
            });
        }
        tokio::time::sleep(interval).await;
    }
}

#[derive(Clone, Debug)]
pub struct ZoneInfo {
    pub zone_id: ZoneId,
    pub subnet_id: SubnetId,
}

// Everything the launch planner needs to place instances in one region.
// Zones keep their request order; the planner tries them in sequence.
#[derive(Clone, Debug)]
pub struct RegionInfo {
    pub region_id: RegionId,
    pub image_id: ImageId,
    pub vpc_id: VpcId,
    pub security_group_id: SecurityGroupId,
    pub key_pair_name: String,
    pub ssh_key_path: PathBuf,
    pub zones: Vec<ZoneInfo>,
}

#[derive(Clone, Debug)]
pub struct RegionSelection {
    pub region_id: RegionId,
    // empty means every zone the region exposes
    pub zones: Vec<ZoneId>,
}

// Desired state for the supporting resources of every requested region.
// All operations are lookup-by-name with create-if-missing gated behind
// allow_create; running it twice resolves to the same resource ids.
#[derive(Clone)]
pub struct InfraRequest {
    pub regions: Vec<RegionSelection>,
    pub vpc_name: String,
    pub subnet_name: String,
    pub security_group_name: String,
    pub image_name: String,
    pub key_pair: LocalKeyPair,
    pub ingress_rules: Vec<IngressRule>,
    pub allow_create: bool,
    pub tags: Vec<Tag>,
    pub image_build: Option<ImageBuildConfig>,
}

impl InfraRequest {
    pub fn from_config(config: &ProviderConfig, allow_create: bool) -> OrchResult<Self> {
        let infra_name = STATE.infra_name(&config.user_tag);
        let key_pair = LocalKeyPair::load(&infra_name, &config.ssh_key_path)?;

        let (workload_from, workload_to) = STATE.workload_port_range;
        let image_build = config.image_build.as_ref().map(|section| ImageBuildConfig {
            base_image_id: section.base_image_id.clone().map(ImageId::from),
            builder_instance_type: section
                .builder_instance_type
                .clone()
                .unwrap_or_else(|| STATE.default_builder_instance_type.to_string()),
            provision_script: section.provision_script.clone(),
            ssh_user: config.ssh_user(),
            ssh_key_path: config.ssh_key_path.clone(),
            use_spot: config.use_spot,
        });

        Ok(InfraRequest {
            regions: config
                .regions
                .iter()
                .map(|region| RegionSelection {
                    region_id: RegionId::from(region.name.as_str()),
                    zones: region.zones.iter().map(|z| ZoneId::from(z.as_str())).collect(),
                })
                .collect(),
            vpc_name: infra_name.clone(),
            subnet_name: infra_name.clone(),
            security_group_name: infra_name,
            image_name: config.image_name.clone(),
            key_pair,
            ingress_rules: vec![
                IngressRule::tcp(STATE.ssh_port, STATE.ssh_port),
                IngressRule::tcp(workload_from, workload_to),
            ],
            allow_create,
            tags: vec![
                Tag::new(STATE.common_tag_key, STATE.common_tag_value),
                Tag::new(STATE.user_tag_key, &config.user_tag),
            ],
            image_build,
        })
    }

    // Reconcile every requested region with bounded concurrency. A failed
    // region is logged and dropped; peers continue. Auth failures abort
    // the provider.
    pub async fn ensure_regions(
        self: Arc<Self>,
        api: &Arc<dyn CloudApi>,
    ) -> OrchResult<HashMap<RegionId, RegionInfo>> {
        let semaphore = Arc::new(Semaphore::new(STATE.infra_concurrency));
        let mut tasks = JoinSet::new();

        for selection in self.regions.clone() {
            let request = self.clone();
            let api = api.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let region_id = selection.region_id.clone();
                (region_id, request.ensure_region(&api, selection).await)
            });
        }

        let mut regions = HashMap::new();
        let mut first_failure = None;
        while let Some(joined) = tasks.join_next().await {
            let (region_id, result) = joined.map_err(|err| OrchError::Init {
                dbg: format!("infra task panicked: {err}"),
            })?;
            match result {
                Ok(info) => {
                    regions.insert(region_id, info);
                }
                Err(err @ OrchError::Auth { .. }) => return Err(err),
                Err(err) => {
                    error!("infra reconciliation failed in {region_id}: {err}");
                    first_failure.get_or_insert(err);
                }
            }
        }

        if regions.is_empty() {
            if let Some(err) = first_failure {
                return Err(err);
            }
        }
        Ok(regions)
    }

    async fn ensure_region(
        &self,
        api: &Arc<dyn CloudApi>,
        selection: RegionSelection,
    ) -> OrchResult<RegionInfo> {
        let region = &selection.region_id;
        info!("reconciling infra in {region}");

        let all_zones = api.describe_zones(region).await?;
        let zone_ids = if selection.zones.is_empty() {
            all_zones
        } else {
            for zone in &selection.zones {
                if !all_zones.contains(zone) {
                    return Err(OrchError::Infra {
                        region: region.to_string(),
                        dbg: format!("requested zone {zone} does not exist"),
                    });
                }
            }
            selection.zones
        };

        let (vpc_id, vpc_cidr) = self.ensure_vpc(api.as_ref(), region).await?;
        let security_group_id = self
            .ensure_security_group(api.as_ref(), region, &vpc_id)
            .await?;
        key_pair::ensure_key_pair(
            api.as_ref(),
            region,
            &self.key_pair,
            self.allow_create,
            &self.tags,
        )
        .await?;
        let zones = self
            .ensure_subnets(api.as_ref(), region, &vpc_id, &vpc_cidr, &zone_ids)
            .await?;

        let builder_zone = zones.first().ok_or(OrchError::Infra {
            region: region.to_string(),
            dbg: "region exposes no zones".to_string(),
        })?;
        let user_tag = self
            .tags
            .iter()
            .find(|tag| tag.key == STATE.user_tag_key)
            .map(|tag| tag.value.as_str())
            .unwrap_or_default();
        let image_id = image::ensure_image(
            api,
            region,
            &self.image_name,
            &self.regions.iter().map(|s| s.region_id.clone()).collect::<Vec<_>>(),
            self.allow_create,
            self.image_build.as_ref(),
            &BuilderContext {
                zone_id: &builder_zone.zone_id,
                subnet_id: &builder_zone.subnet_id,
                security_group_id: &security_group_id,
                key_pair_name: &self.key_pair.name,
                user_tag,
            },
            &self.tags,
        )
        .await?;

        info!("infra ready in {region}");
        Ok(RegionInfo {
            region_id: region.clone(),
            image_id,
            vpc_id,
            security_group_id,
            key_pair_name: self.key_pair.name.clone(),
            ssh_key_path: self.key_pair.path.clone(),
            zones,
        })
    }

    async fn ensure_vpc(
        &self,
        api: &dyn CloudApi,
        region: &RegionId,
    ) -> OrchResult<(VpcId, String)> {
        let vpcs = api.describe_vpcs(region).await?;
        if let Some(vpc) = vpcs.iter().find(|vpc| vpc.name == self.vpc_name) {
            info!("vpc {} found in {}: {}", self.vpc_name, region, vpc.vpc_id);
            let vpc_id = vpc.vpc_id.clone();
            if !vpc.available {
                self.wait_vpc_available(api, region, &vpc_id).await?;
            }
            return Ok((vpc_id, vpc.cidr_block.clone()));
        }

        if !self.allow_create {
            return Err(OrchError::Infra {
                region: region.to_string(),
                dbg: format!("vpc {} not found and infra creation is disabled", self.vpc_name),
            });
        }

        info!("creating vpc {} in {}", self.vpc_name, region);
        let vpc_id = retry_mutating("create_vpc", || {
            api.create_vpc(region, &self.vpc_name, STATE.vpc_cidr, &self.tags)
        })
        .await?;
        self.wait_vpc_available(api, region, &vpc_id).await?;
        Ok((vpc_id, STATE.vpc_cidr.to_string()))
    }

    async fn wait_vpc_available(
        &self,
        api: &dyn CloudApi,
        region: &RegionId,
        vpc_id: &VpcId,
    ) -> OrchResult<()> {
        wait_for(
            region,
            "vpc",
            STATE.resource_ready_timeout,
            STATE.resource_poll_delay,
            || async move {
                let vpcs = api.describe_vpcs(region).await?;
                Ok(vpcs
                    .iter()
                    .any(|vpc| &vpc.vpc_id == vpc_id && vpc.available))
            },
        )
        .await
    }

    async fn ensure_security_group(
        &self,
        api: &dyn CloudApi,
        region: &RegionId,
        vpc_id: &VpcId,
    ) -> OrchResult<SecurityGroupId> {
        let groups = api.describe_security_groups(region, Some(vpc_id)).await?;
        let security_group_id = match groups
            .iter()
            .find(|group| group.name == self.security_group_name)
        {
            Some(group) => {
                info!(
                    "security group {} found in {}: {}",
                    self.security_group_name, region, group.security_group_id
                );
                group.security_group_id.clone()
            }
            None if self.allow_create => {
                info!("creating security group {} in {}", self.security_group_name, region);
                retry_mutating("create_security_group", || {
                    api.create_security_group(region, vpc_id, &self.security_group_name, &self.tags)
                })
                .await?
            }
            None => {
                return Err(OrchError::Infra {
                    region: region.to_string(),
                    dbg: format!(
                        "security group {} not found and infra creation is disabled",
                        self.security_group_name
                    ),
                })
            }
        };

        // authorize is check-before-add so reruns add nothing
        let existing = api.describe_ingress_rules(region, &security_group_id).await?;
        for rule in &self.ingress_rules {
            if existing.contains(rule) {
                continue;
            }
            match api.authorize_ingress(region, &security_group_id, rule).await {
                Ok(()) => {}
                Err(CloudError::Api { code: Some(code), .. })
                    if code == "InvalidPermission.Duplicate" => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(security_group_id)
    }

    async fn ensure_subnets(
        &self,
        api: &dyn CloudApi,
        region: &RegionId,
        vpc_id: &VpcId,
        vpc_cidr: &str,
        zone_ids: &[ZoneId],
    ) -> OrchResult<Vec<ZoneInfo>> {
        let vpc_net = cidr::parse_block(vpc_cidr).ok_or(OrchError::Infra {
            region: region.to_string(),
            dbg: format!("vpc {vpc_id} has unparsable cidr {vpc_cidr}"),
        })?;

        let existing = api.describe_subnets(region, Some(vpc_id)).await?;
        let mut occupied: Vec<_> = existing
            .iter()
            .filter_map(|subnet| cidr::parse_block(&subnet.cidr_block))
            .collect();

        let mut zones = Vec::with_capacity(zone_ids.len());
        for zone_id in zone_ids {
            if let Some(subnet) = existing
                .iter()
                .find(|subnet| subnet.name == self.subnet_name && &subnet.zone_id == zone_id)
            {
                if !subnet.available {
                    return Err(OrchError::Infra {
                        region: region.to_string(),
                        dbg: format!("subnet {} in {} is not available", subnet.subnet_id, zone_id),
                    });
                }
                info!(
                    "subnet {} found in {}/{}: {}",
                    self.subnet_name, region, zone_id, subnet.subnet_id
                );
                zones.push(ZoneInfo {
                    zone_id: zone_id.clone(),
                    subnet_id: subnet.subnet_id.clone(),
                });
                continue;
            }

            if !self.allow_create {
                return Err(OrchError::Infra {
                    region: region.to_string(),
                    dbg: format!(
                        "subnet {} not found in zone {} and infra creation is disabled",
                        self.subnet_name, zone_id
                    ),
                });
            }

            let block = cidr::allocate_vacant_block(&occupied, vpc_net, STATE.subnet_prefix)
                .ok_or(OrchError::Infra {
                    region: region.to_string(),
                    dbg: format!("no vacant /{} block left in {}", STATE.subnet_prefix, vpc_cidr),
                })?;
            occupied.push(block);

            info!(
                "creating subnet {} in {}/{} with cidr {}",
                self.subnet_name, region, zone_id, block
            );
            let cidr_block = block.to_string();
            let subnet_id = retry_mutating("create_subnet", || {
                api.create_subnet(region, vpc_id, zone_id, &self.subnet_name, &cidr_block, &self.tags)
            })
            .await?;

            let wait_id = subnet_id.clone();
            wait_for(
                region,
                "subnet",
                STATE.resource_ready_timeout,
                STATE.resource_poll_delay,
                || {
                    let wait_id = wait_id.clone();
                    async move {
                        let subnets = api.describe_subnets(region, Some(vpc_id)).await?;
                        Ok(subnets
                            .iter()
                            .any(|subnet| subnet.subnet_id == wait_id && subnet.available))
                    }
                },
            )
            .await?;

            zones.push(ZoneInfo {
                zone_id: zone_id.clone(),
                subnet_id,
            });
        }
        Ok(zones)
    }
}
