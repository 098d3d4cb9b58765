// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scripted in-memory provider for tests. Stock can be limited per
//! (zone, type), instances can be made to disappear, and deletes can be
//! made to fail as still-initializing, so every planner and reconciler
//! path is reachable without a real account.

use crate::cloud::{
    api::{CloudApi, CloudError, CloudResult},
    types::{
        ImageId, ImageRecord, ImageStatus, IngressRule, InstanceId, InstanceObservation,
        InstanceRecord, InstanceStatus, KeyPairRecord, RegionId, RunInstancesRequest,
        SecurityGroupId, SecurityGroupRecord, StoppedMode, SubnetId, SubnetRecord, Tag, VpcId,
        VpcRecord, ZoneId,
    },
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, Ipv4Addr},
    sync::Mutex,
};

#[derive(Clone, Debug)]
pub struct RunCall {
    pub zone: String,
    pub instance_type: String,
    pub count: usize,
    pub min_count: usize,
}

#[derive(Default)]
struct SimState {
    regions: BTreeMap<String, SimRegion>,
    next_id: u64,
    created_instances: usize,
    vanish_nth: Option<usize>,
    create_calls: usize,
    run_calls: Vec<RunCall>,
    initializing_failures: usize,
}

#[derive(Default)]
struct SimRegion {
    zones: Vec<String>,
    vpcs: Vec<SimVpc>,
    subnets: Vec<SimSubnet>,
    security_groups: Vec<SimSecurityGroup>,
    key_pairs: HashMap<String, String>,
    images: Vec<SimImage>,
    instances: BTreeMap<String, SimInstance>,
    // (zone, type) -> remaining grantable instances; absent = unlimited
    stock: HashMap<(String, String), usize>,
}

struct SimVpc {
    id: String,
    name: String,
    cidr: String,
}

struct SimSubnet {
    id: String,
    vpc: String,
    name: String,
    zone: String,
    cidr: String,
}

struct SimSecurityGroup {
    id: String,
    vpc: String,
    name: String,
    rules: Vec<IngressRule>,
}

struct SimImage {
    id: String,
    name: String,
    status: ImageStatus,
}

struct SimInstance {
    id: String,
    name: String,
    tags: HashMap<String, String>,
    status: InstanceStatus,
    public_ip: Option<IpAddr>,
    vanish: bool,
}

pub struct SimCloud {
    state: Mutex<SimState>,
}

impl Default for SimCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCloud {
    pub fn new() -> Self {
        SimCloud {
            state: Mutex::new(SimState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state poisoned")
    }

    fn next_id(state: &mut SimState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{:04}", prefix, state.next_id)
    }

    pub fn add_region(&self, region: &RegionId, zones: &[&str]) {
        let mut state = self.lock();
        state.regions.insert(
            region.to_string(),
            SimRegion {
                zones: zones.iter().map(|z| z.to_string()).collect(),
                ..SimRegion::default()
            },
        );
    }

    pub fn set_stock(&self, region: &RegionId, zone: &str, instance_type: &str, amount: usize) {
        let mut state = self.lock();
        if let Some(region) = state.regions.get_mut(region.as_str()) {
            region
                .stock
                .insert((zone.to_string(), instance_type.to_string()), amount);
        }
    }

    pub fn seed_vpc(&self, region: &RegionId, name: &str, cidr: &str) -> VpcId {
        let mut state = self.lock();
        let id = Self::next_id(&mut state, "vpc");
        let region = state.regions.get_mut(region.as_str()).expect("unknown region");
        region.vpcs.push(SimVpc {
            id: id.clone(),
            name: name.to_string(),
            cidr: cidr.to_string(),
        });
        VpcId::from(id.as_str())
    }

    pub fn seed_subnet(
        &self,
        region: &RegionId,
        vpc: &VpcId,
        name: &str,
        zone: &str,
        cidr: &str,
    ) -> SubnetId {
        let mut state = self.lock();
        let id = Self::next_id(&mut state, "subnet");
        let region = state.regions.get_mut(region.as_str()).expect("unknown region");
        region.subnets.push(SimSubnet {
            id: id.clone(),
            vpc: vpc.to_string(),
            name: name.to_string(),
            zone: zone.to_string(),
            cidr: cidr.to_string(),
        });
        SubnetId::from(id.as_str())
    }

    pub fn seed_security_group(
        &self,
        region: &RegionId,
        vpc: &VpcId,
        name: &str,
    ) -> SecurityGroupId {
        let mut state = self.lock();
        let id = Self::next_id(&mut state, "sg");
        let region = state.regions.get_mut(region.as_str()).expect("unknown region");
        region.security_groups.push(SimSecurityGroup {
            id: id.clone(),
            vpc: vpc.to_string(),
            name: name.to_string(),
            rules: Vec::new(),
        });
        SecurityGroupId::from(id.as_str())
    }

    pub fn seed_key_pair(&self, region: &RegionId, name: &str, fingerprint: &str) {
        let mut state = self.lock();
        let region = state.regions.get_mut(region.as_str()).expect("unknown region");
        region
            .key_pairs
            .insert(name.to_string(), fingerprint.to_string());
    }

    pub fn seed_image(&self, region: &RegionId, name: &str, status: ImageStatus) -> ImageId {
        let mut state = self.lock();
        let id = Self::next_id(&mut state, "img");
        let region = state.regions.get_mut(region.as_str()).expect("unknown region");
        region.images.push(SimImage {
            id: id.clone(),
            name: name.to_string(),
            status,
        });
        ImageId::from(id.as_str())
    }

    // The instance disappears from the next describe, as if the provider
    // reclaimed it.
    pub fn vanish_instance(&self, region: &RegionId, id: &InstanceId) {
        let mut state = self.lock();
        if let Some(region) = state.regions.get_mut(region.as_str()) {
            if let Some(instance) = region.instances.get_mut(id.as_str()) {
                instance.vanish = true;
            }
        }
    }

    // The nth instance ever created (0-based) vanishes on first describe.
    pub fn vanish_nth_instance(&self, nth: usize) {
        self.lock().vanish_nth = Some(nth);
    }

    pub fn fail_deletes_with_initializing(&self, failures: usize) {
        self.lock().initializing_failures = failures;
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn run_calls(&self) -> Vec<RunCall> {
        self.lock().run_calls.clone()
    }

    pub fn instance_count(&self, region: &RegionId) -> usize {
        self.lock()
            .regions
            .get(region.as_str())
            .map(|region| region.instances.len())
            .unwrap_or(0)
    }
}

fn unknown_region(region: &RegionId) -> CloudError {
    CloudError::Api {
        code: None,
        dbg: format!("unknown region {region}"),
    }
}

fn region_of<'a>(state: &'a mut SimState, region: &RegionId) -> CloudResult<&'a mut SimRegion> {
    state
        .regions
        .get_mut(region.as_str())
        .ok_or_else(|| unknown_region(region))
}

fn public_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[async_trait]
impl CloudApi for SimCloud {
    async fn describe_regions(&self) -> CloudResult<Vec<RegionId>> {
        Ok(self
            .lock()
            .regions
            .keys()
            .map(|name| RegionId::from(name.as_str()))
            .collect())
    }

    async fn describe_zones(&self, region: &RegionId) -> CloudResult<Vec<ZoneId>> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        Ok(region.zones.iter().map(|z| ZoneId::from(z.as_str())).collect())
    }

    async fn describe_vpcs(&self, region: &RegionId) -> CloudResult<Vec<VpcRecord>> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        Ok(region
            .vpcs
            .iter()
            .map(|vpc| VpcRecord {
                vpc_id: VpcId::from(vpc.id.as_str()),
                name: vpc.name.clone(),
                cidr_block: vpc.cidr.clone(),
                available: true,
            })
            .collect())
    }

    async fn create_vpc(
        &self,
        region: &RegionId,
        name: &str,
        cidr_block: &str,
        _tags: &[Tag],
    ) -> CloudResult<VpcId> {
        let mut state = self.lock();
        state.create_calls += 1;
        let id = Self::next_id(&mut state, "vpc");
        let region = region_of(&mut state, region)?;
        region.vpcs.push(SimVpc {
            id: id.clone(),
            name: name.to_string(),
            cidr: cidr_block.to_string(),
        });
        Ok(VpcId::from(id.as_str()))
    }

    async fn describe_subnets(
        &self,
        region: &RegionId,
        vpc_id: Option<&VpcId>,
    ) -> CloudResult<Vec<SubnetRecord>> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        Ok(region
            .subnets
            .iter()
            .filter(|subnet| vpc_id.map_or(true, |vpc| subnet.vpc == vpc.as_str()))
            .map(|subnet| SubnetRecord {
                subnet_id: SubnetId::from(subnet.id.as_str()),
                name: subnet.name.clone(),
                zone_id: ZoneId::from(subnet.zone.as_str()),
                cidr_block: subnet.cidr.clone(),
                available: true,
            })
            .collect())
    }

    async fn create_subnet(
        &self,
        region: &RegionId,
        vpc_id: &VpcId,
        zone_id: &ZoneId,
        name: &str,
        cidr_block: &str,
        _tags: &[Tag],
    ) -> CloudResult<SubnetId> {
        let mut state = self.lock();
        state.create_calls += 1;
        let id = Self::next_id(&mut state, "subnet");
        let region = region_of(&mut state, region)?;
        region.subnets.push(SimSubnet {
            id: id.clone(),
            vpc: vpc_id.to_string(),
            name: name.to_string(),
            zone: zone_id.to_string(),
            cidr: cidr_block.to_string(),
        });
        Ok(SubnetId::from(id.as_str()))
    }

    async fn describe_security_groups(
        &self,
        region: &RegionId,
        vpc_id: Option<&VpcId>,
    ) -> CloudResult<Vec<SecurityGroupRecord>> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        Ok(region
            .security_groups
            .iter()
            .filter(|group| vpc_id.map_or(true, |vpc| group.vpc == vpc.as_str()))
            .map(|group| SecurityGroupRecord {
                security_group_id: SecurityGroupId::from(group.id.as_str()),
                name: group.name.clone(),
            })
            .collect())
    }

    async fn create_security_group(
        &self,
        region: &RegionId,
        vpc_id: &VpcId,
        name: &str,
        _tags: &[Tag],
    ) -> CloudResult<SecurityGroupId> {
        let mut state = self.lock();
        state.create_calls += 1;
        let id = Self::next_id(&mut state, "sg");
        let region = region_of(&mut state, region)?;
        region.security_groups.push(SimSecurityGroup {
            id: id.clone(),
            vpc: vpc_id.to_string(),
            name: name.to_string(),
            rules: Vec::new(),
        });
        Ok(SecurityGroupId::from(id.as_str()))
    }

    async fn describe_ingress_rules(
        &self,
        region: &RegionId,
        security_group_id: &SecurityGroupId,
    ) -> CloudResult<Vec<IngressRule>> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        let group = region
            .security_groups
            .iter()
            .find(|group| group.id == security_group_id.as_str())
            .ok_or(CloudError::Api {
                code: None,
                dbg: format!("unknown security group {security_group_id}"),
            })?;
        Ok(group.rules.clone())
    }

    async fn authorize_ingress(
        &self,
        region: &RegionId,
        security_group_id: &SecurityGroupId,
        rule: &IngressRule,
    ) -> CloudResult<()> {
        let mut state = self.lock();
        state.create_calls += 1;
        let region = region_of(&mut state, region)?;
        let group = region
            .security_groups
            .iter_mut()
            .find(|group| group.id == security_group_id.as_str())
            .ok_or(CloudError::Api {
                code: None,
                dbg: format!("unknown security group {security_group_id}"),
            })?;
        group.rules.push(rule.clone());
        Ok(())
    }

    async fn describe_key_pair(
        &self,
        region: &RegionId,
        name: &str,
    ) -> CloudResult<Option<KeyPairRecord>> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        Ok(region.key_pairs.get(name).map(|fingerprint| KeyPairRecord {
            name: name.to_string(),
            fingerprint: fingerprint.clone(),
        }))
    }

    async fn import_key_pair(
        &self,
        region: &RegionId,
        name: &str,
        public_key_openssh: &str,
        _tags: &[Tag],
    ) -> CloudResult<()> {
        // fingerprint exactly the way a provider would: md5 over the
        // decoded key blob
        let blob = public_key_openssh
            .split_whitespace()
            .nth(1)
            .and_then(|body| STANDARD.decode(body).ok())
            .ok_or(CloudError::Api {
                code: None,
                dbg: "malformed public key".to_string(),
            })?;
        let fingerprint = format!("{:x}", md5::compute(blob));

        let mut state = self.lock();
        state.create_calls += 1;
        let region = region_of(&mut state, region)?;
        region.key_pairs.insert(name.to_string(), fingerprint);
        Ok(())
    }

    async fn describe_images(
        &self,
        region: &RegionId,
        name: &str,
    ) -> CloudResult<Vec<ImageRecord>> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        let mut records = Vec::new();
        for image in region.images.iter_mut().filter(|image| image.name == name) {
            // freshly created or copied images become available once a
            // poll observes them
            if image.status == ImageStatus::Pending {
                image.status = ImageStatus::Available;
                records.push(ImageRecord {
                    image_id: ImageId::from(image.id.as_str()),
                    name: image.name.clone(),
                    status: ImageStatus::Pending,
                });
                continue;
            }
            records.push(ImageRecord {
                image_id: ImageId::from(image.id.as_str()),
                name: image.name.clone(),
                status: image.status.clone(),
            });
        }
        Ok(records)
    }

    async fn create_image(
        &self,
        region: &RegionId,
        _instance_id: &InstanceId,
        name: &str,
        _tags: &[Tag],
    ) -> CloudResult<ImageId> {
        let mut state = self.lock();
        state.create_calls += 1;
        let id = Self::next_id(&mut state, "img");
        let region = region_of(&mut state, region)?;
        region.images.push(SimImage {
            id: id.clone(),
            name: name.to_string(),
            status: ImageStatus::Pending,
        });
        Ok(ImageId::from(id.as_str()))
    }

    async fn copy_image(
        &self,
        source_region: &RegionId,
        source_image_id: &ImageId,
        dest_region: &RegionId,
        name: &str,
    ) -> CloudResult<ImageId> {
        let mut state = self.lock();
        state.create_calls += 1;

        let source = region_of(&mut state, source_region)?;
        let exists = source
            .images
            .iter()
            .any(|image| image.id == source_image_id.as_str());
        if !exists {
            return Err(CloudError::Api {
                code: None,
                dbg: format!("no image {source_image_id} in {source_region}"),
            });
        }

        let id = Self::next_id(&mut state, "img");
        let dest = region_of(&mut state, dest_region)?;
        dest.images.push(SimImage {
            id: id.clone(),
            name: name.to_string(),
            status: ImageStatus::Pending,
        });
        Ok(ImageId::from(id.as_str()))
    }

    async fn run_instances(&self, request: &RunInstancesRequest) -> CloudResult<Vec<InstanceId>> {
        let mut state = self.lock();
        state.run_calls.push(RunCall {
            zone: request.zone.to_string(),
            instance_type: request.instance_type.clone(),
            count: request.count,
            min_count: request.min_count,
        });

        let key = (request.zone.to_string(), request.instance_type.clone());
        let remaining = {
            let region = region_of(&mut state, &request.region)?;
            region.stock.get(&key).copied()
        };

        let granted = match remaining {
            Some(remaining) if remaining < request.min_count => {
                return Err(CloudError::NoStock {
                    dbg: format!(
                        "{}/{} has no stock of {}",
                        request.region, request.zone, request.instance_type
                    ),
                });
            }
            Some(remaining) => remaining.min(request.count),
            None => request.count,
        };

        let mut ids = Vec::with_capacity(granted);
        for _ in 0..granted {
            let id = Self::next_id(&mut state, "i");
            let vanish = state.vanish_nth == Some(state.created_instances);
            state.created_instances += 1;

            let tags = request
                .tags
                .iter()
                .map(|tag| (tag.key.clone(), tag.value.clone()))
                .collect();
            let name = request.name.clone();
            let region = region_of(&mut state, &request.region)?;
            region.instances.insert(
                id.clone(),
                SimInstance {
                    id: id.clone(),
                    name,
                    tags,
                    status: InstanceStatus::Pending,
                    public_ip: None,
                    vanish,
                },
            );
            ids.push(InstanceId::from(id.as_str()));
        }

        if let Some(remaining) = remaining {
            let region = region_of(&mut state, &request.region)?;
            region.stock.insert(key, remaining - granted);
        }
        Ok(ids)
    }

    async fn describe_instances(
        &self,
        region: &RegionId,
        ids: &[InstanceId],
    ) -> CloudResult<Vec<InstanceObservation>> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        let mut observations = Vec::new();

        for id in ids {
            let Some(instance) = region.instances.get_mut(id.as_str()) else {
                continue;
            };
            if instance.vanish {
                region.instances.remove(id.as_str());
                continue;
            }
            // boot completes on observation
            if instance.status == InstanceStatus::Pending {
                instance.status = InstanceStatus::Running;
                instance.public_ip = Some(public_ip());
            }
            observations.push(InstanceObservation {
                instance_id: id.clone(),
                status: instance.status,
                public_ip: instance.public_ip,
            });
        }
        Ok(observations)
    }

    async fn list_instances(&self, region: &RegionId) -> CloudResult<Vec<InstanceRecord>> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        Ok(region
            .instances
            .values()
            .map(|instance| InstanceRecord {
                instance_id: InstanceId::from(instance.id.as_str()),
                name: instance.name.clone(),
                status: instance.status,
                tags: instance.tags.clone(),
            })
            .collect())
    }

    async fn allocate_public_ip(
        &self,
        region: &RegionId,
        instance_id: &InstanceId,
    ) -> CloudResult<IpAddr> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        let instance = region
            .instances
            .get_mut(instance_id.as_str())
            .ok_or(CloudError::Api {
                code: None,
                dbg: format!("unknown instance {instance_id}"),
            })?;
        let ip = public_ip();
        instance.public_ip = Some(ip);
        Ok(ip)
    }

    async fn start_instance(&self, region: &RegionId, instance_id: &InstanceId) -> CloudResult<()> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        if let Some(instance) = region.instances.get_mut(instance_id.as_str()) {
            instance.status = InstanceStatus::Running;
        }
        Ok(())
    }

    async fn stop_instance(
        &self,
        region: &RegionId,
        instance_id: &InstanceId,
        _force: bool,
        _mode: StoppedMode,
    ) -> CloudResult<()> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        if let Some(instance) = region.instances.get_mut(instance_id.as_str()) {
            instance.status = InstanceStatus::Stopped;
        }
        Ok(())
    }

    async fn delete_instances(&self, region: &RegionId, ids: &[InstanceId]) -> CloudResult<()> {
        let mut state = self.lock();
        if state.initializing_failures > 0 {
            state.initializing_failures -= 1;
            return Err(CloudError::Initializing {
                dbg: "instances still initializing".to_string(),
            });
        }
        let region = region_of(&mut state, region)?;
        for id in ids {
            region.instances.remove(id.as_str());
        }
        Ok(())
    }

    async fn delete_security_group(
        &self,
        region: &RegionId,
        security_group_id: &SecurityGroupId,
    ) -> CloudResult<()> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        region
            .security_groups
            .retain(|group| group.id != security_group_id.as_str());
        Ok(())
    }

    async fn delete_subnet(&self, region: &RegionId, subnet_id: &SubnetId) -> CloudResult<()> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        region.subnets.retain(|subnet| subnet.id != subnet_id.as_str());
        Ok(())
    }

    async fn delete_vpc(&self, region: &RegionId, vpc_id: &VpcId) -> CloudResult<()> {
        let mut state = self.lock();
        let region = region_of(&mut state, region)?;
        region.vpcs.retain(|vpc| vpc.id != vpc_id.as_str());
        Ok(())
    }
}
