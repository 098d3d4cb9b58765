// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::cloud::{
    api::{CloudApi, CloudError, CloudResult},
    types::{
        ChargingMode, ImageId, ImageRecord, ImageStatus, IngressRule, InstanceId,
        InstanceObservation, InstanceRecord, InstanceStatus, KeyPairRecord, RegionId,
        RunInstancesRequest, SecurityGroupId, SecurityGroupRecord, StoppedMode, SubnetId,
        SubnetRecord, Tag, VpcId, VpcRecord, ZoneId,
    },
};
use async_trait::async_trait;
use aws_sdk_ec2::{
    error::SdkError,
    primitives::Blob,
    types::{
        BlockDeviceMapping, DomainType, EbsBlockDevice, Filter, ImageState,
        InstanceMarketOptionsRequest, InstanceNetworkInterfaceSpecification, InstanceStateName,
        InstanceType, IpPermission, IpRange, MarketType, Placement, ResourceType,
        TagSpecification,
    },
};
use aws_types::region::Region;
use std::{collections::HashMap, net::IpAddr, str::FromStr};
use tracing::debug;

// Translate any SdkError into the port error taxonomy, reading the service
// error code when one is present.
macro_rules! map_sdk_err {
    ($op:expr) => {
        |err| match err {
            SdkError::ServiceError(service_err) => CloudError::from_code(
                service_err.err().meta().code(),
                format!("{}: {}", $op, service_err.err()),
            ),
            err => CloudError::Api {
                code: None,
                dbg: format!("{}: {}", $op, err),
            },
        }
    };
}

// aws-sdk-ec2 adapter. Clients are immutable and cached per region; the
// cache is the only shared mutable state.
pub struct Ec2Cloud {
    endpoint_url: Option<String>,
    clients: tokio::sync::Mutex<HashMap<String, aws_sdk_ec2::Client>>,
}

impl Ec2Cloud {
    pub fn from_env() -> Self {
        Ec2Cloud {
            endpoint_url: std::env::var("FLEET_ENDPOINT_URL").ok(),
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, region: &RegionId) -> aws_sdk_ec2::Client {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(region.as_str()) {
            return client.clone();
        }

        let mut loader = aws_config::from_env().region(Region::new(region.as_str().to_string()));
        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let client = aws_sdk_ec2::Client::new(&config);
        clients.insert(region.as_str().to_string(), client.clone());
        client
    }
}

fn tag_specifications(
    resource_type: ResourceType,
    name: &str,
    tags: &[Tag],
) -> TagSpecification {
    let mut builder = TagSpecification::builder().resource_type(resource_type).tags(
        aws_sdk_ec2::types::Tag::builder()
            .key("Name")
            .value(name)
            .build(),
    );
    for tag in tags {
        builder = builder.tags(
            aws_sdk_ec2::types::Tag::builder()
                .key(&tag.key)
                .value(&tag.value)
                .build(),
        );
    }
    builder.build()
}

fn name_from_tags(tags: Option<&[aws_sdk_ec2::types::Tag]>) -> String {
    tags.unwrap_or_default()
        .iter()
        .find(|tag| tag.key() == Some("Name"))
        .and_then(|tag| tag.value())
        .unwrap_or_default()
        .to_string()
}

fn tag_map(tags: Option<&[aws_sdk_ec2::types::Tag]>) -> HashMap<String, String> {
    tags.unwrap_or_default()
        .iter()
        .filter_map(|tag| {
            let key = tag.key()?;
            let value = tag.value()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn instance_status(state: Option<&InstanceStateName>) -> InstanceStatus {
    match state {
        Some(InstanceStateName::Pending) => InstanceStatus::Pending,
        Some(InstanceStateName::Running) => InstanceStatus::Running,
        Some(InstanceStateName::ShuttingDown) | Some(InstanceStateName::Stopping) => {
            InstanceStatus::Stopping
        }
        Some(InstanceStateName::Stopped) => InstanceStatus::Stopped,
        _ => InstanceStatus::Terminated,
    }
}

fn image_status(state: Option<&ImageState>) -> ImageStatus {
    match state {
        Some(ImageState::Available) => ImageStatus::Available,
        Some(ImageState::Pending) | Some(ImageState::Transient) => ImageStatus::Pending,
        Some(other) => ImageStatus::Failed(other.as_str().to_string()),
        None => ImageStatus::Pending,
    }
}

#[async_trait]
impl CloudApi for Ec2Cloud {
    async fn describe_regions(&self) -> CloudResult<Vec<RegionId>> {
        // region listing works from any regional endpoint
        let client = self.client(&RegionId::from("us-east-1")).await;
        let resp = client
            .describe_regions()
            .send()
            .await
            .map_err(map_sdk_err!("describe_regions"))?;
        Ok(resp
            .regions()
            .unwrap_or_default()
            .iter()
            .filter_map(|region| region.region_name().map(RegionId::from))
            .collect())
    }

    async fn describe_zones(&self, region: &RegionId) -> CloudResult<Vec<ZoneId>> {
        let client = self.client(region).await;
        let resp = client
            .describe_availability_zones()
            .send()
            .await
            .map_err(map_sdk_err!("describe_zones"))?;
        Ok(resp
            .availability_zones()
            .unwrap_or_default()
            .iter()
            .filter_map(|zone| zone.zone_name().map(ZoneId::from))
            .collect())
    }

    async fn describe_vpcs(&self, region: &RegionId) -> CloudResult<Vec<VpcRecord>> {
        let client = self.client(region).await;
        let resp = client
            .describe_vpcs()
            .send()
            .await
            .map_err(map_sdk_err!("describe_vpcs"))?;
        Ok(resp
            .vpcs()
            .unwrap_or_default()
            .iter()
            .filter_map(|vpc| {
                Some(VpcRecord {
                    vpc_id: VpcId::from(vpc.vpc_id()?),
                    name: name_from_tags(vpc.tags()),
                    cidr_block: vpc.cidr_block().unwrap_or_default().to_string(),
                    available: vpc.state() == Some(&aws_sdk_ec2::types::VpcState::Available),
                })
            })
            .collect())
    }

    async fn create_vpc(
        &self,
        region: &RegionId,
        name: &str,
        cidr_block: &str,
        tags: &[Tag],
    ) -> CloudResult<VpcId> {
        let client = self.client(region).await;
        let resp = client
            .create_vpc()
            .cidr_block(cidr_block)
            .tag_specifications(tag_specifications(ResourceType::Vpc, name, tags))
            .send()
            .await
            .map_err(map_sdk_err!("create_vpc"))?;
        resp.vpc()
            .and_then(|vpc| vpc.vpc_id())
            .map(VpcId::from)
            .ok_or(CloudError::Api {
                code: None,
                dbg: "create_vpc returned no vpc id".to_string(),
            })
    }

    async fn describe_subnets(
        &self,
        region: &RegionId,
        vpc_id: Option<&VpcId>,
    ) -> CloudResult<Vec<SubnetRecord>> {
        let client = self.client(region).await;
        let mut req = client.describe_subnets();
        if let Some(vpc_id) = vpc_id {
            req = req.filters(
                Filter::builder()
                    .name("vpc-id")
                    .values(vpc_id.as_str())
                    .build(),
            );
        }
        let resp = req.send().await.map_err(map_sdk_err!("describe_subnets"))?;
        Ok(resp
            .subnets()
            .unwrap_or_default()
            .iter()
            .filter_map(|subnet| {
                Some(SubnetRecord {
                    subnet_id: SubnetId::from(subnet.subnet_id()?),
                    name: name_from_tags(subnet.tags()),
                    zone_id: ZoneId::from(subnet.availability_zone()?),
                    cidr_block: subnet.cidr_block().unwrap_or_default().to_string(),
                    available: subnet.state()
                        == Some(&aws_sdk_ec2::types::SubnetState::Available),
                })
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
        tags: &[Tag],
    ) -> CloudResult<SubnetId> {
        let client = self.client(region).await;
        let resp = client
            .create_subnet()
            .vpc_id(vpc_id.as_str())
            .availability_zone(zone_id.as_str())
            .cidr_block(cidr_block)
            .tag_specifications(tag_specifications(ResourceType::Subnet, name, tags))
            .send()
            .await
            .map_err(map_sdk_err!("create_subnet"))?;
        resp.subnet()
            .and_then(|subnet| subnet.subnet_id())
            .map(SubnetId::from)
            .ok_or(CloudError::Api {
                code: None,
                dbg: "create_subnet returned no subnet id".to_string(),
            })
    }

    async fn describe_security_groups(
        &self,
        region: &RegionId,
        vpc_id: Option<&VpcId>,
    ) -> CloudResult<Vec<SecurityGroupRecord>> {
        let client = self.client(region).await;
        let mut req = client.describe_security_groups();
        if let Some(vpc_id) = vpc_id {
            req = req.filters(
                Filter::builder()
                    .name("vpc-id")
                    .values(vpc_id.as_str())
                    .build(),
            );
        }
        let resp = req
            .send()
            .await
            .map_err(map_sdk_err!("describe_security_groups"))?;
        Ok(resp
            .security_groups()
            .unwrap_or_default()
            .iter()
            .filter_map(|group| {
                Some(SecurityGroupRecord {
                    security_group_id: SecurityGroupId::from(group.group_id()?),
                    name: group.group_name().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn create_security_group(
        &self,
        region: &RegionId,
        vpc_id: &VpcId,
        name: &str,
        tags: &[Tag],
    ) -> CloudResult<SecurityGroupId> {
        let client = self.client(region).await;
        let resp = client
            .create_security_group()
            .group_name(name)
            .description("testnet fleet hosts")
            .vpc_id(vpc_id.as_str())
            .tag_specifications(tag_specifications(ResourceType::SecurityGroup, name, tags))
            .send()
            .await
            .map_err(map_sdk_err!("create_security_group"))?;
        resp.group_id()
            .map(SecurityGroupId::from)
            .ok_or(CloudError::Api {
                code: None,
                dbg: "create_security_group returned no group id".to_string(),
            })
    }

    async fn describe_ingress_rules(
        &self,
        region: &RegionId,
        security_group_id: &SecurityGroupId,
    ) -> CloudResult<Vec<IngressRule>> {
        let client = self.client(region).await;
        let resp = client
            .describe_security_groups()
            .group_ids(security_group_id.as_str())
            .send()
            .await
            .map_err(map_sdk_err!("describe_ingress_rules"))?;

        let mut rules = Vec::new();
        for group in resp.security_groups().unwrap_or_default() {
            for permission in group.ip_permissions().unwrap_or_default() {
                let protocol = permission.ip_protocol().unwrap_or_default().to_string();
                let from_port = permission.from_port().unwrap_or_default().max(0) as u16;
                let to_port = permission.to_port().unwrap_or_default().max(0) as u16;
                for range in permission.ip_ranges().unwrap_or_default() {
                    if let Some(cidr) = range.cidr_ip() {
                        rules.push(IngressRule {
                            protocol: protocol.clone(),
                            from_port,
                            to_port,
                            cidr: cidr.to_string(),
                        });
                    }
                }
            }
        }
        Ok(rules)
    }

    async fn authorize_ingress(
        &self,
        region: &RegionId,
        security_group_id: &SecurityGroupId,
        rule: &IngressRule,
    ) -> CloudResult<()> {
        let client = self.client(region).await;
        client
            .authorize_security_group_ingress()
            .group_id(security_group_id.as_str())
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol(&rule.protocol)
                    .from_port(rule.from_port as i32)
                    .to_port(rule.to_port as i32)
                    .ip_ranges(IpRange::builder().cidr_ip(&rule.cidr).build())
                    .build(),
            )
            .send()
            .await
            .map_err(map_sdk_err!("authorize_ingress"))?;
        Ok(())
    }

    async fn describe_key_pair(
        &self,
        region: &RegionId,
        name: &str,
    ) -> CloudResult<Option<KeyPairRecord>> {
        let client = self.client(region).await;
        let resp = client.describe_key_pairs().key_names(name).send().await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(SdkError::ServiceError(service_err))
                if service_err.err().meta().code() == Some("InvalidKeyPair.NotFound") =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err).map_err(map_sdk_err!("describe_key_pair")),
        };

        Ok(resp
            .key_pairs()
            .unwrap_or_default()
            .iter()
            .find(|pair| pair.key_name() == Some(name))
            .map(|pair| KeyPairRecord {
                name: name.to_string(),
                fingerprint: pair.key_fingerprint().unwrap_or_default().to_string(),
            }))
    }

    async fn import_key_pair(
        &self,
        region: &RegionId,
        name: &str,
        public_key_openssh: &str,
        tags: &[Tag],
    ) -> CloudResult<()> {
        let client = self.client(region).await;
        client
            .import_key_pair()
            .key_name(name)
            .public_key_material(Blob::new(public_key_openssh.as_bytes()))
            .tag_specifications(tag_specifications(ResourceType::KeyPair, name, tags))
            .send()
            .await
            .map_err(map_sdk_err!("import_key_pair"))?;
        Ok(())
    }

    async fn describe_images(
        &self,
        region: &RegionId,
        name: &str,
    ) -> CloudResult<Vec<ImageRecord>> {
        let client = self.client(region).await;
        let resp = client
            .describe_images()
            .owners("self")
            .filters(Filter::builder().name("name").values(name).build())
            .send()
            .await
            .map_err(map_sdk_err!("describe_images"))?;
        Ok(resp
            .images()
            .unwrap_or_default()
            .iter()
            .filter_map(|image| {
                Some(ImageRecord {
                    image_id: ImageId::from(image.image_id()?),
                    name: image.name().unwrap_or_default().to_string(),
                    status: image_status(image.state()),
                })
            })
            .collect())
    }

    async fn create_image(
        &self,
        region: &RegionId,
        instance_id: &InstanceId,
        name: &str,
        tags: &[Tag],
    ) -> CloudResult<ImageId> {
        let client = self.client(region).await;
        let resp = client
            .create_image()
            .instance_id(instance_id.as_str())
            .name(name)
            .tag_specifications(tag_specifications(ResourceType::Image, name, tags))
            .send()
            .await
            .map_err(map_sdk_err!("create_image"))?;
        resp.image_id().map(ImageId::from).ok_or(CloudError::Api {
            code: None,
            dbg: "create_image returned no image id".to_string(),
        })
    }

    async fn copy_image(
        &self,
        source_region: &RegionId,
        source_image_id: &ImageId,
        dest_region: &RegionId,
        name: &str,
    ) -> CloudResult<ImageId> {
        // the copy request is issued against the destination region
        let client = self.client(dest_region).await;
        let resp = client
            .copy_image()
            .name(name)
            .source_image_id(source_image_id.as_str())
            .source_region(source_region.as_str())
            .send()
            .await
            .map_err(map_sdk_err!("copy_image"))?;
        resp.image_id().map(ImageId::from).ok_or(CloudError::Api {
            code: None,
            dbg: "copy_image returned no image id".to_string(),
        })
    }

    async fn run_instances(&self, request: &RunInstancesRequest) -> CloudResult<Vec<InstanceId>> {
        let client = self.client(&request.region).await;

        let mut req = client
            .run_instances()
            .image_id(request.image_id.as_str())
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .key_name(&request.key_pair_name)
            .placement(
                Placement::builder()
                    .availability_zone(request.zone.as_str())
                    .build(),
            )
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name("/dev/xvda")
                    .ebs(
                        EbsBlockDevice::builder()
                            .delete_on_termination(true)
                            .volume_size(request.disk_size_gb as i32)
                            .build(),
                    )
                    .build(),
            )
            .network_interfaces(
                InstanceNetworkInterfaceSpecification::builder()
                    .associate_public_ip_address(true)
                    .delete_on_termination(true)
                    .device_index(0)
                    .subnet_id(request.subnet_id.as_str())
                    .groups(request.security_group_id.as_str())
                    .build(),
            )
            .tag_specifications(tag_specifications(
                ResourceType::Instance,
                &request.name,
                &request.tags,
            ))
            .min_count(request.min_count as i32)
            .max_count(request.count as i32);

        if request.charging == ChargingMode::Spot {
            req = req.instance_market_options(
                InstanceMarketOptionsRequest::builder()
                    .market_type(MarketType::Spot)
                    .build(),
            );
        }

        let resp = req.send().await.map_err(map_sdk_err!("run_instances"))?;
        debug!("run_instances {}/{}: {:?}", request.region, request.zone, resp);
        Ok(resp
            .instances()
            .unwrap_or_default()
            .iter()
            .filter_map(|instance| instance.instance_id().map(InstanceId::from))
            .collect())
    }

    async fn describe_instances(
        &self,
        region: &RegionId,
        ids: &[InstanceId],
    ) -> CloudResult<Vec<InstanceObservation>> {
        let client = self.client(region).await;
        // a filter (unlike the InstanceIds parameter) silently skips ids
        // the provider no longer knows, which is exactly what the caller
        // wants to observe
        let resp = client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("instance-id")
                    .set_values(Some(ids.iter().map(|id| id.as_str().to_string()).collect()))
                    .build(),
            )
            .send()
            .await
            .map_err(map_sdk_err!("describe_instances"))?;

        let mut observations = Vec::new();
        for reservation in resp.reservations().unwrap_or_default() {
            for instance in reservation.instances().unwrap_or_default() {
                let Some(instance_id) = instance.instance_id() else {
                    continue;
                };
                observations.push(InstanceObservation {
                    instance_id: InstanceId::from(instance_id),
                    status: instance_status(instance.state().and_then(|state| state.name())),
                    public_ip: instance
                        .public_ip_address()
                        .and_then(|ip| IpAddr::from_str(ip).ok()),
                });
            }
        }
        Ok(observations)
    }

    async fn list_instances(&self, region: &RegionId) -> CloudResult<Vec<InstanceRecord>> {
        let client = self.client(region).await;
        let mut records = Vec::new();
        let mut next_token = None;

        loop {
            let resp = client
                .describe_instances()
                .set_next_token(next_token)
                .send()
                .await
                .map_err(map_sdk_err!("list_instances"))?;

            for reservation in resp.reservations().unwrap_or_default() {
                for instance in reservation.instances().unwrap_or_default() {
                    let Some(instance_id) = instance.instance_id() else {
                        continue;
                    };
                    records.push(InstanceRecord {
                        instance_id: InstanceId::from(instance_id),
                        name: name_from_tags(instance.tags()),
                        status: instance_status(instance.state().and_then(|state| state.name())),
                        tags: tag_map(instance.tags()),
                    });
                }
            }

            next_token = resp.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(records)
    }

    async fn allocate_public_ip(
        &self,
        region: &RegionId,
        instance_id: &InstanceId,
    ) -> CloudResult<IpAddr> {
        let client = self.client(region).await;
        let allocation = client
            .allocate_address()
            .domain(DomainType::Vpc)
            .send()
            .await
            .map_err(map_sdk_err!("allocate_public_ip"))?;

        let allocation_id = allocation.allocation_id().ok_or(CloudError::Api {
            code: None,
            dbg: "allocate_address returned no allocation id".to_string(),
        })?;
        client
            .associate_address()
            .allocation_id(allocation_id)
            .instance_id(instance_id.as_str())
            .send()
            .await
            .map_err(map_sdk_err!("allocate_public_ip"))?;

        allocation
            .public_ip()
            .and_then(|ip| IpAddr::from_str(ip).ok())
            .ok_or(CloudError::Api {
                code: None,
                dbg: "allocate_address returned no public ip".to_string(),
            })
    }

    async fn start_instance(&self, region: &RegionId, instance_id: &InstanceId) -> CloudResult<()> {
        let client = self.client(region).await;
        client
            .start_instances()
            .instance_ids(instance_id.as_str())
            .send()
            .await
            .map_err(map_sdk_err!("start_instance"))?;
        Ok(())
    }

    async fn stop_instance(
        &self,
        region: &RegionId,
        instance_id: &InstanceId,
        force: bool,
        _mode: StoppedMode,
    ) -> CloudResult<()> {
        // this vendor stops billing for stopped instances unconditionally,
        // so the stopped mode carries no request field here
        let client = self.client(region).await;
        client
            .stop_instances()
            .instance_ids(instance_id.as_str())
            .force(force)
            .send()
            .await
            .map_err(map_sdk_err!("stop_instance"))?;
        Ok(())
    }

    async fn delete_instances(&self, region: &RegionId, ids: &[InstanceId]) -> CloudResult<()> {
        let client = self.client(region).await;
        client
            .terminate_instances()
            .set_instance_ids(Some(
                ids.iter().map(|id| id.as_str().to_string()).collect(),
            ))
            .send()
            .await
            .map_err(map_sdk_err!("delete_instances"))?;
        Ok(())
    }

    async fn delete_security_group(
        &self,
        region: &RegionId,
        security_group_id: &SecurityGroupId,
    ) -> CloudResult<()> {
        let client = self.client(region).await;
        client
            .delete_security_group()
            .group_id(security_group_id.as_str())
            .send()
            .await
            .map_err(map_sdk_err!("delete_security_group"))?;
        Ok(())
    }

    async fn delete_subnet(&self, region: &RegionId, subnet_id: &SubnetId) -> CloudResult<()> {
        let client = self.client(region).await;
        client
            .delete_subnet()
            .subnet_id(subnet_id.as_str())
            .send()
            .await
            .map_err(map_sdk_err!("delete_subnet"))?;
        Ok(())
    }

    async fn delete_vpc(&self, region: &RegionId, vpc_id: &VpcId) -> CloudResult<()> {
        let client = self.client(region).await;
        client
            .delete_vpc()
            .vpc_id(vpc_id.as_str())
            .send()
            .await
            .map_err(map_sdk_err!("delete_vpc"))?;
        Ok(())
    }
}
