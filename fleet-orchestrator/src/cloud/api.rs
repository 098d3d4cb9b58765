// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::cloud::types::{
    ChargingMode, ImageId, ImageRecord, IngressRule, InstanceId, InstanceObservation,
    InstanceRecord, KeyPairRecord, RegionId, RunInstancesRequest, SecurityGroupId,
    SecurityGroupRecord, StoppedMode, SubnetId, SubnetRecord, Tag, VpcId, VpcRecord, ZoneId,
};
use async_trait::async_trait;
use std::net::IpAddr;

pub type CloudResult<T, E = CloudError> = Result<T, E>;

#[derive(Clone, Debug)]
pub enum CloudError {
    // Capacity exhausted for one (region, zone, type) triple. The planner
    // advances; never fatal on its own.
    NoStock { dbg: String },
    // The resource cannot accept the mutation yet; retry after a short wait.
    Initializing { dbg: String },
    Auth { dbg: String },
    Api { code: Option<String>, dbg: String },
}

impl CloudError {
    pub fn from_code(code: Option<&str>, dbg: String) -> Self {
        match code {
            Some(
                "InsufficientInstanceCapacity"
                | "InsufficientCapacity"
                | "SpotMaxPriceTooLow"
                | "OperationDenied.NoStock",
            ) => CloudError::NoStock { dbg },
            Some(
                "IncorrectInstanceState" | "IncorrectState" | "IncorrectInstanceStatus.Initializing",
            ) => CloudError::Initializing { dbg },
            Some(
                "AuthFailure"
                | "UnauthorizedOperation"
                | "InvalidClientTokenId"
                | "SignatureDoesNotMatch",
            ) => CloudError::Auth { dbg },
            code => CloudError::Api {
                code: code.map(str::to_string),
                dbg,
            },
        }
    }

    pub fn is_no_stock(&self) -> bool {
        matches!(self, CloudError::NoStock { .. })
    }

    pub fn is_initializing(&self) -> bool {
        matches!(self, CloudError::Initializing { .. })
    }

    // Worth another attempt on a mutating call; NoStock, auth and
    // not-ready conditions are handled by their own policies instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::Api { code, .. } => match code.as_deref() {
                Some("RequestLimitExceeded" | "Throttling" | "InternalError" | "Unavailable") => {
                    true
                }
                Some(_) => false,
                None => true,
            },
            _ => false,
        }
    }
}

impl std::fmt::Display for CloudError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudError::NoStock { dbg } => write!(f, "no stock: {}", dbg),
            CloudError::Initializing { dbg } => write!(f, "resource not ready: {}", dbg),
            CloudError::Auth { dbg } => write!(f, "auth: {}", dbg),
            CloudError::Api { code: Some(code), dbg } => write!(f, "[{}] {}", code, dbg),
            CloudError::Api { code: None, dbg } => write!(f, "{}", dbg),
        }
    }
}

impl std::error::Error for CloudError {}

// The capability surface the engine needs from a compute vendor. Adapters
// translate SDK shapes into the plain records of [crate::cloud::types] at
// this boundary; nothing above it sees vendor types.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn describe_regions(&self) -> CloudResult<Vec<RegionId>>;

    async fn describe_zones(&self, region: &RegionId) -> CloudResult<Vec<ZoneId>>;

    async fn describe_vpcs(&self, region: &RegionId) -> CloudResult<Vec<VpcRecord>>;

    async fn create_vpc(
        &self,
        region: &RegionId,
        name: &str,
        cidr_block: &str,
        tags: &[Tag],
    ) -> CloudResult<VpcId>;

    async fn describe_subnets(
        &self,
        region: &RegionId,
        vpc_id: Option<&VpcId>,
    ) -> CloudResult<Vec<SubnetRecord>>;

    async fn create_subnet(
        &self,
        region: &RegionId,
        vpc_id: &VpcId,
        zone_id: &ZoneId,
        name: &str,
        cidr_block: &str,
        tags: &[Tag],
    ) -> CloudResult<SubnetId>;

    async fn describe_security_groups(
        &self,
        region: &RegionId,
        vpc_id: Option<&VpcId>,
    ) -> CloudResult<Vec<SecurityGroupRecord>>;

    async fn create_security_group(
        &self,
        region: &RegionId,
        vpc_id: &VpcId,
        name: &str,
        tags: &[Tag],
    ) -> CloudResult<SecurityGroupId>;

    async fn describe_ingress_rules(
        &self,
        region: &RegionId,
        security_group_id: &SecurityGroupId,
    ) -> CloudResult<Vec<IngressRule>>;

    async fn authorize_ingress(
        &self,
        region: &RegionId,
        security_group_id: &SecurityGroupId,
        rule: &IngressRule,
    ) -> CloudResult<()>;

    async fn describe_key_pair(
        &self,
        region: &RegionId,
        name: &str,
    ) -> CloudResult<Option<KeyPairRecord>>;

    async fn import_key_pair(
        &self,
        region: &RegionId,
        name: &str,
        public_key_openssh: &str,
        tags: &[Tag],
    ) -> CloudResult<()>;

    // Self-owned images matching the exact name.
    async fn describe_images(&self, region: &RegionId, name: &str)
        -> CloudResult<Vec<ImageRecord>>;

    async fn create_image(
        &self,
        region: &RegionId,
        instance_id: &InstanceId,
        name: &str,
        tags: &[Tag],
    ) -> CloudResult<ImageId>;

    async fn copy_image(
        &self,
        source_region: &RegionId,
        source_image_id: &ImageId,
        dest_region: &RegionId,
        name: &str,
    ) -> CloudResult<ImageId>;

    async fn run_instances(&self, request: &RunInstancesRequest) -> CloudResult<Vec<InstanceId>>;

    // Returns observations only for ids that still exist; absence means
    // the provider no longer knows the id.
    async fn describe_instances(
        &self,
        region: &RegionId,
        ids: &[InstanceId],
    ) -> CloudResult<Vec<InstanceObservation>>;

    // Paged listing of every instance in the region, for the cleanup sweep.
    async fn list_instances(&self, region: &RegionId) -> CloudResult<Vec<InstanceRecord>>;

    async fn allocate_public_ip(
        &self,
        region: &RegionId,
        instance_id: &InstanceId,
    ) -> CloudResult<IpAddr>;

    async fn start_instance(&self, region: &RegionId, instance_id: &InstanceId) -> CloudResult<()>;

    async fn stop_instance(
        &self,
        region: &RegionId,
        instance_id: &InstanceId,
        force: bool,
        mode: StoppedMode,
    ) -> CloudResult<()>;

    async fn delete_instances(&self, region: &RegionId, ids: &[InstanceId]) -> CloudResult<()>;

    async fn delete_security_group(
        &self,
        region: &RegionId,
        security_group_id: &SecurityGroupId,
    ) -> CloudResult<()>;

    async fn delete_subnet(&self, region: &RegionId, subnet_id: &SubnetId) -> CloudResult<()>;

    async fn delete_vpc(&self, region: &RegionId, vpc_id: &VpcId) -> CloudResult<()>;
}

// Convenience constructors used by the launch planner.
impl RunInstancesRequest {
    pub fn on_demand(mut self) -> Self {
        self.charging = ChargingMode::OnDemand;
        self
    }
}
