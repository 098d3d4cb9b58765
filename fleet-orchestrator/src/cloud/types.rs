// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, net::IpAddr};

macro_rules! cloud_id_types {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

cloud_id_types!(RegionId);
cloud_id_types!(ZoneId);
cloud_id_types!(VpcId);
cloud_id_types!(SubnetId);
cloud_id_types!(SecurityGroupId);
cloud_id_types!(ImageId);
cloud_id_types!(InstanceId);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VpcRecord {
    pub vpc_id: VpcId,
    pub name: String,
    pub cidr_block: String,
    pub available: bool,
}

#[derive(Clone, Debug)]
pub struct SubnetRecord {
    pub subnet_id: SubnetId,
    pub name: String,
    pub zone_id: ZoneId,
    pub cidr_block: String,
    pub available: bool,
}

#[derive(Clone, Debug)]
pub struct SecurityGroupRecord {
    pub security_group_id: SecurityGroupId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: String,
}

impl IngressRule {
    pub fn tcp(from_port: u16, to_port: u16) -> Self {
        IngressRule {
            protocol: "tcp".to_string(),
            from_port,
            to_port,
            cidr: "0.0.0.0/0".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct KeyPairRecord {
    pub name: String,
    // MD5 over the OpenSSH-serialized public key, hex, no separators
    pub fingerprint: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageStatus {
    Available,
    Pending,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct ImageRecord {
    pub image_id: ImageId,
    pub name: String,
    pub status: ImageStatus,
}

// Provider lifecycle states as the port reports them. Absence from a
// describe response is meaningful on its own and is not a state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

#[derive(Clone, Debug)]
pub struct InstanceObservation {
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    pub public_ip: Option<IpAddr>,
}

// Listing record used by the cleanup sweep.
#[derive(Clone, Debug)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub name: String,
    pub status: InstanceStatus,
    pub tags: HashMap<String, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChargingMode {
    OnDemand,
    Spot,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoppedMode {
    KeepCharging,
    StopCharging,
}

#[derive(Clone, Debug)]
pub struct RunInstancesRequest {
    pub region: RegionId,
    pub zone: ZoneId,
    pub image_id: ImageId,
    pub instance_type: String,
    pub subnet_id: SubnetId,
    pub security_group_id: SecurityGroupId,
    pub key_pair_name: String,
    pub name: String,
    pub tags: Vec<Tag>,
    pub count: usize,
    // count is the goal; anything >= min_count is accepted
    pub min_count: usize,
    pub disk_size_gb: u32,
    pub charging: ChargingMode,
}
