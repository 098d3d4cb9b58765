// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;

pub const STATE: State = State {
    version: "v0.1.0",
    provider_label: "aws",

    // tags; cleanup matches on the (common, user) pair
    common_tag_key: "testnet-fleet",
    common_tag_value: "true",
    user_tag_key: "user",

    // hosts
    default_ssh_user: "root",
    ssh_port: 22,
    default_disk_size_gb: 40,

    // networking
    vpc_cidr: "10.0.0.0/16",
    subnet_prefix: 24,
    workload_port_range: (1024, 49151),

    // polling
    describe_poll_delay: Duration::from_secs(3),
    resource_poll_delay: Duration::from_secs(3),
    resource_ready_timeout: Duration::from_secs(120),
    image_ready_timeout: Duration::from_secs(1800),
    state_change_timeout: Duration::from_secs(180),
    delete_retry_delay: Duration::from_secs(5),
    delete_retry_count: 5,

    // ssh probes
    ssh_probe_timeout: Duration::from_secs(5),
    ssh_probe_retry_delay: Duration::from_secs(3),
    ssh_ready_timeout: Duration::from_secs(180),
    ssh_probe_pool_size: 2000,

    // fan-out
    infra_concurrency: 5,
    region_concurrency: 10,
    running_queue_capacity: 10_000,

    log_dir: "logs",
    default_builder_instance_type: "c5.xlarge",
};

pub struct State {
    pub version: &'static str,
    pub provider_label: &'static str,

    pub common_tag_key: &'static str,
    pub common_tag_value: &'static str,
    pub user_tag_key: &'static str,

    pub default_ssh_user: &'static str,
    pub ssh_port: u16,
    pub default_disk_size_gb: u32,

    pub vpc_cidr: &'static str,
    pub subnet_prefix: u8,
    pub workload_port_range: (u16, u16),

    pub describe_poll_delay: Duration,
    pub resource_poll_delay: Duration,
    pub resource_ready_timeout: Duration,
    pub image_ready_timeout: Duration,
    pub state_change_timeout: Duration,
    pub delete_retry_delay: Duration,
    pub delete_retry_count: usize,

    pub ssh_probe_timeout: Duration,
    pub ssh_probe_retry_delay: Duration,
    pub ssh_ready_timeout: Duration,
    pub ssh_probe_pool_size: usize,

    pub infra_concurrency: usize,
    pub region_concurrency: usize,
    pub running_queue_capacity: usize,

    pub log_dir: &'static str,
    pub default_builder_instance_type: &'static str,
}

impl State {
    // Shared name for the vpc, subnets, security group and key pair owned
    // by one user tag. Lookups go by this name, so reruns resolve to the
    // same resources.
    pub fn infra_name(&self, user_tag: &str) -> String {
        format!("{}-{}", self.common_tag_key, user_tag)
    }

    pub fn instance_name(&self, user_tag: &str) -> String {
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{}-{}-{}", self.common_tag_key, user_tag, epoch)
    }

    pub fn builder_name(&self, user_tag: &str) -> String {
        format!("{}-{}-image-builder", self.common_tag_key, user_tag)
    }
}
