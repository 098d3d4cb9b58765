// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::orchestrator::{OrchError, OrchResult, STATE};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::{
    fs::File,
    path::{Path, PathBuf},
};

#[derive(Parser, Debug)]
#[command(name = "fleet-orchestrator", version, about = "Provision multi-region instance fleets for testnet deployments")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision the fleet described by the request config
    Create(CreateArgs),
    /// Tear down tagged instances, and optionally their network resources
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Path to the request config file
    #[arg(short = 'c', long, default_value = "request_config.json")]
    pub request_config: PathBuf,

    /// Where to write the host inventory
    #[arg(short = 'o', long, default_value = "hosts.json")]
    pub output: PathBuf,

    /// Create missing vpcs, subnets, security groups, key pairs and images
    #[arg(long)]
    pub allow_create_infra: bool,

    /// Stop after the infra stage without launching instances
    #[arg(long)]
    pub infra_only: bool,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Regions to sweep; defaults to every region the provider exposes
    #[arg(long, value_delimiter = ',')]
    pub regions: Vec<String>,

    /// Delete exactly the instances recorded in this inventory file
    #[arg(long)]
    pub inventory_file: Option<PathBuf>,

    /// User tag whose resources should be deleted
    #[arg(long)]
    pub user_tag: Option<String>,

    /// Also delete vpcs and subnets created for this user tag
    #[arg(long)]
    pub delete_network: bool,
}

// The declarative request: per provider, which regions need how many
// workload nodes and which instance types may host them, in preference
// order.
#[derive(Clone, Debug, Deserialize)]
pub struct RequestConfig {
    pub aws: ProviderConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    pub user_tag: String,
    pub image_name: String,
    pub ssh_key_path: PathBuf,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub use_spot: bool,
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    #[serde(default)]
    pub regions: Vec<RegionRequest>,
    #[serde(default)]
    pub instance_types: Vec<InstanceTypeConfig>,
    #[serde(default)]
    pub image_build: Option<ImageBuildSection>,
}

impl ProviderConfig {
    pub fn ssh_user(&self) -> String {
        self.ssh_user
            .clone()
            .unwrap_or_else(|| STATE.default_ssh_user.to_string())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegionRequest {
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InstanceTypeConfig {
    pub name: String,
    pub nodes: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ImageBuildSection {
    #[serde(default)]
    pub base_image_id: Option<String>,
    #[serde(default)]
    pub builder_instance_type: Option<String>,
    #[serde(default)]
    pub provision_script: Option<PathBuf>,
}

impl RequestConfig {
    pub fn from_file(path: &Path) -> OrchResult<Self> {
        let file = File::open(path).map_err(|_err| OrchError::Init {
            dbg: format!("request config not found: {:?}", path),
        })?;
        let config: RequestConfig = serde_json::from_reader(file).map_err(|err| OrchError::Init {
            dbg: format!("failed to parse request config: {err}"),
        })?;
        config.aws.validate()?;
        Ok(config)
    }
}

impl ProviderConfig {
    fn validate(&self) -> OrchResult<()> {
        if self.user_tag.is_empty() {
            return Err(OrchError::Init {
                dbg: "user_tag must not be empty".to_string(),
            });
        }
        if self.regions.is_empty() {
            return Err(OrchError::Init {
                dbg: "request declares no regions".to_string(),
            });
        }
        if self.instance_types.is_empty() {
            return Err(OrchError::Init {
                dbg: "request declares no instance types".to_string(),
            });
        }
        for instance_type in &self.instance_types {
            if instance_type.nodes == 0 {
                return Err(OrchError::Init {
                    dbg: format!("instance type {} declares zero nodes per host", instance_type.name),
                });
            }
        }
        Ok(())
    }
}
