// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::orchestrator::{OrchError, OrchResult, STATE};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use tracing::info;

// One ssh-reachable host produced from a ready instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub ip: String,
    pub nodes_per_host: u32,
    pub ssh_user: String,
    pub ssh_key_path: Option<String>,
    pub provider: String,
    pub region: String,
    pub instance_id: String,
}

// The run's final output. Written twice: under the timestamped log
// directory for the archive, and to the well-known path the downstream
// deployment reads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Inventory {
    pub timestamp: String,
    pub log_dir: String,
    pub hosts: Vec<HostSpec>,
}

impl Inventory {
    pub fn new(hosts: Vec<HostSpec>) -> Self {
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        Inventory {
            log_dir: format!("{}/{}", STATE.log_dir, timestamp),
            timestamp,
            hosts,
        }
    }

    pub fn save(&self, well_known_path: &Path) -> OrchResult<()> {
        std::fs::create_dir_all(&self.log_dir).map_err(|err| OrchError::Init {
            dbg: format!("failed to create {}: {err}", self.log_dir),
        })?;
        self.write(&PathBuf::from(&self.log_dir).join("hosts.json"))?;
        self.write(well_known_path)?;
        info!("saved inventory with {} hosts", self.hosts.len());
        Ok(())
    }

    fn write(&self, path: &Path) -> OrchResult<()> {
        let file = File::create(path).map_err(|err| OrchError::Init {
            dbg: format!("failed to create {:?}: {err}", path),
        })?;
        serde_json::to_writer_pretty(file, self).map_err(|err| OrchError::Init {
            dbg: format!("failed to serialize inventory: {err}"),
        })
    }

    pub fn from_file(path: &Path) -> OrchResult<Self> {
        let file = File::open(path).map_err(|_err| OrchError::Init {
            dbg: format!("inventory file not found: {:?}", path),
        })?;
        serde_json::from_reader(file).map_err(|err| OrchError::Init {
            dbg: format!("failed to parse inventory: {err}"),
        })
    }
}
