// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    cloud::{retry_mutating, CloudApi, RegionId, Tag},
    infra::wait_for,
    orchestrator::{OrchError, OrchResult},
};
use russh_keys::PublicKeyBase64;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::info;

const IMPORT_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const IMPORT_SETTLE_INTERVAL: Duration = Duration::from_secs(3);

// A key pair derived from a local private key file. The fingerprint is the
// MD5 over the raw OpenSSH public-key blob, which is what providers report
// for imported keys.
#[derive(Clone, Debug)]
pub struct LocalKeyPair {
    pub name: String,
    pub path: PathBuf,
    pub fingerprint: String,
    pub public_key_openssh: String,
}

impl LocalKeyPair {
    pub fn load(name: &str, path: &Path) -> OrchResult<Self> {
        let key = russh_keys::load_secret_key(path, None).map_err(|err| OrchError::Init {
            dbg: format!("failed to load ssh key {}: {}", path.display(), err),
        })?;
        Ok(Self::from_key(name, path, &key))
    }

    pub(crate) fn from_key(name: &str, path: &Path, key: &russh_keys::key::KeyPair) -> Self {
        let blob = key.public_key_bytes();
        LocalKeyPair {
            name: name.to_string(),
            path: path.to_path_buf(),
            fingerprint: format!("{:x}", md5::compute(blob)),
            public_key_openssh: format!("{} {}", key.name(), key.public_key_base64()),
        }
    }
}

// Providers render the same digest with different separators and casing.
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase()
}

pub async fn ensure_key_pair(
    api: &dyn CloudApi,
    region: &RegionId,
    key: &LocalKeyPair,
    allow_create: bool,
    tags: &[Tag],
) -> OrchResult<()> {
    let remote = api.describe_key_pair(region, &key.name).await?;

    match remote {
        Some(remote) => {
            if normalize_fingerprint(&remote.fingerprint) == normalize_fingerprint(&key.fingerprint)
            {
                info!("key pair {} found in {}", key.name, region);
                Ok(())
            } else {
                Err(OrchError::KeyPairMismatch {
                    region: region.to_string(),
                    name: key.name.clone(),
                })
            }
        }
        None if allow_create => {
            info!("importing key pair {} into {}", key.name, region);
            retry_mutating("import_key_pair", || {
                api.import_key_pair(region, &key.name, &key.public_key_openssh, tags)
            })
            .await?;

            wait_for(
                region,
                "imported key pair",
                IMPORT_SETTLE_TIMEOUT,
                IMPORT_SETTLE_INTERVAL,
                || async move {
                    let remote = api.describe_key_pair(region, &key.name).await?;
                    Ok(remote.is_some_and(|remote| {
                        normalize_fingerprint(&remote.fingerprint)
                            == normalize_fingerprint(&key.fingerprint)
                    }))
                },
            )
            .await
        }
        None => Err(OrchError::Infra {
            region: region.to_string(),
            dbg: format!("key pair {} not found and infra creation is disabled", key.name),
        }),
    }
}
