// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{future::Future, time::Duration};
use tracing::warn;

mod api;
pub mod aws;
#[cfg(test)]
pub mod sim;
mod types;

pub use api::{CloudApi, CloudError, CloudResult};
pub use types::{
    ChargingMode, ImageId, ImageRecord, ImageStatus, IngressRule, InstanceId, InstanceObservation,
    InstanceRecord, InstanceStatus, KeyPairRecord, RegionId, RunInstancesRequest, SecurityGroupId,
    SecurityGroupRecord, StoppedMode, SubnetId, SubnetRecord, Tag, VpcId, VpcRecord, ZoneId,
};

const MAX_RETRY_COUNT: usize = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

// Deletion while the provider still reports the instance as initializing
// is retried on a short cadence before giving up on the item.
pub(crate) async fn delete_instances_with_retry(
    api: &dyn CloudApi,
    region: &RegionId,
    ids: &[InstanceId],
    attempts: usize,
    delay: Duration,
) -> CloudResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match api.delete_instances(region, ids).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_initializing() && attempt < attempts => {
                warn!("instances in {region} still initializing, delete retry {attempt}");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

// Bounded retry for mutating calls. Read calls are retried by their outer
// poll loops instead.
pub(crate) async fn retry_mutating<T, F, Fut>(op_name: &str, mut op: F) -> CloudResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CloudResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_RETRY_COUNT => {
                warn!("{op_name} attempt {attempt} failed, retrying: {err}");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}
