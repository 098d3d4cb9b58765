// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    cloud::{
        delete_instances_with_retry, retry_mutating, ChargingMode, CloudApi, ImageId, ImageRecord,
        ImageStatus, InstanceId, InstanceStatus, RegionId, RunInstancesRequest, SecurityGroupId,
        StoppedMode, SubnetId, Tag, ZoneId,
    },
    infra::wait_for,
    launch::probe,
    orchestrator::{OrchError, OrchResult, STATE},
};
use std::{
    net::IpAddr,
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
};
use tracing::{info, warn};

// Build parameters for the path where no image of the requested name
// exists in any region.
#[derive(Clone, Debug)]
pub struct ImageBuildConfig {
    pub base_image_id: Option<ImageId>,
    pub builder_instance_type: String,
    pub provision_script: Option<PathBuf>,
    pub ssh_user: String,
    pub ssh_key_path: PathBuf,
    pub use_spot: bool,
}

// Launch context for the temporary builder instance; all resources are the
// ones the reconciler just ensured for the region.
pub struct BuilderContext<'a> {
    pub zone_id: &'a ZoneId,
    pub subnet_id: &'a SubnetId,
    pub security_group_id: &'a SecurityGroupId,
    pub key_pair_name: &'a str,
    pub user_tag: &'a str,
}

// Resolve the image for one region: use it where it exists, copy it from
// any region that has it, and only then build it from scratch.
pub async fn ensure_image(
    api: &Arc<dyn CloudApi>,
    region: &RegionId,
    image_name: &str,
    search_regions: &[RegionId],
    allow_create: bool,
    build: Option<&ImageBuildConfig>,
    ctx: &BuilderContext<'_>,
    tags: &[Tag],
) -> OrchResult<ImageId> {
    if let Some(image) = find_image(api.as_ref(), region, image_name).await? {
        info!("image {} found in {}: {}", image_name, region, image.image_id);
        wait_for_image_available(api.as_ref(), region, &image.image_id, image_name).await?;
        return Ok(image.image_id);
    }

    if !allow_create {
        return Err(OrchError::Infra {
            region: region.to_string(),
            dbg: format!("image {} not found and infra creation is disabled", image_name),
        });
    }

    for source_region in search_regions.iter().filter(|r| *r != region) {
        let Some(source) = find_image(api.as_ref(), source_region, image_name).await? else {
            continue;
        };
        if source.status != ImageStatus::Available {
            continue;
        }
        info!(
            "copying image {} from {} to {}",
            source.image_id, source_region, region
        );
        let image_id = retry_mutating("copy_image", || {
            api.copy_image(source_region, &source.image_id, region, image_name)
        })
        .await?;
        wait_for_image_available(api.as_ref(), region, &image_id, image_name).await?;
        return Ok(image_id);
    }

    let Some(build) = build else {
        return Err(OrchError::Infra {
            region: region.to_string(),
            dbg: format!(
                "image {} not found in any region and no image build is configured",
                image_name
            ),
        });
    };
    build_image(api, region, image_name, build, ctx, tags).await
}

async fn find_image(
    api: &dyn CloudApi,
    region: &RegionId,
    image_name: &str,
) -> OrchResult<Option<ImageRecord>> {
    let images = api.describe_images(region, image_name).await?;
    Ok(images.into_iter().find(|image| image.name == image_name))
}

async fn wait_for_image_available(
    api: &dyn CloudApi,
    region: &RegionId,
    image_id: &ImageId,
    image_name: &str,
) -> OrchResult<()> {
    wait_for(
        region,
        "image",
        STATE.image_ready_timeout,
        STATE.resource_poll_delay,
        || async move {
            let images = api.describe_images(region, image_name).await?;
            let Some(image) = images.iter().find(|image| &image.image_id == image_id) else {
                return Ok(false);
            };
            match &image.status {
                ImageStatus::Available => Ok(true),
                ImageStatus::Pending => Ok(false),
                ImageStatus::Failed(state) => Err(OrchError::Infra {
                    region: region.to_string(),
                    dbg: format!("image {} entered failure state {}", image_id, state),
                }),
            }
        },
    )
    .await
}

// Launch a throwaway instance from the base image, wait for it to accept
// SSH, run the provisioning script, then snapshot and discard it.
async fn build_image(
    api: &Arc<dyn CloudApi>,
    region: &RegionId,
    image_name: &str,
    build: &ImageBuildConfig,
    ctx: &BuilderContext<'_>,
    tags: &[Tag],
) -> OrchResult<ImageId> {
    let base_image_id = build.base_image_id.clone().ok_or(OrchError::Infra {
        region: region.to_string(),
        dbg: format!(
            "image {} must be built but no base image is configured",
            image_name
        ),
    })?;

    info!("building image {} in {}", image_name, region);
    let builder_id = launch_builder(api.as_ref(), region, &base_image_id, build, ctx, tags).await?;

    let result = provision_builder(api.as_ref(), region, &builder_id, image_name, build, tags).await;

    // the builder is deleted on both paths; the snapshot owns the data now
    if let Err(err) = delete_instances_with_retry(
        api.as_ref(),
        region,
        std::slice::from_ref(&builder_id),
        STATE.delete_retry_count,
        STATE.delete_retry_delay,
    )
    .await
    {
        warn!("failed to delete image builder {}: {}", builder_id, err);
    }

    result
}

async fn launch_builder(
    api: &dyn CloudApi,
    region: &RegionId,
    base_image_id: &ImageId,
    build: &ImageBuildConfig,
    ctx: &BuilderContext<'_>,
    tags: &[Tag],
) -> OrchResult<InstanceId> {
    let request = RunInstancesRequest {
        region: region.clone(),
        zone: ctx.zone_id.clone(),
        image_id: base_image_id.clone(),
        instance_type: build.builder_instance_type.clone(),
        subnet_id: ctx.subnet_id.clone(),
        security_group_id: ctx.security_group_id.clone(),
        key_pair_name: ctx.key_pair_name.to_string(),
        name: STATE.builder_name(ctx.user_tag),
        tags: tags.to_vec(),
        count: 1,
        min_count: 1,
        disk_size_gb: STATE.default_disk_size_gb,
        charging: if build.use_spot {
            ChargingMode::Spot
        } else {
            ChargingMode::OnDemand
        },
    };

    let ids = match api.run_instances(&request).await {
        Ok(ids) => ids,
        // spot capacity is best effort; the builder falls back to on-demand
        Err(err) if err.is_no_stock() && request.charging == ChargingMode::Spot => {
            warn!("no spot capacity for builder in {}, retrying on-demand", region);
            api.run_instances(&request.clone().on_demand()).await?
        }
        Err(err) => return Err(err.into()),
    };

    ids.into_iter().next().ok_or(OrchError::Infra {
        region: region.to_string(),
        dbg: "builder launch returned no instance id".to_string(),
    })
}

async fn provision_builder(
    api: &dyn CloudApi,
    region: &RegionId,
    builder_id: &InstanceId,
    image_name: &str,
    build: &ImageBuildConfig,
    tags: &[Tag],
) -> OrchResult<ImageId> {
    let ip = wait_for_builder_ip(api, region, builder_id).await?;

    let reachable = probe::wait_port_open(
        ip,
        STATE.ssh_port,
        STATE.ssh_probe_timeout,
        STATE.ssh_probe_retry_delay,
        STATE.ssh_ready_timeout,
    )
    .await;
    if !reachable {
        return Err(OrchError::Infra {
            region: region.to_string(),
            dbg: format!("builder {} never accepted ssh on {}", builder_id, ip),
        });
    }

    if let Some(script) = &build.provision_script {
        run_provision_script(region, ip, script, build)?;
    }

    retry_mutating("stop_instance", || {
        api.stop_instance(region, builder_id, true, StoppedMode::StopCharging)
    })
    .await?;
    wait_for(
        region,
        "builder stop",
        STATE.resource_ready_timeout,
        STATE.resource_poll_delay,
        || async move {
            let observed = api
                .describe_instances(region, std::slice::from_ref(builder_id))
                .await?;
            Ok(observed
                .first()
                .is_some_and(|obs| obs.status == InstanceStatus::Stopped))
        },
    )
    .await?;

    let image_id =
        retry_mutating("create_image", || api.create_image(region, builder_id, image_name, tags))
            .await?;
    wait_for_image_available(api, region, &image_id, image_name).await?;
    info!("built image {} in {}: {}", image_name, region, image_id);
    Ok(image_id)
}

async fn wait_for_builder_ip(
    api: &dyn CloudApi,
    region: &RegionId,
    builder_id: &InstanceId,
) -> OrchResult<IpAddr> {
    let deadline = tokio::time::Instant::now() + STATE.resource_ready_timeout;
    loop {
        let observed = api
            .describe_instances(region, std::slice::from_ref(builder_id))
            .await?;
        let Some(obs) = observed.first() else {
            return Err(OrchError::Infra {
                region: region.to_string(),
                dbg: format!("builder {} disappeared during boot", builder_id),
            });
        };

        if obs.status == InstanceStatus::Running {
            return match obs.public_ip {
                Some(ip) => Ok(ip),
                // running without an address yet; ask the provider for one
                None => Ok(api.allocate_public_ip(region, builder_id).await?),
            };
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(OrchError::Infra {
                region: region.to_string(),
                dbg: format!("builder {} never reached running", builder_id),
            });
        }
        tokio::time::sleep(STATE.resource_poll_delay).await;
    }
}

fn run_provision_script(
    region: &RegionId,
    ip: IpAddr,
    script: &PathBuf,
    build: &ImageBuildConfig,
) -> OrchResult<()> {
    info!("provisioning builder at {} with {}", ip, script.display());
    let script_file = std::fs::File::open(script).map_err(|err| OrchError::Infra {
        region: region.to_string(),
        dbg: format!("provision script {}: {}", script.display(), err),
    })?;

    let status = Command::new("ssh")
        .arg("-i")
        .arg(&build.ssh_key_path)
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg(format!("{}@{}", build.ssh_user, ip))
        .arg("bash -s")
        .stdin(Stdio::from(script_file))
        .status()
        .map_err(|err| OrchError::Infra {
            region: region.to_string(),
            dbg: format!("failed to run ssh: {}", err),
        })?;

    if !status.success() {
        return Err(OrchError::Infra {
            region: region.to_string(),
            dbg: format!("provision script exited with {}", status),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::sim::SimCloud;

    fn ctx<'a>(
        zone: &'a ZoneId,
        subnet: &'a SubnetId,
        sg: &'a SecurityGroupId,
    ) -> BuilderContext<'a> {
        BuilderContext {
            zone_id: zone,
            subnet_id: subnet,
            security_group_id: sg,
            key_pair_name: "fleet-key",
            user_tag: "tester",
        }
    }

    #[tokio::test]
    async fn existing_image_is_reused() {
        let sim = Arc::new(SimCloud::new());
        let api: Arc<dyn CloudApi> = sim.clone();
        let region = RegionId::from("r1");
        sim.add_region(&region, &["z1"]);
        let seeded = sim.seed_image(&region, "base-image", ImageStatus::Available);

        let zone = ZoneId::from("z1");
        let subnet = SubnetId::from("subnet-1");
        let sg = SecurityGroupId::from("sg-1");
        let image_id = ensure_image(
            &api,
            &region,
            "base-image",
            &[region.clone()],
            true,
            None,
            &ctx(&zone, &subnet, &sg),
            &[],
        )
        .await
        .unwrap();
        assert_eq!(image_id, seeded);
        assert_eq!(sim.create_calls(), 0);
    }

    #[tokio::test]
    async fn image_is_copied_from_peer_region() {
        let sim = Arc::new(SimCloud::new());
        let api: Arc<dyn CloudApi> = sim.clone();
        let r1 = RegionId::from("r1");
        let r2 = RegionId::from("r2");
        sim.add_region(&r1, &["z1"]);
        sim.add_region(&r2, &["z1"]);
        sim.seed_image(&r2, "base-image", ImageStatus::Available);

        let zone = ZoneId::from("z1");
        let subnet = SubnetId::from("subnet-1");
        let sg = SecurityGroupId::from("sg-1");
        let image_id = ensure_image(
            &api,
            &r1,
            "base-image",
            &[r1.clone(), r2.clone()],
            true,
            None,
            &ctx(&zone, &subnet, &sg),
            &[],
        )
        .await
        .unwrap();

        // the copy now lives in r1 and is available
        let local = api.describe_images(&r1, "base-image").await.unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].image_id, image_id);
    }

    #[tokio::test]
    async fn missing_image_without_create_is_fatal() {
        let sim = Arc::new(SimCloud::new());
        let api: Arc<dyn CloudApi> = sim.clone();
        let region = RegionId::from("r1");
        sim.add_region(&region, &["z1"]);

        let zone = ZoneId::from("z1");
        let subnet = SubnetId::from("subnet-1");
        let sg = SecurityGroupId::from("sg-1");
        let err = ensure_image(
            &api,
            &region,
            "base-image",
            &[region.clone()],
            false,
            None,
            &ctx(&zone, &subnet, &sg),
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OrchError::Infra { .. }));
    }

    #[tokio::test]
    async fn failed_image_state_is_fatal() {
        let sim = Arc::new(SimCloud::new());
        let api: Arc<dyn CloudApi> = sim.clone();
        let region = RegionId::from("r1");
        sim.add_region(&region, &["z1"]);
        sim.seed_image(&region, "base-image", ImageStatus::Failed("CreateFailed".to_string()));

        let zone = ZoneId::from("z1");
        let subnet = SubnetId::from("subnet-1");
        let sg = SecurityGroupId::from("sg-1");
        let err = ensure_image(
            &api,
            &region,
            "base-image",
            &[region.clone()],
            true,
            None,
            &ctx(&zone, &subnet, &sg),
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OrchError::Infra { .. }));
    }
}
