// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    cloud::{CloudApi, InstanceId, InstanceStatus, RegionId, ZoneId},
    launch::{Instance, InstanceType, SshProbePool},
    orchestrator::{OrchError, OrchResult, STATE},
};
use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Notify,
    },
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

pub(crate) type RunningBatch = Vec<(InstanceId, IpAddr)>;

// Per-region launch state. An instance id lives in exactly one of three
// buckets:
//   pending - launched, not yet observed running with a reachable ssh port
//   ready   - observed running and the ssh port answered
//   lost    - the provider reported a terminal state, dropped the id, or
//             the ssh probe gave up
// ready and lost are append-only; an id visits at most one of them.
pub struct RegionCreateManager {
    region: RegionId,
    target_nodes: u32,
    request_nodes: u32,
    stall_timeout: Duration,
    state: Mutex<ManagerState>,
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Default)]
struct ManagerState {
    pending: HashMap<InstanceId, Instance>,
    ready: Vec<(Instance, IpAddr)>,
    lost: HashMap<InstanceId, Instance>,
}

fn node_sum<'a>(instances: impl Iterator<Item = &'a Instance>) -> u32 {
    instances.map(|i| i.instance_type.nodes_per_host).sum()
}

impl ManagerState {
    fn ready_nodes(&self) -> u32 {
        node_sum(self.ready.iter().map(|(instance, _)| instance))
    }

    fn pending_nodes(&self) -> u32 {
        node_sum(self.pending.values())
    }

    fn lost_nodes(&self) -> u32 {
        node_sum(self.lost.values())
    }
}

impl RegionCreateManager {
    pub fn new(region: RegionId, target_nodes: u32) -> Self {
        Self::with_slack(region, target_nodes, 0)
    }

    // additional_nodes allows modest over-provisioning beyond the target;
    // callers pass 0 unless they expect churn.
    pub fn with_slack(region: RegionId, target_nodes: u32, additional_nodes: u32) -> Self {
        RegionCreateManager {
            region,
            target_nodes,
            request_nodes: target_nodes + additional_nodes,
            stall_timeout: STATE.state_change_timeout,
            state: Mutex::new(ManagerState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn region(&self) -> &RegionId {
        &self.region
    }

    pub fn submit_pending(&self, ids: &[InstanceId], instance_type: &InstanceType, zone_id: &ZoneId) {
        let mut state = self.lock();
        for id in ids {
            state.pending.insert(
                id.clone(),
                Instance {
                    instance_id: id.clone(),
                    instance_type: instance_type.clone(),
                    zone_id: zone_id.clone(),
                },
            );
        }
    }

    pub fn ready_nodes(&self) -> u32 {
        self.lock().ready_nodes()
    }

    pub fn lost_nodes(&self) -> u32 {
        self.lock().lost_nodes()
    }

    pub fn copy_ready(&self) -> Vec<(Instance, IpAddr)> {
        self.lock().ready.clone()
    }

    // How many more workload nodes the planner should launch.
    //
    // Returns 0 once ready covers the target. Returns the open request
    // amount when the pendings cannot cover it (or, with
    // wait_for_pendings, when none are left). Otherwise the outcome is in
    // the hands of the pending instances, so the call blocks until a
    // state change and re-evaluates; no change within the stall timeout
    // fails the region.
    pub async fn get_rest_nodes(&self, wait_for_pendings: bool) -> OrchResult<u32> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.lock();
                let ready = state.ready_nodes();
                let pending = state.pending_nodes();

                if ready >= self.target_nodes {
                    return Ok(0);
                }
                if ready + pending < self.request_nodes && (!wait_for_pendings || pending == 0) {
                    return Ok(self.request_nodes - ready - pending);
                }
            }

            if tokio::time::timeout(self.stall_timeout, notified).await.is_err() {
                return Err(OrchError::RegionStalled {
                    region: self.region.to_string(),
                });
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn target_reached(&self) -> bool {
        self.lock().ready_nodes() >= self.target_nodes
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().expect("manager state poisoned")
    }

    pub(crate) fn apply_probe_result(&self, id: &InstanceId, ip: IpAddr, ok: bool) {
        {
            let mut state = self.lock();
            let Some(instance) = state.pending.remove(id) else {
                return;
            };
            if ok {
                info!("instance {} at {} accepted ssh in {}", id, ip, self.region);
                state.ready.push((instance, ip));
            } else {
                info!("instance {} at {} never accepted ssh in {}", id, ip, self.region);
                state.lost.insert(id.clone(), instance);
            }
        }
        self.notify.notify_waiters();
    }

    fn mark_lost(&self, ids: &[InstanceId]) {
        let mut changed = false;
        {
            let mut state = self.lock();
            for id in ids {
                if let Some(instance) = state.pending.remove(id) {
                    state.lost.insert(id.clone(), instance);
                    changed = true;
                }
            }
        }
        if changed {
            self.notify.notify_waiters();
        }
    }

    pub fn spawn_tasks(
        self: Arc<Self>,
        api: Arc<dyn CloudApi>,
        pool: SshProbePool,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(STATE.running_queue_capacity);
        let describe = tokio::spawn(self.clone().describe_instances_loop(
            api,
            tx,
            STATE.describe_poll_delay,
        ));
        let ssh = tokio::spawn(self.wait_for_ssh_loop(pool, rx));
        (describe, ssh)
    }

    // Poll the provider for every pending instance not yet handed off.
    // Running instances with an address go onto the running queue; ids the
    // provider dropped or parked in a terminal state become lost. A
    // Stopped report keeps the instance pending, since providers briefly
    // report Stopped during early boot.
    pub(crate) async fn describe_instances_loop(
        self: Arc<Self>,
        api: Arc<dyn CloudApi>,
        tx: mpsc::Sender<RunningBatch>,
        check_interval: Duration,
    ) {
        let mut handed_off: HashSet<InstanceId> = HashSet::new();

        loop {
            if self.target_reached() {
                info!("region {} reached target nodes, describe loop done", self.region);
                return;
            }
            if self.is_closed() {
                return;
            }

            let to_check: Vec<InstanceId> = {
                let state = self.lock();
                state
                    .pending
                    .keys()
                    .filter(|id| !handed_off.contains(*id))
                    .cloned()
                    .collect()
            };

            if !to_check.is_empty() {
                match api.describe_instances(&self.region, &to_check).await {
                    Ok(observations) => {
                        let mut running: RunningBatch = Vec::new();
                        let mut still_pending: HashSet<InstanceId> = HashSet::new();

                        for obs in observations {
                            match obs.status {
                                InstanceStatus::Running => match obs.public_ip {
                                    Some(ip) => running.push((obs.instance_id, ip)),
                                    // running but the address is not visible yet
                                    None => {
                                        still_pending.insert(obs.instance_id);
                                    }
                                },
                                InstanceStatus::Pending
                                | InstanceStatus::Starting
                                | InstanceStatus::Stopped => {
                                    still_pending.insert(obs.instance_id);
                                }
                                // terminal; handled as lost below
                                _ => {}
                            }
                        }

                        let lost: Vec<InstanceId> = to_check
                            .iter()
                            .filter(|id| {
                                !still_pending.contains(*id)
                                    && !running.iter().any(|(running_id, _)| running_id == *id)
                            })
                            .cloned()
                            .collect();

                        if !running.is_empty() {
                            debug!("instances running in {}: {:?}", self.region, running);
                            let ids: Vec<InstanceId> =
                                running.iter().map(|(id, _)| id.clone()).collect();
                            let mut batch = running;
                            loop {
                                match tx.try_send(batch) {
                                    Ok(()) => {
                                        handed_off.extend(ids);
                                        break;
                                    }
                                    // queue full; yield and offer the batch again
                                    Err(TrySendError::Full(returned)) => {
                                        batch = returned;
                                        tokio::task::yield_now().await;
                                    }
                                    Err(TrySendError::Closed(_)) => return,
                                }
                            }
                        }

                        if !lost.is_empty() {
                            info!("instances lost or stopped in {}: {:?}", self.region, lost);
                            self.mark_lost(&lost);
                        }
                    }
                    // read errors are retried on the next tick
                    Err(err) => warn!("describe_instances failed in {}: {}", self.region, err),
                }
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    // Consume running batches and probe each address through the shared
    // pool. A successful probe promotes the instance to ready; a probe
    // that exhausts its deadline demotes it to lost.
    pub(crate) async fn wait_for_ssh_loop(
        self: Arc<Self>,
        pool: SshProbePool,
        mut rx: mpsc::Receiver<RunningBatch>,
    ) {
        let mut probes: JoinSet<(InstanceId, IpAddr, bool)> = JoinSet::new();

        loop {
            while let Some(result) = probes.try_join_next() {
                if let Ok((id, ip, ok)) = result {
                    self.apply_probe_result(&id, ip, ok);
                }
            }

            if self.target_reached() {
                info!("region {} reached target nodes, ssh loop done", self.region);
                return;
            }

            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(batch)) => {
                    for (id, ip) in batch {
                        let pool = pool.clone();
                        probes.spawn(async move {
                            let ok = pool.wait_for_ssh(ip).await;
                            (id, ip, ok)
                        });
                    }
                }
                Ok(None) => {
                    // no more handoffs; settle the in-flight probes and exit
                    while let Some(result) = probes.join_next().await {
                        if let Ok((id, ip, ok)) = result {
                            self.apply_probe_result(&id, ip, ok);
                        }
                        if self.target_reached() {
                            break;
                        }
                    }
                    return;
                }
                Err(_) => {}
            }
        }
    }

    #[cfg(test)]
    fn snapshot_ids(&self) -> (HashSet<InstanceId>, HashSet<InstanceId>, HashSet<InstanceId>) {
        let state = self.lock();
        (
            state.pending.keys().cloned().collect(),
            state
                .ready
                .iter()
                .map(|(instance, _)| instance.instance_id.clone())
                .collect(),
            state.lost.keys().cloned().collect(),
        )
    }
}
