// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::orchestrator::STATE;
use std::{net::IpAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::Semaphore};

// Repeatedly attempt a TCP connect until the port opens or the deadline
// passes. Refused connections count as closed and are retried.
pub async fn wait_port_open(
    ip: IpAddr,
    port: u16,
    probe_timeout: Duration,
    retry_delay: Duration,
    deadline: Duration,
) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if let Ok(Ok(_stream)) =
            tokio::time::timeout(probe_timeout, TcpStream::connect((ip, port))).await
        {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(retry_delay).await;
    }
}

// Process-wide bounded pool for SSH readiness probes. One pool is shared
// by every region so the total number of in-flight connects stays capped;
// it is injected by the orchestrator rather than held as global state.
#[derive(Clone)]
pub struct SshProbePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    permits: Semaphore,
    port: u16,
    probe_timeout: Duration,
    retry_delay: Duration,
    ready_timeout: Duration,
}

impl SshProbePool {
    pub fn new(max_probes: usize) -> Self {
        Self::with_config(
            max_probes,
            STATE.ssh_port,
            STATE.ssh_probe_timeout,
            STATE.ssh_probe_retry_delay,
            STATE.ssh_ready_timeout,
        )
    }

    pub fn with_config(
        max_probes: usize,
        port: u16,
        probe_timeout: Duration,
        retry_delay: Duration,
        ready_timeout: Duration,
    ) -> Self {
        SshProbePool {
            inner: Arc::new(PoolInner {
                permits: Semaphore::new(max_probes),
                port,
                probe_timeout,
                retry_delay,
                ready_timeout,
            }),
        }
    }

    pub async fn wait_for_ssh(&self, ip: IpAddr) -> bool {
        let Ok(_permit) = self.inner.permits.acquire().await else {
            return false;
        };
        wait_port_open(
            ip,
            self.inner.port,
            self.inner.probe_timeout,
            self.inner.retry_delay,
            self.inner.ready_timeout,
        )
        .await
    }
}
