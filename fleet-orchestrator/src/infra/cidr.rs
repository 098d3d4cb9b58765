// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

// First vacant block of the requested prefix inside the VPC CIDR, walking
// candidates in address order so the result is deterministic for a given
// set of occupied blocks.
pub fn allocate_vacant_block(
    occupied: &[Ipv4Network],
    vpc_cidr: Ipv4Network,
    prefix: u8,
) -> Option<Ipv4Network> {
    if prefix < vpc_cidr.prefix() || prefix > 32 {
        return None;
    }

    let step = 1u64 << (32 - prefix);
    let base = u64::from(u32::from(vpc_cidr.network()));
    let span = 1u64 << (32 - vpc_cidr.prefix());

    let mut addr = base;
    while addr + step <= base + span {
        let candidate = Ipv4Network::new(Ipv4Addr::from(addr as u32), prefix).ok()?;
        if !occupied.iter().any(|used| candidate.overlaps(*used)) {
            return Some(candidate);
        }
        addr += step;
    }
    None
}

pub fn parse_block(cidr: &str) -> Option<Ipv4Network> {
    cidr.parse().ok()
}
