// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::cloud::CloudError;

pub type OrchResult<T, E = OrchError> = Result<T, E>;

#[derive(Debug)]
pub enum OrchError {
    Init { dbg: String },
    Cloud { dbg: String },
    // Fatal for the whole provider; aborts peer regions.
    Auth { dbg: String },
    Infra { region: String, dbg: String },
    // Never auto-rotated; the operator must resolve the conflict by hand.
    KeyPairMismatch { region: String, name: String },
    RegionStalled { region: String },
}

impl std::fmt::Display for OrchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchError::Init { dbg } => write!(f, "{}", dbg),
            OrchError::Cloud { dbg } => write!(f, "{}", dbg),
            OrchError::Auth { dbg } => write!(f, "auth failure: {}", dbg),
            OrchError::Infra { region, dbg } => write!(f, "infra failure in {}: {}", region, dbg),
            OrchError::KeyPairMismatch { region, name } => write!(
                f,
                "key pair {} in {} has a different fingerprint than the local key",
                name, region
            ),
            OrchError::RegionStalled { region } => {
                write!(f, "region {} made no progress before the wait deadline", region)
            }
        }
    }
}

impl std::error::Error for OrchError {}

impl From<CloudError> for OrchError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Auth { dbg } => OrchError::Auth { dbg },
            err => OrchError::Cloud {
                dbg: err.to_string(),
            },
        }
    }
}
