// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Probe of the nodes' leader selection.

use log::{error, info};

use crate::HarnessError;
use crate::fleet::Fleet;
use crate::network::{Command, NodeChannel};

/// Asks every node for the next block proposer and checks they agree.
///
/// Each node snapshots its stake pool while answering, so this must be
/// called exactly once per round.
///
/// # Errors
///
/// Returns [`HarnessError::Desynchronized`] if any node disagrees with node 0,
/// [`HarnessError::EmptyStakePool`] if node 0 has nobody to select.
pub async fn next_validator<C: NodeChannel>(fleet: &Fleet<C>) -> Result<String, HarnessError> {
    let expected = fleet.send(0, &Command::CountNextValidator).await?;
    if expected.is_empty() {
        return Err(HarnessError::EmptyStakePool);
    }
    for index in 1..fleet.len() {
        let actual = fleet.send(index, &Command::CountNextValidator).await?;
        if actual != expected {
            error!("nodes became desynchronized");
            return Err(HarnessError::Desynchronized {
                node: fleet.node(index).name.clone(),
                expected,
                actual,
            });
        }
    }
    info!("next block proposer is {expected}");
    Ok(expected)
}
