use std::time::Duration;

use tracing::{info, warn};

use super::{DeploymentResult, DeploymentStatus, HealthScope, RollbackScope, Rollout, VersionMap};

/// Replace instances `batch_size` at a time with one health gate per batch.
pub(crate) fn execute(
    mut rollout: Rollout<'_>,
    batch_size: usize,
    stabilization: Duration,
) -> DeploymentResult {
    let version = rollout.version().to_string();
    let previous = match rollout.target().versions() {
        Ok(previous) => previous,
        Err(err) => return rollout.fail(format!("could not read fleet: {err}")),
    };
    if previous.is_empty() {
        return rollout.fail("environment has no instances");
    }

    let ids: Vec<String> = previous.keys().cloned().collect();
    let batches: Vec<&[String]> = ids.chunks(batch_size.max(1)).collect();
    let total = batches.len();

    for (index, batch) in batches.into_iter().enumerate() {
        if rollout.cancel.is_cancelled() {
            let updated = rollout.updated.clone();
            return revert(rollout, &previous, &updated, "deployment cancelled".into());
        }

        let mut touched = Vec::with_capacity(batch.len());
        for id in batch {
            if let Err(err) = rollout.target().update_instance(id, Some(&version)) {
                let reason = format!("failed to update {id}: {err}");
                let scope = failed_scope(&rollout, &touched);
                return revert(rollout, &previous, &scope, reason);
            }
            rollout.updated.push(id.clone());
            touched.push(id.clone());
        }

        if let Err(err) = rollout.gate(HealthScope::Instances(touched.clone())) {
            let reason = format!("batch {}/{total} failed health check: {err}", index + 1);
            let scope = failed_scope(&rollout, &touched);
            return revert(rollout, &previous, &scope, reason);
        }
        info!(batch = index + 1, total, "Batch healthy");

        if index + 1 < total && !stabilization.is_zero() && !rollout.cancel.sleep(stabilization) {
            let updated = rollout.updated.clone();
            return revert(rollout, &previous, &updated, "deployment cancelled".into());
        }
    }

    rollout.finish(DeploymentStatus::Succeeded, None)
}

fn failed_scope(rollout: &Rollout<'_>, failed_batch: &[String]) -> Vec<String> {
    match rollout.plan.rollback.scope {
        RollbackScope::FailedBatch => failed_batch.to_vec(),
        RollbackScope::AllUpdated => rollout.updated.clone(),
    }
}

/// Put `instances` back on the versions they ran before the rollout.
fn revert(
    mut rollout: Rollout<'_>,
    previous: &VersionMap,
    instances: &[String],
    reason: String,
) -> DeploymentResult {
    if !rollout.plan.rollback.automatic || instances.is_empty() {
        return rollout.fail(reason);
    }
    warn!(instances = instances.len(), %reason, "Rolling back");
    for id in instances {
        let prior = previous.get(id).cloned().flatten();
        if let Err(err) = rollout.target().update_instance(id, prior.as_deref()) {
            return rollout.fail(format!("{reason}; rollback of {id} failed: {err}"));
        }
        rollout.rolled_back.push(id.clone());
    }
    rollout.finish(DeploymentStatus::RolledBack, Some(reason))
}
