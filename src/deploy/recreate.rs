use tracing::warn;

use super::{DeploymentResult, DeploymentStatus, HealthScope, Rollout};

/// Terminate everything, start the new version. The only way back is the
/// backup taken up front.
pub(crate) fn execute(mut rollout: Rollout<'_>) -> DeploymentResult {
    let version = rollout.version().to_string();
    let instances: Vec<String> = match rollout.target().versions() {
        Ok(versions) => versions.into_keys().collect(),
        Err(err) => return rollout.fail(format!("could not read fleet: {err}")),
    };
    let backup = match rollout.target().backup() {
        Ok(id) => id,
        Err(err) => return rollout.fail(format!("backup failed, fleet untouched: {err}")),
    };

    if let Err(err) = rollout.target().terminate_all() {
        return restore(rollout, &backup, &instances, format!("terminate failed: {err}"));
    }
    if let Err(err) = rollout.target().start_all(&version) {
        return restore(rollout, &backup, &instances, format!("start failed: {err}"));
    }
    rollout.updated = instances.clone();

    if let Err(err) = rollout.gate(HealthScope::Fleet) {
        let reason = format!("fleet unhealthy after recreate: {err}");
        return restore(rollout, &backup, &instances, reason);
    }
    rollout.finish(DeploymentStatus::Succeeded, None)
}

fn restore(
    mut rollout: Rollout<'_>,
    backup: &str,
    instances: &[String],
    reason: String,
) -> DeploymentResult {
    if !rollout.plan.rollback.automatic || !rollout.plan.rollback.restore_from_backup {
        return rollout.fail(reason);
    }
    warn!(%backup, %reason, "Restoring from backup");
    match rollout.target().restore(backup) {
        Ok(()) => {
            rollout.rolled_back = instances.to_vec();
            rollout.finish(DeploymentStatus::RolledBack, Some(reason))
        }
        Err(err) => rollout.fail(format!("{reason}; restore from {backup} failed: {err}")),
    }
}
