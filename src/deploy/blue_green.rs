use tracing::{info, warn};

use super::{DeploymentResult, DeploymentStatus, HealthScope, Rollout};

/// Provision the idle slot, gate it, flip traffic, gate the live fleet.
/// Rollback points traffic back at the slot that was live before.
pub(crate) fn execute(mut rollout: Rollout<'_>) -> DeploymentResult {
    let version = rollout.version().to_string();
    let live = match rollout.target().active_slot() {
        Ok(slot) => slot,
        Err(err) => return rollout.fail(format!("could not read active slot: {err}")),
    };
    let idle = live.other();
    let previous = rollout.target().versions().unwrap_or_default();

    if let Err(err) = rollout.target().provision_slot(idle, &version) {
        return rollout.fail(format!("failed to provision slot {idle}: {err}"));
    }
    if let Err(err) = rollout.gate(HealthScope::Slot(idle.to_string())) {
        // traffic never moved; drop the idle slot and keep serving from live
        if let Err(decommission) = rollout.target().decommission_slot(idle) {
            warn!(slot = %idle, error = %decommission, "Failed to decommission unhealthy slot");
        }
        return rollout.fail(format!("slot {idle} failed health check: {err}"));
    }

    if let Err(err) = rollout.target().switch_traffic(idle) {
        return rollout.fail(format!("failed to switch traffic to {idle}: {err}"));
    }
    rollout.updated = previous.keys().cloned().collect();
    info!(from = %live, to = %idle, "Traffic switched");

    if let Err(err) = rollout.gate(HealthScope::Fleet) {
        let reason = format!("fleet unhealthy after switch to {idle}: {err}");
        if !rollout.plan.rollback.automatic {
            return rollout.fail(reason);
        }
        warn!(%reason, "Switching traffic back to {live}");
        // a live slot that was never provisioned means the fleet ran
        // unmanaged versions; restore those per instance
        let restored = match rollout.target().switch_traffic(live) {
            Ok(()) => Ok(()),
            Err(_) => previous.iter().try_for_each(|(id, prior)| {
                rollout.target().update_instance(id, prior.as_deref())
            }),
        };
        return match restored {
            Ok(()) => {
                rollout.rolled_back = rollout.updated.clone();
                rollout.finish(DeploymentStatus::RolledBack, Some(reason))
            }
            Err(err) => rollout.fail(format!("{reason}; rollback failed: {err}")),
        };
    }

    if let Err(err) = rollout.target().decommission_slot(live) {
        warn!(slot = %live, error = %err, "Failed to decommission previous slot");
    }
    rollout.finish(DeploymentStatus::Succeeded, None)
}
