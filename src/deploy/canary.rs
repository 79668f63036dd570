use std::time::Duration;

use tracing::{info, warn};

use super::{DeploymentResult, DeploymentStatus, HealthScope, Rollout};

pub(crate) fn execute(
    mut rollout: Rollout<'_>,
    traffic_percentage: f64,
    monitoring: Duration,
    auto_promote: bool,
) -> DeploymentResult {
    let version = rollout.version().to_string();
    let previous = match rollout.target().versions() {
        Ok(previous) => previous,
        Err(err) => return rollout.fail(format!("could not read fleet: {err}")),
    };

    if let Err(err) = rollout.target().set_canary(Some(&version), traffic_percentage) {
        return rollout.fail(format!("failed to route canary traffic: {err}"));
    }
    info!(traffic_percentage, monitoring_ms = monitoring.as_millis() as u64, "Canary live");

    if let Err(err) = rollout.monitor(HealthScope::Canary, monitoring) {
        let reason = format!("canary breached thresholds: {err}");
        if !rollout.plan.rollback.automatic {
            return rollout.fail(reason);
        }
        warn!(%reason, "Withdrawing canary");
        return match rollout.target().set_canary(None, 0.0) {
            Ok(()) => {
                rollout.rolled_back.push("canary".to_string());
                rollout.finish(DeploymentStatus::RolledBack, Some(reason))
            }
            Err(err) => rollout.fail(format!("{reason}; canary removal failed: {err}")),
        };
    }

    if !auto_promote {
        return rollout.finish(
            DeploymentStatus::Succeeded,
            Some(format!("canary holding at {traffic_percentage}% awaiting promotion")),
        );
    }

    if let Err(err) = rollout.target().promote(&version) {
        return rollout.fail(format!("failed to promote canary: {err}"));
    }
    rollout.updated = previous.keys().cloned().collect();

    if let Err(err) = rollout.gate(HealthScope::Fleet) {
        let reason = format!("fleet unhealthy after promotion: {err}");
        if !rollout.plan.rollback.automatic {
            return rollout.fail(reason);
        }
        for (id, prior) in &previous {
            if let Err(err) = rollout.target().update_instance(id, prior.as_deref()) {
                return rollout.fail(format!("{reason}; rollback of {id} failed: {err}"));
            }
            rollout.rolled_back.push(id.clone());
        }
        return rollout.finish(DeploymentStatus::RolledBack, Some(reason));
    }

    rollout.finish(DeploymentStatus::Succeeded, None)
}
