use std::time::Duration;

use tracing::{info, warn};

use super::{DeploymentResult, DeploymentStatus, HealthScope, Rollout};

/// Mirror traffic to the new version, watch it, stop mirroring. Users are
/// never served by the shadow and it is never promoted.
pub(crate) fn execute(mut rollout: Rollout<'_>, monitoring: Duration) -> DeploymentResult {
    let version = rollout.version().to_string();
    if let Err(err) = rollout.target().set_mirror(Some(&version)) {
        return rollout.fail(format!("failed to start mirroring: {err}"));
    }

    let outcome = rollout.monitor(HealthScope::Shadow, monitoring);
    if let Err(err) = rollout.target().set_mirror(None) {
        warn!(error = %err, "Failed to stop mirroring");
    }

    match outcome {
        Ok(()) => {
            info!(%version, "Shadow validated");
            rollout.finish(
                DeploymentStatus::Succeeded,
                Some("shadow validated; not promoted".to_string()),
            )
        }
        Err(err) => rollout.fail(format!("shadow validation failed: {err}")),
    }
}
