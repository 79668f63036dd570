use serde::Serialize;
use tracing::{info, warn};

use crate::run::{RunStatus, StageStatus};

/// Lifecycle events announced to notification channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        definition_id: String,
    },
    StageFinished {
        run_id: String,
        stage: String,
        status: StageStatus,
        detail: Option<String>,
    },
    RunFinished {
        run_id: String,
        definition_id: String,
        status: RunStatus,
    },
}

/// Fire-and-forget notification channel. Delivery is best effort: an
/// implementation logs its own failures and never reports them back.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &RunEvent);
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                run_id,
                definition_id,
            } => info!(run_id, definition_id, "Pipeline run started"),
            RunEvent::StageFinished {
                run_id,
                stage,
                status: StageStatus::Failed,
                detail,
            } => warn!(
                run_id,
                stage,
                detail = detail.as_deref().unwrap_or(""),
                "Stage failed"
            ),
            RunEvent::StageFinished {
                run_id,
                stage,
                status,
                ..
            } => info!(run_id, stage, %status, "Stage finished"),
            RunEvent::RunFinished {
                run_id,
                definition_id,
                status,
            } => info!(run_id, definition_id, %status, "Pipeline run finished"),
        }
    }
}

/// Fans an event out to several channels.
#[derive(Default)]
pub struct NotifierSet {
    channels: Vec<Box<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: impl Notifier + 'static) -> Self {
        self.channels.push(Box::new(channel));
        self
    }
}

impl Notifier for NotifierSet {
    fn notify(&self, event: &RunEvent) {
        for channel in &self.channels {
            channel.notify(event);
        }
    }
}
