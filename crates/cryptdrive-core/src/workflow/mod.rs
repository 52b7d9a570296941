//! Workflow orchestration and the report types it produces.

mod unlock;

pub use unlock::UnlockOrchestrator;

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// What happened to one registry entry during an unlock run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    /// No block device carries the entry's UUID.
    Missing,
    /// Mapping was already active on the expected device.
    AlreadyUnlocked,
    Unlocked {
        key_created: bool,
        key_installed: bool,
        mounted: bool,
    },
    Failed {
        reason: String,
    },
}

impl DeviceOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DeviceOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub target: String,
    pub outcome: DeviceOutcome,
}

/// Aggregated result of one unlock run.
#[derive(Debug, Clone, Default)]
pub struct UnlockReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
    pub devices: Vec<DeviceReport>,
    /// Whether the key vault was acquired during the run.
    pub vault_used: bool,
}

impl UnlockReport {
    pub fn failures(&self) -> impl Iterator<Item = &DeviceReport> {
        self.devices
            .iter()
            .filter(|device| device.outcome.is_failure())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    /// Number of devices this run transitioned from locked to unlocked.
    pub fn unlocked_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|device| matches!(device.outcome, DeviceOutcome::Unlocked { .. }))
            .count()
    }

    pub fn outcome_of(&self, target: &str) -> Option<&DeviceOutcome> {
        self.devices
            .iter()
            .find(|device| device.target == target)
            .map(|device| &device.outcome)
    }
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}
