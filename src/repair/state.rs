//! Repair states and the node labels/annotations that mirror them.

/// Node label carrying the repair state.
pub const REPAIR_STATE: &str = "REPAIR_STATE";
/// Annotation: UNIX seconds of the last repair state change.
pub const REPAIR_STATE_LAST_UPDATE_TIME: &str = "REPAIR_STATE_LAST_UPDATE_TIME";
/// Annotation: comma-separated names of the failing rules.
pub const REPAIR_UNHEALTHY_RULES: &str = "REPAIR_UNHEALTHY_RULES";
/// Annotation: `"True"` while the node is inside the automated repair cycle.
pub const REPAIR_CYCLE: &str = "REPAIR_CYCLE";
/// Annotation: human-readable repair message.
pub const REPAIR_MESSAGE: &str = "REPAIR_MESSAGE";

/// Repair state of a worker node. The `REPAIR_STATE` label on the
/// Kubernetes node is the durable copy; the in-memory state must only be
/// mutated together with a successful patch of the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairState {
    /// Healthy and schedulable.
    InService,
    /// Unhealthy, cordoned, waiting to become repairable.
    OutOfPool,
    /// Cordoned by an administrator outside the automated cycle.
    OutOfPoolUntracked,
    /// Drained and ready for the repair request.
    ReadyForRepair,
    /// Repair request accepted by the node agent.
    InRepair,
    /// Repair finished, health being re-validated under a grace period.
    AfterRepair,
}

/// Every state, in metric publication order.
pub const ALL_STATES: [RepairState; 6] = [
    RepairState::InService,
    RepairState::OutOfPool,
    RepairState::OutOfPoolUntracked,
    RepairState::ReadyForRepair,
    RepairState::InRepair,
    RepairState::AfterRepair,
];

impl RepairState {
    /// The label value for this state.
    pub fn name(&self) -> &'static str {
        match self {
            RepairState::InService => "IN_SERVICE",
            RepairState::OutOfPool => "OUT_OF_POOL",
            RepairState::OutOfPoolUntracked => "OUT_OF_POOL_UNTRACKED",
            RepairState::ReadyForRepair => "READY_FOR_REPAIR",
            RepairState::InRepair => "IN_REPAIR",
            RepairState::AfterRepair => "AFTER_REPAIR",
        }
    }

    /// Parse a label value.
    pub fn parse(value: &str) -> Option<RepairState> {
        ALL_STATES.iter().find(|state| state.name() == value).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_round_trip() {
        for state in ALL_STATES {
            assert_eq!(RepairState::parse(state.name()), Some(state));
        }
        assert_eq!(RepairState::parse("SOMETHING_ELSE"), None);
    }
}
