// Status enums shared by leases and their manager

/// Local belief about ownership of a lease's node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LeaseStatus {
    /// Must be re-verified against the coordination service before use
    #[default]
    Unknown,
    /// Another process holds the node, or nobody does and we released it
    NotHeld,
    /// This process created the node, or reclaimed it after a reconnect
    Held,
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LeaseStatus::Unknown => "UNKNOWN",
            LeaseStatus::NotHeld => "NOT_HELD",
            LeaseStatus::Held => "HELD",
        };
        f.write_str(name)
    }
}

/// Manager lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lifecycle {
    #[default]
    NotStarted,
    Running,
    Stopped,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Lifecycle::NotStarted => "NOT_STARTED",
            Lifecycle::Running => "RUNNING",
            Lifecycle::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}
