//! Deferred cache maintenance.
//!
//! Position shifts and defragmentation are requested by one call and carried
//! out later, before the next slot search. A pending shift always runs before
//! a pending defrag: defrag moves cells, and the shift pass reads each
//! cell's accumulated delta in place.

/// Work waiting to be applied to the cache storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Maintenance {
    #[default]
    Clean,
    ShiftPending,
    DefragPending,
    ShiftThenDefrag,
}

/// A single maintenance pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceStep {
    Shift,
    Defrag,
}

impl Maintenance {
    pub fn with_shift(self) -> Self {
        match self {
            Self::Clean | Self::ShiftPending => Self::ShiftPending,
            Self::DefragPending | Self::ShiftThenDefrag => Self::ShiftThenDefrag,
        }
    }

    pub fn with_defrag(self) -> Self {
        match self {
            Self::Clean | Self::DefragPending => Self::DefragPending,
            Self::ShiftPending | Self::ShiftThenDefrag => Self::ShiftThenDefrag,
        }
    }

    /// The pass that has to run next, if any
    pub fn next_step(self) -> Option<MaintenanceStep> {
        match self {
            Self::Clean => None,
            Self::ShiftPending | Self::ShiftThenDefrag => Some(MaintenanceStep::Shift),
            Self::DefragPending => Some(MaintenanceStep::Defrag),
        }
    }

    /// State after `step` has been applied.
    ///
    /// Completing a step that is not next leaves the state unchanged.
    pub fn complete(self, step: MaintenanceStep) -> Self {
        match (self, step) {
            (Self::ShiftPending, MaintenanceStep::Shift) => Self::Clean,
            (Self::ShiftThenDefrag, MaintenanceStep::Shift) => Self::DefragPending,
            (Self::DefragPending, MaintenanceStep::Defrag) => Self::Clean,
            (state, _) => state,
        }
    }

    pub fn shift_pending(self) -> bool {
        matches!(self, Self::ShiftPending | Self::ShiftThenDefrag)
    }

    pub fn defrag_pending(self) -> bool {
        matches!(self, Self::DefragPending | Self::ShiftThenDefrag)
    }
}
