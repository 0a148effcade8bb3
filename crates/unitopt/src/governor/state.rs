//! Optimizer lifecycle states and the legal transitions between them.

use std::fmt;
use std::str::FromStr;

use crate::error::GovernorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptimizerState {
    Uninitialized = 0,
    Bootstrapping = 1,
    Warming = 2,
    Active = 3,
    Degraded = 4,
    Disabled = 5,
}

impl OptimizerState {
    pub const ALL: [OptimizerState; 6] = [
        Self::Uninitialized,
        Self::Bootstrapping,
        Self::Warming,
        Self::Active,
        Self::Degraded,
        Self::Disabled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Bootstrapping => "BOOTSTRAPPING",
            Self::Warming => "WARMING",
            Self::Active => "ACTIVE",
            Self::Degraded => "DEGRADED",
            Self::Disabled => "DISABLED",
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|state| *state as u8 == raw)
    }

    /// Whether units may enter the pipeline in this state.
    pub fn permits_optimization(self) -> bool {
        matches!(self, Self::Warming | Self::Active | Self::Degraded)
    }

    /// Transitions the governor may take on its own.
    ///
    /// Leaving DISABLED requires `StabilityGovernor::manual_reset`.
    pub fn can_transition_to(self, to: Self) -> bool {
        use OptimizerState::*;
        matches!(
            (self, to),
            (Uninitialized, Bootstrapping)
                | (Bootstrapping, Warming)
                | (Warming, Active)
                | (Warming, Degraded)
                | (Active, Degraded)
                | (Degraded, Active)
        ) || (to == Disabled && self != Disabled)
    }
}

impl fmt::Display for OptimizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerState {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| GovernorError::UnknownState(s.to_string()))
    }
}
