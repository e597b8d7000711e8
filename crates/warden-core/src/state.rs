use serde::{Deserialize, Serialize};

/// A state a component can rest in between transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestState {
    Active,
    Dormant,
    Disabled,
}

impl std::fmt::Display for RestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestState::Active => write!(f, "active"),
            RestState::Dormant => write!(f, "dormant"),
            RestState::Disabled => write!(f, "disabled"),
        }
    }
}

/// The authoritative lifecycle state of a component.
///
/// `Transitioning` is only ever held while the lifecycle controller owns the
/// component's lease; it always resolves to a rest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Dormant,
    Disabled,
    Transitioning { from: RestState, to: RestState },
}

impl LifecycleState {
    pub fn kind(&self) -> StateKind {
        match self {
            LifecycleState::Active => StateKind::Active,
            LifecycleState::Dormant => StateKind::Dormant,
            LifecycleState::Disabled => StateKind::Disabled,
            LifecycleState::Transitioning { .. } => StateKind::Transitioning,
        }
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, LifecycleState::Transitioning { .. })
    }

    /// Move from `from` towards `to`.
    pub fn transitioning(from: RestState, to: RestState) -> Self {
        LifecycleState::Transitioning { from, to }
    }
}

impl From<RestState> for LifecycleState {
    fn from(rest: RestState) -> Self {
        match rest {
            RestState::Active => LifecycleState::Active,
            RestState::Dormant => LifecycleState::Dormant,
            RestState::Disabled => LifecycleState::Disabled,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Dormant => write!(f, "dormant"),
            LifecycleState::Disabled => write!(f, "disabled"),
            LifecycleState::Transitioning { from, to } => write!(f, "transitioning({from}->{to})"),
        }
    }
}

/// State discriminant, used for filtering listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Active,
    Dormant,
    Disabled,
    Transitioning,
}

impl std::str::FromStr for StateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(StateKind::Active),
            "dormant" => Ok(StateKind::Dormant),
            "disabled" => Ok(StateKind::Disabled),
            "transitioning" => Ok(StateKind::Transitioning),
            other => Err(format!("unknown state: {other}")),
        }
    }
}
