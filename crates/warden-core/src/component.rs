use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WardenError;

/// Priority class of a component.
///
/// Variants are declared lowest first so the derived `Ord` matches eviction
/// order: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Criticality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Criticality::Low => write!(f, "low"),
            Criticality::Medium => write!(f, "medium"),
            Criticality::High => write!(f, "high"),
            Criticality::Critical => write!(f, "critical"),
        }
    }
}

/// Identity and cost of a governed component.
///
/// `id` is immutable once registered; the registry rejects duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Stable identifier (e.g. "yara-scanner@2")
    pub id: String,
    pub criticality: Criticality,
    /// Budget units held while Active
    pub resource_cost: u64,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Stateless components are never snapshotted.
    #[serde(default)]
    pub stateless: bool,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

impl ComponentDescriptor {
    pub fn new(id: impl Into<String>, criticality: Criticality, resource_cost: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            criticality,
            resource_cost,
            capabilities: BTreeSet::new(),
            stateless: false,
            created_at: now,
            last_transition_at: now,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn stateless(mut self) -> Self {
        self.stateless = true;
        self
    }

    pub fn validate(&self) -> Result<(), WardenError> {
        validate_id(&self.id)
    }
}

/// Component ids double as file names in the file-backed stores, so they
/// are restricted to `[A-Za-z0-9_.@-]{1,128}` and may not start with a dot.
pub fn validate_id(id: &str) -> Result<(), WardenError> {
    let well_formed = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'));
    if well_formed {
        Ok(())
    } else {
        Err(WardenError::Config(format!("invalid component id: {id:?}")))
    }
}
