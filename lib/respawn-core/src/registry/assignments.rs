use indexmap::IndexMap;
use respawn_config::{ConfigurationError, GenericConfiguration};

use super::Assignment;
use crate::pool::UnitKind;

/// Pool assignments of unit types, read from the `assignments` section.
///
/// ```yaml
/// assignments:
///   workflows:
///     Onboarding: default
///   activities:
///     ChargeCard: billing
///     SendEmail: ~
/// ```
///
/// A type mapped to null, or not listed at all, is registered in every pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssignmentTable {
    workflows: IndexMap<String, Option<String>>,
    activities: IndexMap<String, Option<String>>,
}

impl AssignmentTable {
    /// Creates a new `AssignmentTable` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the `assignments` section is present but malformed, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        Ok(Self {
            workflows: config.try_get_typed("assignments.workflows")?.unwrap_or_default(),
            activities: config.try_get_typed("assignments.activities")?.unwrap_or_default(),
        })
    }

    /// Assigns a unit type to a pool, or to every pool when `pool` is `None`.
    pub fn assign<T: Into<String>>(&mut self, kind: UnitKind, type_id: T, pool: Option<String>) {
        let table = match kind {
            UnitKind::Workflow => &mut self.workflows,
            UnitKind::Activity => &mut self.activities,
        };
        table.insert(type_id.into(), pool);
    }

    /// Returns the assignment of a unit type.
    pub fn assignment(&self, kind: UnitKind, type_id: &str) -> Assignment {
        let table = match kind {
            UnitKind::Workflow => &self.workflows,
            UnitKind::Activity => &self.activities,
        };
        table.get(type_id).cloned().flatten().into()
    }
}
