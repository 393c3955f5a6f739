//! Observed column sets
//!
//! Transactions consult this to validate notify calls and to flag locks on
//! strong-observed columns. The engine builds it from the shared
//! configuration's observer registrations.

use crate::config::ObserverSpecification;
use crate::encoding::NotificationType;
use crate::error::{SeepError, SeepResult};
use crate::key::validate_user_column;
use crate::types::Column;
use std::collections::BTreeSet;

/// Columns that trigger observers, split by notification type
///
/// A column is in at most one of the two sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedColumns {
    weak: BTreeSet<Column>,
    strong: BTreeSet<Column>,
}

impl ObservedColumns {
    /// No observed columns
    pub fn new() -> Self {
        ObservedColumns::default()
    }

    /// Build from observer registrations
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a column is registered as both weak and
    /// strong, or if a column uses a reserved family.
    pub fn from_specs<'a, I>(specs: I) -> SeepResult<Self>
    where
        I: IntoIterator<Item = &'a ObserverSpecification>,
    {
        let mut observed = ObservedColumns::new();
        for spec in specs {
            observed.add(spec.column(), spec.notification)?;
        }
        Ok(observed)
    }

    /// Register a column
    ///
    /// Registering the same column twice with the same type is a no-op.
    pub fn add(&mut self, column: Column, ntype: NotificationType) -> SeepResult<()> {
        validate_user_column(&column)
            .map_err(|e| SeepError::configuration(format!("cannot observe {}: {}", column, e)))?;
        if let Some(existing) = self.notification_type(&column) {
            if existing != ntype {
                return Err(SeepError::configuration(format!(
                    "column {} is observed as both {:?} and {:?}",
                    column, existing, ntype
                )));
            }
            return Ok(());
        }
        match ntype {
            NotificationType::Weak => self.weak.insert(column),
            NotificationType::Strong => self.strong.insert(column),
        };
        Ok(())
    }

    /// Notification type `column` is observed with, if any
    pub fn notification_type(&self, column: &Column) -> Option<NotificationType> {
        if self.weak.contains(column) {
            Some(NotificationType::Weak)
        } else if self.strong.contains(column) {
            Some(NotificationType::Strong)
        } else {
            None
        }
    }

    /// Fail unless `column` is observed with exactly `ntype`
    pub fn require(&self, column: &Column, ntype: NotificationType) -> SeepResult<()> {
        match self.notification_type(column) {
            Some(found) if found == ntype => Ok(()),
            Some(found) => Err(SeepError::configuration(format!(
                "column {} is {:?}-observed, not {:?}",
                column, found, ntype
            ))),
            None => Err(SeepError::configuration(format!(
                "column {} is not observed",
                column
            ))),
        }
    }

    /// True if writes to `column` arm a strong notification
    pub fn is_strong(&self, column: &Column) -> bool {
        self.strong.contains(column)
    }

    /// Weak-observed columns
    pub fn weak(&self) -> impl Iterator<Item = &Column> {
        self.weak.iter()
    }

    /// Strong-observed columns
    pub fn strong(&self) -> impl Iterator<Item = &Column> {
        self.strong.iter()
    }

    /// Total observed columns
    pub fn len(&self) -> usize {
        self.weak.len() + self.strong.len()
    }

    /// True if nothing is observed
    pub fn is_empty(&self) -> bool {
        self.weak.is_empty() && self.strong.is_empty()
    }
}
