//! Pessimistic and optimistic lock modes.

use std::time::Duration;

/// Lock level requested for an entity or query.
///
/// Variants are ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockMode {
    /// No lock; data may come from the cache.
    #[default]
    None,
    /// Version read from the store, bypassing caches.
    Read,
    /// Version checked at flush time.
    Optimistic,
    /// Version incremented at flush time.
    OptimisticForceIncrement,
    /// Implicitly acquired on insert/update.
    Write,
    /// `SELECT ... FOR UPDATE`.
    Upgrade,
    /// `SELECT ... FOR UPDATE NOWAIT`.
    UpgradeNoWait,
    /// Pessimistic lock with a version increment.
    Force,
}

impl LockMode {
    pub fn greater_than(self, other: LockMode) -> bool {
        self > other
    }

    pub fn less_than(self, other: LockMode) -> bool {
        self < other
    }

    /// Does this mode require a row lock in the store?
    pub fn is_pessimistic(self) -> bool {
        matches!(
            self,
            LockMode::Upgrade | LockMode::UpgradeNoWait | LockMode::Force
        )
    }

    /// Does this mode bypass the second-level cache?
    pub fn bypasses_cache(self) -> bool {
        self != LockMode::None
    }
}

/// Lock options for a query: a default mode plus per-alias overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockOptions {
    pub mode: LockMode,
    pub alias_modes: Vec<(String, LockMode)>,
    pub timeout: Option<Duration>,
}

impl LockOptions {
    pub fn new(mode: LockMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>, mode: LockMode) -> Self {
        self.alias_modes.push((alias.into(), mode));
        self
    }

    /// Strongest mode requested anywhere in these options.
    pub fn strongest(&self) -> LockMode {
        self.alias_modes
            .iter()
            .map(|(_, m)| *m)
            .fold(self.mode, LockMode::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_are_ordered_by_strength() {
        assert!(LockMode::Upgrade.greater_than(LockMode::Read));
        assert!(LockMode::None.less_than(LockMode::Write));
        assert!(LockMode::UpgradeNoWait.is_pessimistic());
        assert!(!LockMode::Read.is_pessimistic());
    }

    #[test]
    fn strongest_considers_alias_overrides() {
        let opts = LockOptions::new(LockMode::Read).with_alias("o", LockMode::Upgrade);
        assert_eq!(opts.strongest(), LockMode::Upgrade);
        assert_eq!(LockOptions::default().strongest(), LockMode::None);
    }
}
