use indexmap::IndexSet;
use respawn_error::ErrorKind;

use super::RebootStrategy;
use crate::job::JobOutcome;

/// Reboots when a job fails, unless the failure kind is explicitly allowed.
///
/// Allowed kinds are matched exactly. There is no hierarchy between kinds.
#[derive(Clone, Debug, Default)]
pub struct OnException {
    allowed: IndexSet<ErrorKind>,
}

impl OnException {
    /// Creates a new `OnException` strategy that tolerates the given failure kinds.
    pub fn new<I, K>(allowed: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ErrorKind>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the tolerated failure kinds, in the order they were configured.
    pub fn allowed(&self) -> impl Iterator<Item = &ErrorKind> {
        self.allowed.iter()
    }
}

impl RebootStrategy for OnException {
    fn should_reboot(&mut self, outcome: &JobOutcome) -> bool {
        match outcome {
            JobOutcome::Success => false,
            JobOutcome::Failure(kind) => !self.allowed.contains(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn empty_allow_list_reboots_on_any_failure() {
        let mut strategy = OnException::default();
        assert!(!strategy.should_reboot(&JobOutcome::Success));
        assert!(strategy.should_reboot(&JobOutcome::Failure("db.deadlock".into())));
    }

    #[test]
    fn allowed_kinds_are_tolerated() {
        let mut strategy = OnException::new(["validation"]);
        assert!(!strategy.should_reboot(&JobOutcome::Failure("validation".into())));
        assert!(strategy.should_reboot(&JobOutcome::Failure("io".into())));
    }

    #[test]
    fn kinds_match_exactly() {
        let mut strategy = OnException::new(["io"]);
        assert!(strategy.should_reboot(&JobOutcome::Failure("io.timeout".into())));
        assert!(strategy.should_reboot(&JobOutcome::Failure("IO".into())));
    }

    proptest! {
        #[test]
        fn property_success_never_reboots(allowed in proptest::collection::vec("[a-z.]{1,12}", 0..8)) {
            let mut strategy = OnException::new(allowed);
            prop_assert!(!strategy.should_reboot(&JobOutcome::Success));
        }

        #[test]
        fn property_failure_reboots_iff_not_allowed(
            allowed in proptest::collection::vec("[a-z.]{1,12}", 0..8),
            kind in "[a-z.]{1,12}",
        ) {
            let expected = !allowed.contains(&kind);
            let mut strategy = OnException::new(allowed);
            prop_assert_eq!(strategy.should_reboot(&JobOutcome::Failure(kind.into())), expected);
        }
    }
}
