use super::RebootStrategy;
use crate::job::JobOutcome;

/// Reboots when any of its member strategies asks for a reboot.
///
/// Every member sees every outcome, even after an earlier member has already voted to reboot, so that stateful members
/// such as [`MaxJobs`](super::MaxJobs) keep an accurate count.
#[derive(Default)]
pub struct Chain {
    strategies: Vec<Box<dyn RebootStrategy>>,
}

impl Chain {
    /// Creates a new `Chain` from the given strategies.
    pub fn new(strategies: Vec<Box<dyn RebootStrategy>>) -> Self {
        Self { strategies }
    }

    /// Appends a strategy to the chain.
    pub fn push<S>(&mut self, strategy: S)
    where
        S: RebootStrategy + 'static,
    {
        self.strategies.push(Box::new(strategy));
    }

    /// Returns the number of member strategies.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Returns `true` if the chain has no members.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl RebootStrategy for Chain {
    fn should_reboot(&mut self, outcome: &JobOutcome) -> bool {
        let mut reboot = false;
        for strategy in &mut self.strategies {
            reboot |= strategy.should_reboot(outcome);
        }
        reboot
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::reboot::{MaxJobs, OnException};

    struct Counting {
        seen: Arc<AtomicUsize>,
        vote: bool,
    }

    impl RebootStrategy for Counting {
        fn should_reboot(&mut self, _outcome: &JobOutcome) -> bool {
            self.seen.fetch_add(1, Ordering::Relaxed);
            self.vote
        }
    }

    #[test]
    fn empty_chain_never_reboots() {
        let mut chain = Chain::default();
        assert!(!chain.should_reboot(&JobOutcome::Failure("io".into())));
    }

    #[test]
    fn every_member_is_evaluated() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut chain = Chain::default();
        chain.push(Counting {
            seen: Arc::clone(&seen),
            vote: true,
        });
        chain.push(Counting {
            seen: Arc::clone(&seen),
            vote: false,
        });

        assert!(chain.should_reboot(&JobOutcome::Success));
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn counter_advances_when_another_member_votes() {
        let mut chain = Chain::default();
        chain.push(OnException::default());
        chain.push(MaxJobs::new(3, 0.0).unwrap());

        assert!(chain.should_reboot(&JobOutcome::Failure("io".into())));
        assert!(!chain.should_reboot(&JobOutcome::Success));
        assert!(chain.should_reboot(&JobOutcome::Success));
    }

    #[test]
    fn job_limit_then_failure() {
        let mut chain = Chain::default();
        chain.push(OnException::default());
        chain.push(MaxJobs::new(3, 0.0).unwrap());

        let votes: Vec<bool> = [
            JobOutcome::Success,
            JobOutcome::Success,
            JobOutcome::Success,
            JobOutcome::Failure("io".into()),
        ]
        .iter()
        .map(|outcome| chain.should_reboot(outcome))
        .collect();
        assert_eq!(votes, vec![false, false, true, true]);
    }
}
