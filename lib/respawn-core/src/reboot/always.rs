use super::RebootStrategy;
use crate::job::JobOutcome;

/// Reboots after every job, regardless of its outcome.
#[derive(Clone, Copy, Debug, Default)]
pub struct Always;

impl RebootStrategy for Always {
    fn should_reboot(&mut self, _outcome: &JobOutcome) -> bool {
        true
    }
}
