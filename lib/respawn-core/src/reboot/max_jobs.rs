use rand::Rng;

use super::{RebootStrategy, StrategyError};
use crate::job::JobOutcome;

/// Reboots once the process has completed a jittered number of jobs.
///
/// The threshold is drawn once, at construction, from `max_jobs ± max_jobs * dispersion`, so that a fleet of workers
/// started together does not reboot in lockstep. Both successes and failures count towards it.
#[derive(Clone, Debug)]
pub struct MaxJobs {
    max_jobs: u64,
    dispersion: f64,
    threshold: u64,
    completed: u64,
}

impl MaxJobs {
    /// Creates a new `MaxJobs` strategy, drawing the threshold from the thread-local RNG.
    ///
    /// # Errors
    ///
    /// If `max_jobs` is zero, or `dispersion` is not within `[0, 1)`, an error is returned.
    pub fn new(max_jobs: u64, dispersion: f64) -> Result<Self, StrategyError> {
        Self::with_rng(max_jobs, dispersion, &mut rand::rng())
    }

    /// Creates a new `MaxJobs` strategy, drawing the threshold from the given RNG.
    ///
    /// # Errors
    ///
    /// If `max_jobs` is zero, or `dispersion` is not within `[0, 1)`, an error is returned.
    pub fn with_rng<R: Rng>(max_jobs: u64, dispersion: f64, rng: &mut R) -> Result<Self, StrategyError> {
        if max_jobs == 0 {
            return Err(StrategyError::InvalidMaxJobs { max_jobs });
        }

        // NaN fails the range check too.
        if !(0.0..1.0).contains(&dispersion) {
            return Err(StrategyError::InvalidDispersion { dispersion });
        }

        let jitter = if dispersion > 0.0 {
            rng.random_range(-1.0..=1.0)
        } else {
            0.0
        };
        let spread = max_jobs as f64 * dispersion * jitter;
        let threshold = (max_jobs as f64 + spread).round().max(1.0) as u64;

        Ok(Self {
            max_jobs,
            dispersion,
            threshold,
            completed: 0,
        })
    }

    /// Returns the configured job limit, before jitter.
    pub fn max_jobs(&self) -> u64 {
        self.max_jobs
    }

    /// Returns the configured dispersion.
    pub fn dispersion(&self) -> f64 {
        self.dispersion
    }

    /// Returns the number of completed jobs after which a reboot is requested.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Returns the number of jobs observed so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }
}

impl RebootStrategy for MaxJobs {
    fn should_reboot(&mut self, _outcome: &JobOutcome) -> bool {
        self.completed = self.completed.saturating_add(1);
        self.completed >= self.threshold
    }
}
