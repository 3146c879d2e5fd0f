//! Fault injection for commit testing.
//!
//! A store opened with a non-zero `FaultConfig` fails commits on purpose,
//! either while writing data pages or while replacing the master record, so
//! tests can check what survives a crash between the two phases.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for fault injection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultConfig {
    /// Probability that writing data pages fails (0.0 - 1.0).
    pub data_phase_error_rate: f64,
    /// Probability that replacing the master record fails (0.0 - 1.0).
    pub master_phase_error_rate: f64,
    /// Seed for the fault generator, so runs are reproducible.
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            data_phase_error_rate: 0.0,
            master_phase_error_rate: 0.0,
            seed: 0,
        }
    }
}

impl FaultConfig {
    /// Create a fault config with no faults.
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Every commit fails while writing data pages.
    #[must_use]
    pub const fn fail_data_phase() -> Self {
        Self {
            data_phase_error_rate: 1.0,
            master_phase_error_rate: 0.0,
            seed: 0,
        }
    }

    /// Every commit writes its data pages and then fails to replace the
    /// master record.
    #[must_use]
    pub const fn fail_master_phase() -> Self {
        Self {
            data_phase_error_rate: 0.0,
            master_phase_error_rate: 1.0,
            seed: 0,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.data_phase_error_rate > 0.0 || self.master_phase_error_rate > 0.0
    }
}

/// The step of a commit at which a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    /// Copying pending pages into the file and syncing them.
    Data,
    /// Writing and syncing the master record.
    Master,
}

impl std::fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Master => write!(f, "master"),
        }
    }
}

/// Counters for injected faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub data_phase_faults: u64,
    pub master_phase_faults: u64,
}

/// Seeded source of commit faults.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultConfig,
    rng: StdRng,
    stats: FaultStats,
}

impl FaultInjector {
    #[must_use]
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(config.seed),
            stats: FaultStats::default(),
        }
    }

    /// Decide whether the given phase fails this time.
    pub fn should_fail(&mut self, phase: CommitPhase) -> bool {
        let rate = match phase {
            CommitPhase::Data => self.config.data_phase_error_rate,
            CommitPhase::Master => self.config.master_phase_error_rate,
        };
        if rate <= 0.0 || self.rng.random::<f64>() >= rate {
            return false;
        }
        match phase {
            CommitPhase::Data => self.stats.data_phase_faults += 1,
            CommitPhase::Master => self.stats.master_phase_faults += 1,
        }
        true
    }

    #[must_use]
    pub const fn stats(&self) -> FaultStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_faults_never_fails() {
        let mut injector = FaultInjector::new(FaultConfig::no_faults());
        for _ in 0..1000 {
            assert!(!injector.should_fail(CommitPhase::Data));
            assert!(!injector.should_fail(CommitPhase::Master));
        }
        assert_eq!(injector.stats(), FaultStats::default());
    }

    #[test]
    fn test_is_enabled() {
        assert!(!FaultConfig::no_faults().is_enabled());
        assert!(FaultConfig::fail_data_phase().is_enabled());
        assert!(FaultConfig::fail_master_phase().is_enabled());
    }

    #[test]
    fn test_certain_faults_always_fail() {
        let mut injector = FaultInjector::new(FaultConfig::fail_master_phase());
        assert!(!injector.should_fail(CommitPhase::Data));
        assert!(injector.should_fail(CommitPhase::Master));
        assert!(injector.should_fail(CommitPhase::Master));
        assert_eq!(injector.stats().master_phase_faults, 2);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let config = FaultConfig {
            data_phase_error_rate: 0.5,
            master_phase_error_rate: 0.0,
            seed: 99,
        };
        let mut a = FaultInjector::new(config);
        let mut b = FaultInjector::new(config);
        let run_a: Vec<bool> = (0..64).map(|_| a.should_fail(CommitPhase::Data)).collect();
        let run_b: Vec<bool> = (0..64).map(|_| b.should_fail(CommitPhase::Data)).collect();
        assert_eq!(run_a, run_b);
        assert!(run_a.iter().any(|&f| f));
        assert!(run_a.iter().any(|&f| !f));
    }
}
