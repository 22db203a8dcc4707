//! Synthetic node-failure injection.
//!
//! The injector owns its random generator and only produces decisions
//! (delays, victims); the server arms the corresponding call-me-later
//! timers and performs the kills.

use rand::prelude::*;
use rand_distr::{Distribution, Exp};
use rand_pcg::Pcg64;

use crate::config::sim_config::FailureConfig;

pub struct FailureInjector {
    rng: Pcg64,
    mtbf: Option<f64>,
    smtbf: Option<f64>,
    fixed_failures: Option<f64>,
    repair_time: f64,
    mttr: Option<f64>,
}

impl FailureInjector {
    pub fn new(config: &FailureConfig) -> FailureInjector {
        let rng = match config.seed_failures {
            Some(seed) => Pcg64::seed_from_u64(seed),
            None => Pcg64::from_entropy(),
        };
        FailureInjector {
            rng,
            mtbf: config.mtbf,
            smtbf: config.smtbf,
            fixed_failures: config.fixed_failures,
            repair_time: config.repair_time,
            mttr: config.mttr,
        }
    }

    pub fn mtbf_enabled(&self) -> bool {
        self.mtbf.is_some()
    }

    pub fn smtbf_enabled(&self) -> bool {
        self.smtbf.is_some()
    }

    pub fn fixed_enabled(&self) -> bool {
        self.fixed_failures.is_some()
    }

    /// Delay until the next MTBF job failure, Exp-distributed.
    pub fn next_mtbf_delay(&mut self) -> f64 {
        Self::exp_sample(&mut self.rng, self.mtbf.expect("MTBF mode is enabled"))
    }

    /// Delay until the next SMTBF machine failure, Exp-distributed.
    pub fn next_smtbf_delay(&mut self) -> f64 {
        Self::exp_sample(&mut self.rng, self.smtbf.expect("SMTBF mode is enabled"))
    }

    /// Constant period between fixed failures.
    pub fn next_fixed_delay(&self) -> f64 {
        self.fixed_failures.expect("fixed-failures mode is enabled")
    }

    /// Picks the victim machine uniformly among the compute machines.
    pub fn pick_machine(&mut self, nb_compute_machines: u32) -> u32 {
        self.rng.gen_range(0..nb_compute_machines.max(1))
    }

    /// How long the failed machine stays unavailable: the configured repair
    /// time, or Exp(MTTR) when a mean time to repair is set.
    pub fn repair_delay(&mut self) -> f64 {
        match self.mttr {
            Some(mttr) => Self::exp_sample(&mut self.rng, mttr),
            None => self.repair_time,
        }
    }

    fn exp_sample(rng: &mut Pcg64, mean: f64) -> f64 {
        match Exp::new(1.0 / mean) {
            Ok(dist) => dist.sample(rng),
            Err(_) => mean,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_seed(seed: u64) -> FailureConfig {
        FailureConfig {
            mtbf: Some(100.0),
            smtbf: Some(50.0),
            fixed_failures: Some(25.0),
            repair_time: 5.0,
            mttr: None,
            seed_failures: Some(seed),
        }
    }

    #[test]
    fn seeded_injectors_are_deterministic() {
        let mut a = FailureInjector::new(&config_with_seed(42));
        let mut b = FailureInjector::new(&config_with_seed(42));
        for _ in 0..10 {
            assert_eq!(a.next_mtbf_delay(), b.next_mtbf_delay());
            assert_eq!(a.pick_machine(16), b.pick_machine(16));
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = FailureInjector::new(&config_with_seed(1));
        let mut b = FailureInjector::new(&config_with_seed(2));
        let draws_a: Vec<f64> = (0..8).map(|_| a.next_smtbf_delay()).collect();
        let draws_b: Vec<f64> = (0..8).map(|_| b.next_smtbf_delay()).collect();
        assert_ne!(draws_a, draws_b);
    }

    #[test]
    fn fixed_delay_is_constant() {
        let injector = FailureInjector::new(&config_with_seed(7));
        assert_eq!(injector.next_fixed_delay(), 25.0);
    }

    #[test]
    fn repair_uses_fixed_time_without_mttr() {
        let mut injector = FailureInjector::new(&config_with_seed(7));
        assert_eq!(injector.repair_delay(), 5.0);
    }

    #[test]
    fn victims_stay_in_range() {
        let mut injector = FailureInjector::new(&config_with_seed(3));
        for _ in 0..100 {
            assert!(injector.pick_machine(4) < 4);
        }
    }
}
