use crate::config::BudgetConfig;
use crate::telemetry::logging;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic nanosecond source used to measure batch cost.
pub trait Clock {
    fn now_nanos(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadLevel {
    Healthy,
    Degraded,
    Critical,
}

/// Per-tick controller state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSample {
    pub tick: u64,
    pub load: f64,
    pub level: LoadLevel,
    pub budget_nanos: i64,
    pub spent_nanos: i64,
}

/// Derives the per-tick mutation budget from the host load metric and tracks
/// spend against it. Spend resets exactly once per new tick id.
#[derive(Debug)]
pub struct BudgetController {
    config: BudgetConfig,
    sample: Option<BudgetSample>,
}

impl BudgetController {
    pub fn new(config: BudgetConfig) -> Self {
        BudgetController {
            config,
            sample: None,
        }
    }

    /// Budget for `tick`. The first call for a new tick id samples the load,
    /// recomputes the budget and zeroes the spend; repeat calls within the same
    /// tick return the same budget without resampling.
    pub fn current_budget_nanos(&mut self, tick: u64, sample_load: impl FnOnce() -> f64) -> i64 {
        if let Some(sample) = self.sample.as_ref() {
            if sample.tick == tick {
                return sample.budget_nanos;
            }
        }
        let load = sample_load();
        let (level, budget_nanos) = self.classify(load);
        if let Some(previous) = self.sample.as_ref() {
            if previous.level != level {
                logging::log_lag(&format!(
                    "load {:.2} ({:?} -> {:?}), budget {} ns",
                    load, previous.level, level, budget_nanos
                ));
            }
        }
        self.sample = Some(BudgetSample {
            tick,
            load,
            level,
            budget_nanos,
            spent_nanos: 0,
        });
        budget_nanos
    }

    pub fn record_spend(&mut self, nanos: u64) {
        if let Some(sample) = self.sample.as_mut() {
            let nanos = i64::try_from(nanos).unwrap_or(i64::MAX);
            sample.spent_nanos = sample.spent_nanos.saturating_add(nanos);
        }
    }

    pub fn remaining_nanos(&self) -> i64 {
        self.sample
            .map(|sample| sample.budget_nanos - sample.spent_nanos)
            .unwrap_or(0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_nanos() <= 0
    }

    pub fn sample(&self) -> Option<&BudgetSample> {
        self.sample.as_ref()
    }

    /// Step function from load to budget. Never returns less than 1 ns.
    pub fn budget_for_load(&self, load: f64) -> i64 {
        self.classify(load).1
    }

    fn classify(&self, load: f64) -> (LoadLevel, i64) {
        let ratio = if load.is_finite() && self.config.nominal_load > 0.0 {
            load / self.config.nominal_load
        } else {
            0.0
        };
        let (level, nanos) = if ratio >= self.config.healthy_ratio {
            (LoadLevel::Healthy, self.config.full_nanos)
        } else if ratio >= self.config.degraded_ratio {
            (LoadLevel::Degraded, self.config.reduced_nanos)
        } else {
            (LoadLevel::Critical, self.config.minimal_nanos)
        };
        (level, nanos.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BudgetController {
        BudgetController::new(BudgetConfig::default())
    }

    #[test]
    fn step_function_levels() {
        let budget = controller();
        let config = BudgetConfig::default();
        assert_eq!(budget.budget_for_load(20.0), config.full_nanos);
        assert_eq!(budget.budget_for_load(19.5), config.full_nanos);
        assert_eq!(budget.budget_for_load(25.0), config.full_nanos);
        assert_eq!(budget.budget_for_load(19.4), config.reduced_nanos);
        assert_eq!(budget.budget_for_load(15.0), config.reduced_nanos);
        assert_eq!(budget.budget_for_load(14.9), config.minimal_nanos);
        assert_eq!(budget.budget_for_load(0.0), config.minimal_nanos);
        assert_eq!(budget.budget_for_load(f64::NAN), config.minimal_nanos);
    }

    #[test]
    fn never_zero() {
        let budget = BudgetController::new(BudgetConfig {
            minimal_nanos: 0,
            ..BudgetConfig::default()
        });
        assert_eq!(budget.budget_for_load(1.0), 1);
    }

    #[test]
    fn spend_resets_once_per_tick() {
        let mut budget = controller();
        let full = budget.current_budget_nanos(1, || 20.0);
        budget.record_spend(10_000_000);
        assert_eq!(budget.remaining_nanos(), full - 10_000_000);

        let mut resampled = false;
        assert_eq!(budget.current_budget_nanos(1, || { resampled = true; 1.0 }), full);
        assert!(!resampled);
        assert_eq!(budget.remaining_nanos(), full - 10_000_000);

        budget.current_budget_nanos(2, || 20.0);
        assert_eq!(budget.remaining_nanos(), full);
    }

    #[test]
    fn exhaustion_within_tick() {
        let mut budget = controller();
        budget.current_budget_nanos(7, || 20.0);
        assert!(!budget.is_exhausted());
        budget.record_spend(25_000_000);
        assert!(budget.is_exhausted());
        budget.current_budget_nanos(8, || 20.0);
        assert!(!budget.is_exhausted());
    }

    #[test]
    fn recovers_immediately_when_load_returns() {
        let mut budget = controller();
        let config = BudgetConfig::default();
        assert_eq!(budget.current_budget_nanos(1, || 5.0), config.minimal_nanos);
        assert_eq!(budget.current_budget_nanos(2, || 20.0), config.full_nanos);
        assert_eq!(budget.sample().map(|s| s.level), Some(LoadLevel::Healthy));
    }

    #[test]
    fn manual_clock_is_shared() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(250);
        assert_eq!(other.now_nanos(), 250);
    }
}
