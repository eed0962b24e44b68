// 库仑计数 SoC 估算
// Coulomb-counting SoC estimator with full/empty recalibration

use crate::config::ControlConfig;
use crate::interp::interpolate_linear;
use crate::types::round_to;

/// Result of one estimator update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocUpdate {
    /// Calibrated SoC in %, three decimals; unchanged on fault
    pub soc_calc: Option<f64>,
    /// True when the update could not run (missing or zero capacity,
    /// missing current) and a non-fatal diagnostic should be recorded
    pub fault: bool,
}

/// Integrates pack current against rated capacity and snaps the estimate
/// to 100 % / 0 % once the pack has demonstrably rested at a voltage
/// extreme for long enough.
#[derive(Debug, Clone, Default)]
pub struct SocEstimator {
    /// Remaining capacity in Ah; None until the first successful update
    capacity_remain: Option<f64>,
    last_update: Option<f64>,
    /// Running confirmation timer for the full/empty recalibration
    reset_start: Option<f64>,
    soc_calc: Option<f64>,
}

impl SocEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the estimate from an externally persisted SoC percentage.
    /// Only meaningful before the first update.
    pub fn restore_soc(&mut self, soc_calc: Option<f64>) {
        self.soc_calc = soc_calc;
    }

    pub fn soc_calc(&self) -> Option<f64> {
        self.soc_calc
    }

    /// Run one coulomb-counting step.
    ///
    /// # Arguments
    /// * `now` - Wall clock in epoch seconds
    /// * `current` - Pack current in A, positive while charging
    /// * `min_cell_v` / `max_cell_v` - Cell voltage extremes this cycle
    /// * `capacity_ah` - Rated capacity in Ah
    pub fn update(
        &mut self,
        now: f64,
        config: &ControlConfig,
        current: Option<f64>,
        min_cell_v: Option<f64>,
        max_cell_v: Option<f64>,
        capacity_ah: Option<f64>,
        soc_reported: Option<f64>,
    ) -> SocUpdate {
        let capacity = match capacity_ah {
            Some(c) if c > 0.0 => c,
            _ => {
                log::warn!("SoC update skipped: battery capacity is missing or zero");
                return SocUpdate { soc_calc: self.soc_calc, fault: true };
            }
        };

        match self.capacity_remain {
            None => {
                // first run: seed from the persisted estimate, the BMS
                // SoC, or assume full
                self.capacity_remain = Some(match (self.soc_calc, soc_reported) {
                    (Some(persisted), _) => {
                        log::debug!("SoC initialized from persisted state at {persisted}%");
                        capacity * persisted / 100.0
                    }
                    (None, Some(reported)) => {
                        log::debug!("SoC initialized from BMS at {reported}%");
                        capacity * reported / 100.0
                    }
                    (None, None) => {
                        log::debug!("SoC initialized and set to 100%");
                        capacity
                    }
                });
                self.last_update = Some(now);
            }
            Some(remain) => {
                let Some(raw_current) = current else {
                    log::warn!("SoC update skipped: pack current is missing");
                    self.last_update = Some(now);
                    return SocUpdate { soc_calc: self.soc_calc, fault: true };
                };
                let corrected = if config.soc_calc_current_correction() {
                    round_to(
                        interpolate_linear(
                            raw_current,
                            &config.soc_calc_current_reported_by_bms,
                            &config.soc_calc_current_measured_by_user,
                        ),
                        3,
                    )
                } else {
                    raw_current
                };

                let dt_hours = (now - self.last_update.unwrap_or(now)) / 3600.0;
                let integrated = (remain + corrected * dt_hours).clamp(0.0, capacity);
                self.capacity_remain = Some(integrated);
                self.last_update = Some(now);

                // full-pack recalibration keys off the highest cell so an
                // unbalanced pack can still reach 100%
                if max_cell_v.is_some_and(|v| v >= config.max_cell_voltage) {
                    if raw_current < config.soc_reset_current && self.reset_start.is_some() {
                        let start = self.reset_start.unwrap_or(now);
                        if now - start > config.soc_reset_time
                            && self.soc_calc.is_some_and(|s| s.round() != 100.0)
                        {
                            log::info!("SoC set to 100%");
                            self.capacity_remain = Some(capacity);
                            self.reset_start = None;
                        }
                    } else {
                        self.reset_start = Some(now);
                    }
                }

                // empty-pack recalibration keys off the lowest cell
                if min_cell_v.is_some_and(|v| v <= config.min_cell_voltage) {
                    if raw_current < 0.0 && self.reset_start.is_some() {
                        let start = self.reset_start.unwrap_or(now);
                        if now - start > config.soc_reset_time
                            && self.soc_calc.is_some_and(|s| s.round() != 0.0)
                        {
                            log::info!("SoC set to 0%");
                            self.capacity_remain = Some(0.0);
                            self.reset_start = None;
                        }
                    } else {
                        self.reset_start = Some(now);
                    }
                }
            }
        }

        let remain = self.capacity_remain.unwrap_or(0.0);
        self.soc_calc = Some(round_to((remain / capacity * 100.0).clamp(0.0, 100.0), 3));
        SocUpdate { soc_calc: self.soc_calc, fault: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: f64 = 100.0;

    fn config() -> ControlConfig {
        ControlConfig::default()
    }

    fn idle_update(est: &mut SocEstimator, config: &ControlConfig, now: f64, amps: f64) -> SocUpdate {
        est.update(now, config, Some(amps), Some(3.2), Some(3.3), Some(CAP), Some(50.0))
    }

    #[test]
    fn seeds_from_reported_soc_then_integrates() {
        let config = config();
        let mut est = SocEstimator::new();
        let first = idle_update(&mut est, &config, 0.0, 0.0);
        assert_eq!(first.soc_calc, Some(50.0));
        assert!(!first.fault);

        // one hour at -10 A on a 100 Ah pack: 10 percentage points down
        let second = idle_update(&mut est, &config, 3600.0, -10.0);
        assert_eq!(second.soc_calc, Some(40.0));
    }

    #[test]
    fn seeds_from_persisted_state_over_bms() {
        let config = config();
        let mut est = SocEstimator::new();
        est.restore_soc(Some(73.5));
        let first = idle_update(&mut est, &config, 0.0, 0.0);
        assert_eq!(first.soc_calc, Some(73.5));
    }

    #[test]
    fn seeds_full_without_any_soc_source() {
        let config = config();
        let mut est = SocEstimator::new();
        let update = est.update(0.0, &config, Some(0.0), None, None, Some(CAP), None);
        assert_eq!(update.soc_calc, Some(100.0));
    }

    #[test]
    fn zero_current_ticks_leave_soc_unchanged() {
        let config = config();
        let mut est = SocEstimator::new();
        idle_update(&mut est, &config, 0.0, 0.0);
        for i in 1..200 {
            let update = idle_update(&mut est, &config, i as f64 * 7.0, 0.0);
            assert_eq!(update.soc_calc, Some(50.0));
        }
    }

    #[test]
    fn constant_discharge_matches_coulomb_math() {
        let config = config();
        let mut est = SocEstimator::new();
        idle_update(&mut est, &config, 0.0, 0.0);
        // 20 A discharge for 900 s: 20*900/(100*36) = 5 percentage points
        let mut update = SocUpdate { soc_calc: None, fault: false };
        for i in 1..=900 {
            update = idle_update(&mut est, &config, i as f64, -20.0);
        }
        assert_eq!(update.soc_calc, Some(45.0));
    }

    #[test]
    fn integration_clamps_at_capacity() {
        let config = config();
        let mut est = SocEstimator::new();
        let mut update = est.update(0.0, &config, Some(0.0), Some(3.2), Some(3.3), Some(CAP), Some(99.0));
        for i in 1..=7200 {
            update = est.update(i as f64, &config, Some(50.0), Some(3.2), Some(3.3), Some(CAP), Some(99.0));
        }
        assert_eq!(update.soc_calc, Some(100.0));
    }

    #[test]
    fn full_recalibration_requires_continuous_hold() {
        let config = config();
        let mut est = SocEstimator::new();
        est.update(0.0, &config, Some(0.0), Some(3.40), Some(3.30), Some(CAP), Some(90.0));

        // cell at the ceiling with low current: timer starts on the first
        // cycle, soc must not snap before soc_reset_time has elapsed
        let mut t = 1.0;
        let full = |est: &mut SocEstimator, t: f64, amps: f64| {
            est.update(t, &config, Some(amps), Some(3.40), Some(3.46), Some(CAP), Some(90.0))
        };
        let mut update = full(&mut est, t, 1.0);
        for _ in 0..30 {
            t += 1.0;
            update = full(&mut est, t, 1.0);
        }
        assert!(update.soc_calc.unwrap() < 100.0);

        // a single high-current spike restarts the wait
        t += 1.0;
        full(&mut est, t, 40.0);
        for _ in 0..45 {
            t += 1.0;
            update = full(&mut est, t, 1.0);
        }
        // 45 s < soc_reset_time (60 s) since the spike: still not full
        assert!(update.soc_calc.unwrap() < 100.0);

        for _ in 0..20 {
            t += 1.0;
            update = full(&mut est, t, 1.0);
        }
        // held continuously past the confirmation window
        assert_eq!(update.soc_calc, Some(100.0));
    }

    #[test]
    fn empty_recalibration_snaps_to_zero() {
        let config = config();
        let mut est = SocEstimator::new();
        est.update(0.0, &config, Some(0.0), Some(3.0), Some(3.1), Some(CAP), Some(10.0));

        let mut update = SocUpdate { soc_calc: None, fault: false };
        for i in 1..=70 {
            update = est.update(
                i as f64,
                &config,
                Some(-3.0),
                Some(2.79),
                Some(3.0),
                Some(CAP),
                Some(10.0),
            );
        }
        assert_eq!(update.soc_calc, Some(0.0));
    }

    #[test]
    fn missing_capacity_reports_fault_and_keeps_soc() {
        let config = config();
        let mut est = SocEstimator::new();
        idle_update(&mut est, &config, 0.0, 0.0);

        let update = est.update(1.0, &config, Some(5.0), Some(3.2), Some(3.3), None, Some(50.0));
        assert!(update.fault);
        assert_eq!(update.soc_calc, Some(50.0));

        let update = est.update(2.0, &config, Some(5.0), Some(3.2), Some(3.3), Some(0.0), Some(50.0));
        assert!(update.fault);
        assert_eq!(update.soc_calc, Some(50.0));
    }

    #[test]
    fn current_correction_table_is_applied() {
        let mut config = config();
        config.soc_calc_current_reported_by_bms = vec![-300.0, 0.0, 300.0];
        config.soc_calc_current_measured_by_user = vec![-300.0, 0.0, 150.0];
        let mut est = SocEstimator::new();
        idle_update(&mut est, &config, 0.0, 0.0);
        // BMS reports 20 A but the table halves positive currents
        let update = est.update(3600.0, &config, Some(20.0), Some(3.2), Some(3.3), Some(CAP), Some(50.0));
        assert_eq!(update.soc_calc, Some(60.0));
    }
}
