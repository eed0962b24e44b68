// 充放电电流限制
// CCL/DCL from multiple derating sources, with anti-flapping commit rules

use crate::config::ControlConfig;
use crate::interp::{interpolate_linear, interpolate_step};
use crate::types::{round_to, PackSnapshot};

/// Result of one limiter update.
#[derive(Debug, Clone)]
pub struct CurrentLimits {
    /// Committed CCL in A, >= 0
    pub control_charge_current: Option<f64>,
    /// Committed DCL in A, >= 0
    pub control_discharge_current: Option<f64>,
    /// Source(s) of the committed CCL
    pub charge_limitation: String,
    /// Source(s) of the committed DCL
    pub discharge_limitation: String,
    pub allow_to_charge: bool,
    pub allow_to_discharge: bool,
    /// A derating source could not be evaluated and fell back to the maximum
    pub fault: bool,
}

/// Candidate limits keyed by value so sources producing the same limit
/// share one attribution label.
struct Candidates {
    entries: Vec<(f64, String)>,
    base_label: &'static str,
}

impl Candidates {
    fn new(maximum: f64, base_label: &'static str) -> Self {
        Self { entries: vec![(maximum, base_label.to_string())], base_label }
    }

    fn add(&mut self, value: f64, label: &str) {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(v, _)| *v == value) {
            // the base maximum keeps its own label
            if existing != self.base_label {
                existing.push_str(", ");
                existing.push_str(label);
            }
        } else {
            self.entries.push((value, label.to_string()));
        }
    }

    /// The most restrictive candidate and its label.
    fn winner(&self) -> (f64, &str) {
        self.entries
            .iter()
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(v, l)| (*v, l.as_str()))
            .unwrap_or((0.0, "BMS"))
    }
}

/// One direction of the limiter; charge and discharge are fully
/// independent instances of the same commit logic.
#[derive(Debug, Clone, Default)]
struct DirectionState {
    committed: Option<f64>,
    limitation: String,
    last_set: Option<f64>,
}

impl DirectionState {
    /// Commit `candidate` according to the anti-flapping rules: only after
    /// the recalculation interval, on a drop to zero, or on a change larger
    /// than the configured percentage. Recovery from a held zero must clear
    /// the recovery threshold, otherwise the limit stays at zero and the
    /// label gets a marker.
    fn commit(
        &mut self,
        now: f64,
        candidate: f64,
        label: &str,
        configured_max: f64,
        recovery_threshold: f64,
        config: &ControlConfig,
    ) {
        let diff = self.committed.map_or(0.0, |c| (c - candidate).abs());
        let due = match self.last_set {
            None => true,
            Some(last) => now - last >= config.linear_recalculation_every,
        };
        let perc_change = self.committed.is_some_and(|c| {
            diff >= c * config.linear_recalculation_on_perc_change / 100.0
        });
        let drops_to_zero = candidate == 0.0 && self.committed != Some(0.0);

        if !(due || perc_change || drops_to_zero) {
            return;
        }
        self.last_set = Some(now);

        if candidate == 0.0 {
            self.committed = Some(0.0);
            self.limitation = label.to_string();
        } else if self.committed == Some(0.0) && candidate < configured_max * recovery_threshold {
            // held at zero: recovery needs headroom above the threshold
            self.limitation = format!("{label} *");
        } else {
            self.committed = Some(candidate);
            self.limitation = label.to_string();
        }
    }
}

/// Computes CCL and DCL every cycle from the configured maximum, the BMS
/// settings and the enabled derating tables.
#[derive(Debug, Clone, Default)]
pub struct CurrentLimiter {
    charge: DirectionState,
    discharge: DirectionState,
}

impl CurrentLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one limiter cycle.
    pub fn update(
        &mut self,
        now: f64,
        config: &ControlConfig,
        snapshot: &PackSnapshot,
        soc_calc: Option<f64>,
    ) -> CurrentLimits {
        let mut fault = false;

        // ---------- charge direction ----------
        let charge_effective_max = snapshot
            .bms_charge_current_limit
            .filter(|l| *l < config.max_battery_charge_current)
            .unwrap_or(config.max_battery_charge_current);
        let mut charge =
            Candidates::new(config.max_battery_charge_current, "Max Battery Charge Current");
        if charge_effective_max < config.max_battery_charge_current {
            charge.add(charge_effective_max, "BMS Settings");
        }

        if config.cccm_cv_enable {
            let limit = match snapshot.max_cell_voltage() {
                Some(v) => {
                    config.max_battery_charge_current
                        * evaluate(
                            config,
                            v,
                            &config.cell_voltages_while_charging,
                            &config.max_charge_current_cv_fraction,
                            false,
                        )
                }
                None => {
                    log::warn!("charge derating: max cell voltage unknown, using default current");
                    charge_effective_max
                }
            };
            if limit != charge_effective_max {
                charge.add(limit, "Cell Voltage");
            }
        }

        if config.cccm_t_enable {
            let limit = match self.temperature_limit(
                config,
                snapshot,
                &config.temperatures_while_charging,
                &config.max_charge_current_t_fraction,
                config.max_battery_charge_current,
                false,
            ) {
                Some(l) => l,
                None => {
                    log::warn!("charge derating: temperature unknown, using default current");
                    charge_effective_max
                }
            };
            if limit != charge_effective_max {
                charge.add(limit, "Temp");
            }
        }

        if config.cccm_soc_enable {
            let limit = match soc_calc {
                Some(soc) => {
                    config.max_battery_charge_current
                        * evaluate(
                            config,
                            soc,
                            &config.soc_while_charging,
                            &config.max_charge_current_soc_fraction,
                            true,
                        )
                }
                None => {
                    log::error!("charge derating: SoC unknown, using default current");
                    fault = true;
                    charge_effective_max
                }
            };
            if limit != charge_effective_max {
                charge.add(limit, "SoC");
            }
        }

        if snapshot.charge_fet == Some(false) || snapshot.blocked {
            charge.add(0.0, "BMS");
        }

        let (ccl, charge_label) = charge.winner();
        self.charge.commit(
            now,
            round_to(ccl, 3),
            charge_label,
            config.max_battery_charge_current,
            config.charge_current_recovery_threshold,
            config,
        );

        // ---------- discharge direction ----------
        let discharge_effective_max = snapshot
            .bms_discharge_current_limit
            .filter(|l| *l < config.max_battery_discharge_current)
            .unwrap_or(config.max_battery_discharge_current);
        let mut discharge = Candidates::new(
            config.max_battery_discharge_current,
            "Max Battery Discharge Current",
        );
        if discharge_effective_max < config.max_battery_discharge_current {
            discharge.add(discharge_effective_max, "BMS Settings");
        }

        if config.dccm_cv_enable {
            let limit = match snapshot.min_cell_voltage() {
                Some(v) => {
                    config.max_battery_discharge_current
                        * evaluate(
                            config,
                            v,
                            &config.cell_voltages_while_discharging,
                            &config.max_discharge_current_cv_fraction,
                            true,
                        )
                }
                None => {
                    log::warn!("discharge derating: min cell voltage unknown, using default current");
                    discharge_effective_max
                }
            };
            if limit != discharge_effective_max {
                discharge.add(limit, "Cell Voltage");
            }
        }

        if config.dccm_t_enable {
            let limit = match self.temperature_limit(
                config,
                snapshot,
                &config.temperatures_while_discharging,
                &config.max_discharge_current_t_fraction,
                config.max_battery_discharge_current,
                true,
            ) {
                Some(l) => l,
                None => {
                    log::warn!("discharge derating: temperature unknown, using default current");
                    discharge_effective_max
                }
            };
            if limit != discharge_effective_max {
                discharge.add(limit, "Temp");
            }
        }

        if config.dccm_soc_enable {
            let limit = match soc_calc {
                Some(soc) => {
                    config.max_battery_discharge_current
                        * evaluate(
                            config,
                            soc,
                            &config.soc_while_discharging,
                            &config.max_discharge_current_soc_fraction,
                            true,
                        )
                }
                None => {
                    log::error!("discharge derating: SoC unknown, using default current");
                    fault = true;
                    discharge_effective_max
                }
            };
            if limit != discharge_effective_max {
                discharge.add(limit, "SoC");
            }
        }

        if snapshot.discharge_fet == Some(false) || snapshot.blocked {
            discharge.add(0.0, "BMS");
        }

        let (dcl, discharge_label) = discharge.winner();
        self.discharge.commit(
            now,
            round_to(dcl, 3),
            discharge_label,
            config.max_battery_discharge_current,
            config.discharge_current_recovery_threshold,
            config,
        );

        CurrentLimits {
            control_charge_current: self.charge.committed,
            control_discharge_current: self.discharge.committed,
            charge_limitation: self.charge.limitation.clone(),
            discharge_limitation: self.discharge.limitation.clone(),
            allow_to_charge: self.charge.committed.map_or(true, |c| c != 0.0),
            allow_to_discharge: self.discharge.committed.map_or(true, |c| c != 0.0),
            fault,
        }
    }

    /// Temperature tables are evaluated for the hottest and the coldest
    /// sensor independently; the stricter result wins.
    fn temperature_limit(
        &self,
        config: &ControlConfig,
        snapshot: &PackSnapshot,
        temps_table: &[f64],
        fractions: &[f64],
        maximum: f64,
        step_prefer_lower: bool,
    ) -> Option<f64> {
        let hot = snapshot.max_temp()?;
        let cold = snapshot.min_temp()?;
        let at_hot = evaluate(config, hot, temps_table, fractions, step_prefer_lower);
        let at_cold = evaluate(config, cold, temps_table, fractions, step_prefer_lower);
        Some(maximum * at_hot.min(at_cold))
    }
}

fn evaluate(
    config: &ControlConfig,
    x: f64,
    xs: &[f64],
    ys: &[f64],
    step_prefer_lower: bool,
) -> f64 {
    if config.linear_limitation_enable {
        interpolate_linear(x, xs, ys)
    } else {
        interpolate_step(x, xs, ys, step_prefer_lower)
    }
}
