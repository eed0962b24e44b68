// 控制核心配置
// All constants the control core consults, validated once at startup

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Startup-time configuration problems. None of these prevent the core
/// from running; the external layer decides whether to force a blocked
/// state instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigIssue {
    #[error("FLOAT_CELL_VOLTAGE ({float} V) is greater than MAX_CELL_VOLTAGE ({max} V); float voltage was clamped to the maximum")]
    FloatAboveMax { float: f64, max: f64 },
    #[error("FLOAT_CELL_VOLTAGE ({float} V) is less than MIN_CELL_VOLTAGE ({min} V); float voltage was raised to the minimum")]
    FloatBelowMin { float: f64, min: f64 },
    #[error("SOC_RESET_VOLTAGE ({reset} V) is less than MAX_CELL_VOLTAGE ({max} V); reset voltage was raised to the maximum")]
    SocResetBelowMax { reset: f64, max: f64 },
    #[error("breakpoint table {table} and its output table differ in length ({inputs} vs {outputs})")]
    TableLengthMismatch { table: &'static str, inputs: usize, outputs: usize },
    #[error("breakpoint table {table} is empty")]
    EmptyTable { table: &'static str },
    #[error("no fraction in {table} is 1.0, the configured maximum current can never be used")]
    MaxCurrentUnreachable { table: &'static str },
    #[error("highest charge breakpoint ({breakpoint} V) is below the target ceiling ({ceiling} V); the ceiling can never be reached and the battery will not change to float")]
    ChargeCeilingUnreachable { breakpoint: f64, ceiling: f64 },
    #[error("lowest discharge breakpoint ({breakpoint} V) is above MIN_CELL_VOLTAGE ({min} V); the minimum cell voltage can never be reached")]
    DischargeFloorUnreachable { breakpoint: f64, min: f64 },
}

/// Immutable configuration for one battery, passed into every component.
///
/// Current tables hold fractions of the respective configured maximum
/// (0.0 .. 1.0), scaled at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    // --------- Battery current limits ---------
    pub max_battery_charge_current: f64,
    pub max_battery_discharge_current: f64,

    // --------- Cell voltages ---------
    pub min_cell_voltage: f64,
    pub max_cell_voltage: f64,
    pub float_cell_voltage: f64,

    // --------- SoC reset cycle (must match BMS settings) ---------
    pub soc_reset_voltage: f64,
    /// Request a reset-voltage charge cycle every this many days; None disables it
    pub soc_reset_after_days: Option<f64>,

    // --------- SoC calculation ---------
    /// Use the coulomb-counting estimator instead of the BMS-reported SoC
    pub soc_calculation: bool,
    /// Current below which the pack counts as resting at full charge, in A
    pub soc_reset_current: f64,
    /// Seconds the full/empty condition must hold before SoC snaps
    pub soc_reset_time: f64,
    /// Current correction table: current as reported by the BMS ...
    pub soc_calc_current_reported_by_bms: Vec<f64>,
    /// ... versus the current actually measured by the user
    pub soc_calc_current_measured_by_user: Vec<f64>,

    // --------- Charge voltage management (CVL) ---------
    pub cvcm_enable: bool,
    pub cell_voltage_diff_keep_max_voltage_until: f64,
    pub cell_voltage_diff_keep_max_voltage_time_restart: f64,
    pub cell_voltage_diff_to_reset_voltage_limit: f64,
    pub max_voltage_time_sec: f64,
    pub soc_level_to_reset_voltage_limit: f64,
    pub cvl_icontroller_mode: bool,
    pub cvl_icontroller_factor: f64,

    // --------- Linear vs step mode and anti-flapping ---------
    pub linear_limitation_enable: bool,
    /// Commit a new limit at most once per this many seconds
    pub linear_recalculation_every: f64,
    /// ... unless it changed by more than this percentage
    pub linear_recalculation_on_perc_change: f64,

    // --------- Current derating from cell voltage ---------
    pub cccm_cv_enable: bool,
    pub dccm_cv_enable: bool,
    pub cell_voltages_while_charging: Vec<f64>,
    pub max_charge_current_cv_fraction: Vec<f64>,
    pub cell_voltages_while_discharging: Vec<f64>,
    pub max_discharge_current_cv_fraction: Vec<f64>,

    // --------- Current derating from temperature ---------
    pub cccm_t_enable: bool,
    pub dccm_t_enable: bool,
    pub temperatures_while_charging: Vec<f64>,
    pub max_charge_current_t_fraction: Vec<f64>,
    pub temperatures_while_discharging: Vec<f64>,
    pub max_discharge_current_t_fraction: Vec<f64>,

    // --------- Current derating from SoC ---------
    pub cccm_soc_enable: bool,
    pub dccm_soc_enable: bool,
    pub soc_while_charging: Vec<f64>,
    pub max_charge_current_soc_fraction: Vec<f64>,
    pub soc_while_discharging: Vec<f64>,
    pub max_discharge_current_soc_fraction: Vec<f64>,

    // --------- Zero-limit recovery thresholds (fractions of the maximum) ---------
    pub charge_current_recovery_threshold: f64,
    pub discharge_current_recovery_threshold: f64,

    // --------- SoC alarm levels ---------
    pub soc_low_warning: f64,
    pub soc_low_alarm: f64,

    /// Expected voltage drop between battery terminals and measurement, in V
    pub voltage_drop: f64,
    /// Build the multi-line CVL decision breakdown every cycle
    pub show_debug_info: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_battery_charge_current: 50.0,
            max_battery_discharge_current: 60.0,
            min_cell_voltage: 2.80,
            max_cell_voltage: 3.45,
            float_cell_voltage: 3.38,
            soc_reset_voltage: 3.65,
            soc_reset_after_days: None,
            soc_calculation: true,
            soc_reset_current: 5.0,
            soc_reset_time: 60.0,
            soc_calc_current_reported_by_bms: vec![-300.0, 300.0],
            soc_calc_current_measured_by_user: vec![-300.0, 300.0],
            cvcm_enable: true,
            cell_voltage_diff_keep_max_voltage_until: 0.010,
            cell_voltage_diff_keep_max_voltage_time_restart: 0.015,
            cell_voltage_diff_to_reset_voltage_limit: 0.080,
            max_voltage_time_sec: 900.0,
            soc_level_to_reset_voltage_limit: 90.0,
            cvl_icontroller_mode: false,
            cvl_icontroller_factor: 0.2,
            linear_limitation_enable: true,
            linear_recalculation_every: 60.0,
            linear_recalculation_on_perc_change: 5.0,
            cccm_cv_enable: true,
            dccm_cv_enable: true,
            cell_voltages_while_charging: vec![3.55, 3.50, 3.45, 3.30],
            max_charge_current_cv_fraction: vec![0.0, 0.05, 0.5, 1.0],
            cell_voltages_while_discharging: vec![2.70, 2.80, 2.90, 3.10],
            max_discharge_current_cv_fraction: vec![0.0, 0.1, 0.5, 1.0],
            cccm_t_enable: true,
            dccm_t_enable: true,
            temperatures_while_charging: vec![0.0, 2.0, 5.0, 10.0, 15.0, 20.0, 35.0, 40.0, 55.0],
            max_charge_current_t_fraction: vec![0.0, 0.1, 0.2, 0.4, 0.8, 1.0, 1.0, 0.4, 0.0],
            temperatures_while_discharging: vec![-20.0, 0.0, 5.0, 10.0, 15.0, 45.0, 55.0],
            max_discharge_current_t_fraction: vec![0.0, 0.25, 0.5, 0.75, 1.0, 1.0, 0.0],
            cccm_soc_enable: false,
            dccm_soc_enable: false,
            soc_while_charging: vec![100.0, 99.0, 95.0, 90.0],
            max_charge_current_soc_fraction: vec![0.18, 0.05, 0.5, 1.0],
            soc_while_discharging: vec![35.0, 30.0, 20.0, 10.0],
            max_discharge_current_soc_fraction: vec![1.0, 0.5, 0.25, 0.0],
            charge_current_recovery_threshold: 0.01,
            discharge_current_recovery_threshold: 0.01,
            soc_low_warning: 20.0,
            soc_low_alarm: 10.0,
            voltage_drop: 0.0,
            show_debug_info: false,
        }
    }
}

impl ControlConfig {
    /// Validate the configuration and fix the misconfigurations the core
    /// cannot safely run with. Returns the full issue list; the config is
    /// usable afterwards regardless.
    pub fn sanitize(&mut self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.float_cell_voltage > self.max_cell_voltage {
            issues.push(ConfigIssue::FloatAboveMax {
                float: self.float_cell_voltage,
                max: self.max_cell_voltage,
            });
            self.float_cell_voltage = self.max_cell_voltage;
        } else if self.float_cell_voltage < self.min_cell_voltage {
            issues.push(ConfigIssue::FloatBelowMin {
                float: self.float_cell_voltage,
                min: self.min_cell_voltage,
            });
            self.float_cell_voltage = self.min_cell_voltage;
        }

        if self.soc_reset_after_days.is_some() && self.soc_reset_voltage < self.max_cell_voltage {
            issues.push(ConfigIssue::SocResetBelowMax {
                reset: self.soc_reset_voltage,
                max: self.max_cell_voltage,
            });
            self.soc_reset_voltage = self.max_cell_voltage;
        }

        self.check_table(
            &mut issues,
            "CELL_VOLTAGES_WHILE_CHARGING",
            |c| (&c.cell_voltages_while_charging, &c.max_charge_current_cv_fraction),
        );
        self.check_table(
            &mut issues,
            "CELL_VOLTAGES_WHILE_DISCHARGING",
            |c| (&c.cell_voltages_while_discharging, &c.max_discharge_current_cv_fraction),
        );
        self.check_table(
            &mut issues,
            "TEMPERATURES_WHILE_CHARGING",
            |c| (&c.temperatures_while_charging, &c.max_charge_current_t_fraction),
        );
        self.check_table(
            &mut issues,
            "TEMPERATURES_WHILE_DISCHARGING",
            |c| (&c.temperatures_while_discharging, &c.max_discharge_current_t_fraction),
        );
        self.check_table(&mut issues, "SOC_WHILE_CHARGING", |c| {
            (&c.soc_while_charging, &c.max_charge_current_soc_fraction)
        });
        self.check_table(&mut issues, "SOC_WHILE_DISCHARGING", |c| {
            (&c.soc_while_discharging, &c.max_discharge_current_soc_fraction)
        });

        // a charge table whose highest breakpoint sits below the ceiling
        // derates to zero before the ceiling is reached: float is never entered
        if self.cccm_cv_enable {
            let highest = self
                .cell_voltages_while_charging
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            let ceiling_fraction = highest_breakpoint_fraction(
                &self.cell_voltages_while_charging,
                &self.max_charge_current_cv_fraction,
            );
            if highest < self.max_cell_voltage && ceiling_fraction == Some(0.0) {
                issues.push(ConfigIssue::ChargeCeilingUnreachable {
                    breakpoint: highest,
                    ceiling: self.max_cell_voltage,
                });
            }
            if self.soc_reset_after_days.is_some()
                && highest < self.soc_reset_voltage
                && ceiling_fraction == Some(0.0)
            {
                issues.push(ConfigIssue::ChargeCeilingUnreachable {
                    breakpoint: highest,
                    ceiling: self.soc_reset_voltage,
                });
            }
        }

        if self.dccm_cv_enable {
            let lowest = self
                .cell_voltages_while_discharging
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min);
            let floor_fraction = lowest_breakpoint_fraction(
                &self.cell_voltages_while_discharging,
                &self.max_discharge_current_cv_fraction,
            );
            if lowest > self.min_cell_voltage && floor_fraction == Some(0.0) {
                issues.push(ConfigIssue::DischargeFloorUnreachable {
                    breakpoint: lowest,
                    min: self.min_cell_voltage,
                });
            }
        }

        issues
    }

    fn check_table(
        &self,
        issues: &mut Vec<ConfigIssue>,
        table: &'static str,
        select: impl Fn(&Self) -> (&Vec<f64>, &Vec<f64>),
    ) {
        let (inputs, outputs) = select(self);
        if inputs.is_empty() {
            issues.push(ConfigIssue::EmptyTable { table });
            return;
        }
        if inputs.len() != outputs.len() {
            issues.push(ConfigIssue::TableLengthMismatch {
                table,
                inputs: inputs.len(),
                outputs: outputs.len(),
            });
            return;
        }
        if !outputs.iter().any(|f| *f == 1.0) {
            issues.push(ConfigIssue::MaxCurrentUnreachable { table });
        }
    }

    /// True if a current correction has to be applied before coulomb counting.
    pub fn soc_calc_current_correction(&self) -> bool {
        self.soc_calc_current_reported_by_bms != self.soc_calc_current_measured_by_user
            && !self.soc_calc_current_reported_by_bms.is_empty()
            && self.soc_calc_current_reported_by_bms.len()
                == self.soc_calc_current_measured_by_user.len()
    }
}

/// Output fraction at the highest input breakpoint.
fn highest_breakpoint_fraction(xs: &[f64], ys: &[f64]) -> Option<f64> {
    xs.iter()
        .zip(ys)
        .max_by(|a, b| a.0.total_cmp(b.0))
        .map(|(_, y)| *y)
}

/// Output fraction at the lowest input breakpoint.
fn lowest_breakpoint_fraction(xs: &[f64], ys: &[f64]) -> Option<f64> {
    xs.iter()
        .zip(ys)
        .min_by(|a, b| a.0.total_cmp(b.0))
        .map(|(_, y)| *y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_clean() {
        let mut config = ControlConfig::default();
        assert!(config.sanitize().is_empty());
    }

    #[test]
    fn float_voltage_above_max_is_clamped() {
        let mut config = ControlConfig {
            float_cell_voltage: 3.50,
            ..Default::default()
        };
        let issues = config.sanitize();
        assert_eq!(
            issues,
            vec![ConfigIssue::FloatAboveMax { float: 3.50, max: 3.45 }]
        );
        assert_eq!(config.float_cell_voltage, 3.45);
    }

    #[test]
    fn soc_reset_voltage_below_max_is_raised() {
        let mut config = ControlConfig {
            soc_reset_after_days: Some(30.0),
            soc_reset_voltage: 3.40,
            ..Default::default()
        };
        let issues = config.sanitize();
        assert!(issues.contains(&ConfigIssue::SocResetBelowMax { reset: 3.40, max: 3.45 }));
        assert_eq!(config.soc_reset_voltage, 3.45);
    }

    #[test]
    fn fraction_table_never_reaching_one_is_flagged() {
        let mut config = ControlConfig::default();
        config.max_charge_current_cv_fraction = vec![0.0, 0.05, 0.5, 0.9];
        let issues = config.sanitize();
        assert!(issues.contains(&ConfigIssue::MaxCurrentUnreachable {
            table: "CELL_VOLTAGES_WHILE_CHARGING"
        }));
    }

    #[test]
    fn unreachable_charge_ceiling_is_flagged() {
        let mut config = ControlConfig::default();
        // table tops out below the max cell voltage while derating to zero there
        config.cell_voltages_while_charging = vec![3.40, 3.35, 3.30, 3.20];
        config.max_charge_current_cv_fraction = vec![0.0, 0.05, 0.5, 1.0];
        let issues = config.sanitize();
        assert!(issues.iter().any(|i| matches!(
            i,
            ConfigIssue::ChargeCeilingUnreachable { .. }
        )));
    }

    #[test]
    fn mismatched_table_lengths_are_flagged() {
        let mut config = ControlConfig::default();
        config.soc_while_charging = vec![100.0, 90.0];
        config.max_charge_current_soc_fraction = vec![0.2, 0.5, 1.0];
        let issues = config.sanitize();
        assert!(issues.contains(&ConfigIssue::TableLengthMismatch {
            table: "SOC_WHILE_CHARGING",
            inputs: 2,
            outputs: 3,
        }));
    }

    #[test]
    fn current_correction_only_when_tables_differ() {
        let mut config = ControlConfig::default();
        assert!(!config.soc_calc_current_correction());
        config.soc_calc_current_measured_by_user = vec![-280.0, 295.0];
        assert!(config.soc_calc_current_correction());
    }
}
