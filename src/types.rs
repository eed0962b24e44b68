// 电池遥测与控制输出类型定义
// Data contracts between the transport layer, the control core and the publisher

use serde::{Deserialize, Serialize};

/// Alarm severity reported for every protection check.
///
/// 2 = alarm, 1 = warning, 0 = ok
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Severity {
    #[default]
    Ok,
    Warning,
    Alarm,
}

impl Severity {
    /// Combine two severities; alarm dominates warning dominates ok.
    pub fn worst(self, other: Severity) -> Severity {
        self.max(other)
    }
}

/// Warning and alarm states for the different protection checks.
/// Recomputed wholesale every cycle, no history is kept here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProtectionFlags {
    pub high_voltage: Severity,
    pub high_cell_voltage: Severity,
    pub low_voltage: Severity,
    pub low_cell_voltage: Severity,
    pub low_soc: Severity,
    pub high_charge_current: Severity,
    pub high_discharge_current: Severity,
    pub cell_imbalance: Severity,
    pub internal_failure: Severity,
    pub high_charge_temp: Severity,
    pub low_charge_temp: Severity,
    pub high_temperature: Severity,
    pub low_temperature: Severity,
    pub high_internal_temp: Severity,
    pub fuse_blown: Severity,
}

/// A single cell as reported by the BMS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CellReading {
    /// Cell voltage in V, absent until the BMS has sampled it
    pub voltage: Option<f64>,
    /// Whether the balancer is currently working on this cell
    pub balancing: bool,
}

/// Per-cycle telemetry snapshot produced by a transport driver.
///
/// The core treats this as immutable input; the driver overwrites it
/// wholesale each poll and never hands the core a half-filled one.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PackSnapshot {
    /// Pack voltage in V
    pub voltage: Option<f64>,
    /// Pack current in A (positive: charging, negative: discharging)
    pub current: Option<f64>,
    /// Per-cell readings; length may differ from `cell_count` during startup
    pub cells: Vec<CellReading>,
    /// Number of cells in series, once known
    pub cell_count: Option<u32>,
    /// Temperature sensors in °C
    pub temp1: Option<f64>,
    pub temp2: Option<f64>,
    pub temp3: Option<f64>,
    pub temp4: Option<f64>,
    /// MOSFET temperature in °C
    pub temp_mos: Option<f64>,
    /// FET enable flags as reported by the BMS
    pub charge_fet: Option<bool>,
    pub discharge_fet: Option<bool>,
    pub balance_fet: Option<bool>,
    /// Externally supplied "treat pack as disconnected" flag
    pub blocked: bool,
    /// SoC in % as reported by the BMS
    pub soc_reported: Option<f64>,
    /// Rated capacity in Ah
    pub capacity_ah: Option<f64>,
    /// Charge current limit read from the BMS settings, if any
    pub bms_charge_current_limit: Option<f64>,
    /// Discharge current limit read from the BMS settings, if any
    pub bms_discharge_current_limit: Option<f64>,
    /// Fault bits already classified by the transport driver
    pub protection: ProtectionFlags,
}

impl PackSnapshot {
    /// Number of cells the accessors may index: whichever is smaller,
    /// the populated array or the announced cell count.
    fn usable_cells(&self) -> usize {
        match self.cell_count {
            Some(n) => self.cells.len().min(n as usize),
            None => self.cells.len(),
        }
    }

    /// Voltage of the lowest cell, if any cell has been sampled.
    pub fn min_cell_voltage(&self) -> Option<f64> {
        self.cells[..self.usable_cells()]
            .iter()
            .filter_map(|c| c.voltage)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v))))
    }

    /// Voltage of the highest cell, if any cell has been sampled.
    pub fn max_cell_voltage(&self) -> Option<f64> {
        self.cells[..self.usable_cells()]
            .iter()
            .filter_map(|c| c.voltage)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    /// Index of the cell with the lowest voltage.
    pub fn min_cell_index(&self) -> Option<usize> {
        self.cells[..self.usable_cells()]
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.voltage.map(|v| (i, v)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Index of the cell with the highest voltage.
    pub fn max_cell_index(&self) -> Option<usize> {
        self.cells[..self.usable_cells()]
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.voltage.map(|v| (i, v)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Sum of all sampled cell voltages in V.
    pub fn cell_voltage_sum(&self) -> f64 {
        self.cells[..self.usable_cells()]
            .iter()
            .filter_map(|c| c.voltage)
            .sum()
    }

    /// Spread between highest and lowest cell, if both are known.
    pub fn cell_voltage_diff(&self) -> Option<f64> {
        Some(self.max_cell_voltage()? - self.min_cell_voltage()?)
    }

    /// True if at least one cell is being balanced.
    pub fn any_balancing(&self) -> bool {
        self.cells[..self.usable_cells()].iter().any(|c| c.balancing)
    }

    /// Coldest battery temperature sensor in °C.
    pub fn min_temp(&self) -> Option<f64> {
        [self.temp1, self.temp2, self.temp3, self.temp4]
            .iter()
            .flatten()
            .copied()
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v))))
    }

    /// Hottest battery temperature sensor in °C.
    pub fn max_temp(&self) -> Option<f64> {
        [self.temp1, self.temp2, self.temp3, self.temp4]
            .iter()
            .flatten()
            .copied()
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    /// Store a sensor value, clamped to -20..100 °C and rounded to one
    /// decimal to paper over sensor glitches. Sensor 0 is the MOSFET.
    pub fn set_temperature(&mut self, sensor: u8, value: f64) {
        let v = round_to(value.clamp(-20.0, 100.0), 1);
        match sensor {
            0 => self.temp_mos = Some(v),
            1 => self.temp1 = Some(v),
            2 => self.temp2 = Some(v),
            3 => self.temp3 = Some(v),
            4 => self.temp4 = Some(v),
            _ => {}
        }
    }
}

/// Charge-voltage state machine modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeMode {
    Bulk,
    Absorption,
    Float,
    FloatTransition,
    /// Fixed CVL, dynamic charge voltage management disabled
    KeepMaxVoltage,
    /// Fallback when cell data is incomplete
    Error,
}

impl ChargeMode {
    pub fn is_float(self) -> bool {
        matches!(self, ChargeMode::Float | ChargeMode::FloatTransition)
    }

    fn base_label(self) -> &'static str {
        match self {
            ChargeMode::Bulk => "Bulk",
            ChargeMode::Absorption => "Absorption",
            ChargeMode::Float => "Float",
            ChargeMode::FloatTransition => "Float Transition",
            ChargeMode::KeepMaxVoltage => "Keep always max voltage",
            ChargeMode::Error => "Error, please check the logs!",
        }
    }
}

/// Orthogonal annotations on top of `ChargeMode`, rendered into the
/// label only at the output boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModeFlags {
    /// A cell exceeded its ceiling this cycle and the CVL was derated
    pub dynamic: bool,
    /// The controller is targeting the SoC-reset ceiling
    pub soc_reset: bool,
    /// Balancing is active while the cells are still far apart
    pub balancing: bool,
}

/// Render mode + flags to the legacy GUI label.
pub fn charge_mode_label(mode: ChargeMode, flags: ModeFlags, linear: bool) -> String {
    let mut label = mode.base_label().to_string();
    if !matches!(mode, ChargeMode::KeepMaxVoltage | ChargeMode::Error) {
        if flags.dynamic {
            label.push_str(" Dynamic");
        }
        if flags.soc_reset {
            label.push_str(" & SoC Reset");
        }
        if flags.balancing {
            label.push_str(" + Balancing");
        }
        label.push_str(if linear { " (Linear Mode)" } else { " (Step Mode)" });
    }
    label
}

/// Everything the publishing layer needs from one control cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlOutputs {
    /// Commanded charge voltage limit in V
    pub control_voltage: Option<f64>,
    pub charge_mode: ChargeMode,
    pub mode_flags: ModeFlags,
    /// Human readable mode label
    pub charge_mode_label: String,
    /// Multi-line breakdown of the CVL decision, if enabled in config
    pub charge_mode_debug: Option<String>,
    /// Commanded charge current limit in A
    pub control_charge_current: Option<f64>,
    /// Commanded discharge current limit in A
    pub control_discharge_current: Option<f64>,
    /// Which source(s) produced the committed CCL
    pub charge_limitation: String,
    /// Which source(s) produced the committed DCL
    pub discharge_limitation: String,
    pub allow_to_charge: bool,
    pub allow_to_discharge: bool,
    pub allow_to_balance: bool,
    /// Calibrated SoC in %, three decimals
    pub soc_calc: Option<f64>,
    pub protection: ProtectionFlags,
    /// Sticky diagnostic code, if the fault window is saturated
    pub error_code: Option<u16>,
}

/// The fields an external layer should checkpoint to survive restarts.
/// Losing them is not fatal, it only resets calibration and hysteresis.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedState {
    pub soc_calc: Option<f64>,
    pub allow_max_voltage: bool,
    pub max_voltage_start_time: Option<f64>,
    /// Epoch seconds of the last completed SoC-reset cycle, 0 = never
    pub soc_reset_last_reached: f64,
}

/// Round to `decimals` decimal places.
pub(crate) fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(v: f64) -> CellReading {
        CellReading { voltage: Some(v), balancing: false }
    }

    #[test]
    fn severity_combination() {
        assert_eq!(Severity::Ok.worst(Severity::Warning), Severity::Warning);
        assert_eq!(Severity::Alarm.worst(Severity::Warning), Severity::Alarm);
        assert_eq!(Severity::Ok.worst(Severity::Ok), Severity::Ok);
    }

    #[test]
    fn cell_extremes_ignore_unsampled_cells() {
        let snapshot = PackSnapshot {
            cells: vec![cell(3.30), CellReading::default(), cell(3.45), cell(3.28)],
            cell_count: Some(4),
            ..Default::default()
        };
        assert_eq!(snapshot.min_cell_voltage(), Some(3.28));
        assert_eq!(snapshot.max_cell_voltage(), Some(3.45));
        assert_eq!(snapshot.min_cell_index(), Some(3));
        assert_eq!(snapshot.max_cell_index(), Some(2));
        assert!((snapshot.cell_voltage_sum() - 10.03).abs() < 1e-9);
    }

    #[test]
    fn cell_accessors_respect_cell_count_mismatch() {
        // more cells populated than announced: extra entries are ignored
        let snapshot = PackSnapshot {
            cells: vec![cell(3.30), cell(3.31), cell(9.99)],
            cell_count: Some(2),
            ..Default::default()
        };
        assert_eq!(snapshot.max_cell_voltage(), Some(3.31));
    }

    #[test]
    fn temperature_ingestion_clamps() {
        let mut snapshot = PackSnapshot::default();
        snapshot.set_temperature(1, 142.77);
        snapshot.set_temperature(2, -33.0);
        snapshot.set_temperature(0, 25.04);
        assert_eq!(snapshot.temp1, Some(100.0));
        assert_eq!(snapshot.temp2, Some(-20.0));
        assert_eq!(snapshot.temp_mos, Some(25.0));
        assert_eq!(snapshot.max_temp(), Some(100.0));
        assert_eq!(snapshot.min_temp(), Some(-20.0));
    }

    #[test]
    fn mode_labels_render_flags_in_order() {
        let flags = ModeFlags { dynamic: true, soc_reset: true, balancing: true };
        assert_eq!(
            charge_mode_label(ChargeMode::Absorption, flags, true),
            "Absorption Dynamic & SoC Reset + Balancing (Linear Mode)"
        );
        assert_eq!(
            charge_mode_label(ChargeMode::Bulk, ModeFlags::default(), false),
            "Bulk (Step Mode)"
        );
        assert_eq!(
            charge_mode_label(ChargeMode::Error, flags, true),
            "Error, please check the logs!"
        );
    }
}
