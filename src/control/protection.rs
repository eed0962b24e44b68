// 保护状态汇总
// Combines driver-classified fault bits with the checks the core owns

use crate::config::ControlConfig;
use crate::types::{ProtectionFlags, Severity};

/// Worst-of combination of two flag sets. Used when a pack has more than
/// one fault source reporting the same condition.
pub fn merge(a: ProtectionFlags, b: ProtectionFlags) -> ProtectionFlags {
    ProtectionFlags {
        high_voltage: a.high_voltage.worst(b.high_voltage),
        high_cell_voltage: a.high_cell_voltage.worst(b.high_cell_voltage),
        low_voltage: a.low_voltage.worst(b.low_voltage),
        low_cell_voltage: a.low_cell_voltage.worst(b.low_cell_voltage),
        low_soc: a.low_soc.worst(b.low_soc),
        high_charge_current: a.high_charge_current.worst(b.high_charge_current),
        high_discharge_current: a.high_discharge_current.worst(b.high_discharge_current),
        cell_imbalance: a.cell_imbalance.worst(b.cell_imbalance),
        internal_failure: a.internal_failure.worst(b.internal_failure),
        high_charge_temp: a.high_charge_temp.worst(b.high_charge_temp),
        low_charge_temp: a.low_charge_temp.worst(b.low_charge_temp),
        high_temperature: a.high_temperature.worst(b.high_temperature),
        low_temperature: a.low_temperature.worst(b.low_temperature),
        high_internal_temp: a.high_internal_temp.worst(b.high_internal_temp),
        fuse_blown: a.fuse_blown.worst(b.fuse_blown),
    }
}

/// SoC-based warning/alarm for packs whose BMS does not report one.
pub fn classify_low_soc(config: &ControlConfig, soc: Option<f64>) -> Severity {
    match soc {
        Some(s) if s <= config.soc_low_alarm => Severity::Alarm,
        Some(s) if s <= config.soc_low_warning => Severity::Warning,
        _ => Severity::Ok,
    }
}

/// Per-cycle protection assessment: driver bits, the core's low-SoC check
/// and the sticky internal failure from the error window.
pub fn assess(
    config: &ControlConfig,
    driver_flags: ProtectionFlags,
    soc_calc: Option<f64>,
    internal_failure: bool,
) -> ProtectionFlags {
    let core_flags = ProtectionFlags {
        low_soc: classify_low_soc(config, soc_calc),
        internal_failure: if internal_failure { Severity::Alarm } else { Severity::Ok },
        ..Default::default()
    };
    merge(driver_flags, core_flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_the_worse_severity_per_field() {
        let a = ProtectionFlags {
            high_voltage: Severity::Warning,
            low_soc: Severity::Alarm,
            ..Default::default()
        };
        let b = ProtectionFlags {
            high_voltage: Severity::Alarm,
            low_temperature: Severity::Warning,
            ..Default::default()
        };
        let merged = merge(a, b);
        assert_eq!(merged.high_voltage, Severity::Alarm);
        assert_eq!(merged.low_soc, Severity::Alarm);
        assert_eq!(merged.low_temperature, Severity::Warning);
        assert_eq!(merged.fuse_blown, Severity::Ok);
    }

    #[test]
    fn low_soc_thresholds() {
        let config = ControlConfig::default(); // warning 20%, alarm 10%
        assert_eq!(classify_low_soc(&config, Some(50.0)), Severity::Ok);
        assert_eq!(classify_low_soc(&config, Some(20.0)), Severity::Warning);
        assert_eq!(classify_low_soc(&config, Some(10.0)), Severity::Alarm);
        assert_eq!(classify_low_soc(&config, Some(5.0)), Severity::Alarm);
        assert_eq!(classify_low_soc(&config, None), Severity::Ok);
    }

    #[test]
    fn driver_alarm_survives_the_core_assessment() {
        let config = ControlConfig::default();
        let driver = ProtectionFlags { low_soc: Severity::Alarm, ..Default::default() };
        // BMS says alarm even though the estimator sees a healthy SoC
        let flags = assess(&config, driver, Some(80.0), false);
        assert_eq!(flags.low_soc, Severity::Alarm);
    }

    #[test]
    fn internal_failure_is_raised_on_saturated_error_window() {
        let config = ControlConfig::default();
        let flags = assess(&config, ProtectionFlags::default(), Some(80.0), true);
        assert_eq!(flags.internal_failure, Severity::Alarm);
        let flags = assess(&config, ProtectionFlags::default(), Some(80.0), false);
        assert_eq!(flags.internal_failure, Severity::Ok);
    }
}
