// 电池控制核心
// Single-threaded control core: one tick per poll cycle

use crate::config::ControlConfig;
use crate::control::{
    protection, ChargeVoltageController, CurrentLimiter, ErrorAccumulator, SocEstimator,
};
use crate::types::{ControlOutputs, PackSnapshot, PersistedState};

/// Error code raised when the control core itself keeps failing.
pub const ERROR_CODE_INTERNAL_FAILURE: u16 = 8;

type SocResetHook = Box<dyn FnMut(f64) + Send>;

/// Owns all per-battery control state and runs the control loop body.
///
/// Strictly single-owner: the poller calls `tick` once per cycle and
/// nothing else touches the contained state. Every `tick` is a pure
/// function of the previous state, the snapshot and the wall clock.
pub struct BatteryController {
    config: ControlConfig,
    voltage: ChargeVoltageController,
    current: CurrentLimiter,
    soc: SocEstimator,
    errors: ErrorAccumulator,
    soc_reset_hook: Option<SocResetHook>,
    force_charging_off: bool,
    force_discharging_off: bool,
    force_no_balance: bool,
}

impl BatteryController {
    /// Build a controller around a validated configuration. Issues found
    /// during validation are logged but never prevent construction; the
    /// external layer decides whether to block the pack instead.
    pub fn new(mut config: ControlConfig) -> Self {
        for issue in config.sanitize() {
            log::warn!("config: {issue}");
        }
        Self {
            config,
            voltage: ChargeVoltageController::new(),
            current: CurrentLimiter::new(),
            soc: SocEstimator::new(),
            errors: ErrorAccumulator::new(),
            soc_reset_hook: None,
            force_charging_off: false,
            force_discharging_off: false,
            force_no_balance: false,
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Called once when the charge controller decides the pack is full
    /// and moves to float. A transport driver may map this to a
    /// BMS-specific SoC reset command; by default nothing happens.
    pub fn set_soc_reset_hook(&mut self, hook: impl FnMut(f64) + Send + 'static) {
        self.soc_reset_hook = Some(Box::new(hook));
    }

    // remote overrides from the publishing layer

    pub fn set_force_charging_off(&mut self, value: bool) {
        self.force_charging_off = value;
    }

    pub fn set_force_discharging_off(&mut self, value: bool) {
        self.force_discharging_off = value;
    }

    pub fn set_force_no_balance(&mut self, value: bool) {
        self.force_no_balance = value;
    }

    /// Reload checkpointed state. Call before the first tick.
    pub fn restore(&mut self, state: &PersistedState) {
        self.soc.restore_soc(state.soc_calc);
        self.voltage.restore(
            state.allow_max_voltage,
            state.max_voltage_start_time,
            state.soc_reset_last_reached,
        );
    }

    /// The fields the external layer should checkpoint. Losing them only
    /// resets calibration and hysteresis, never safety.
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            soc_calc: self.soc.soc_calc(),
            allow_max_voltage: self.voltage.allow_max_voltage(),
            max_voltage_start_time: self.voltage.max_voltage_start_time(),
            soc_reset_last_reached: self.voltage.soc_reset_last_reached(),
        }
    }

    /// Run one control cycle against a fresh telemetry snapshot.
    pub fn tick(&mut self, now: f64, snapshot: &PackSnapshot) -> ControlOutputs {
        // SoC first, the voltage and current stages consume it
        let soc_calc = if self.config.soc_calculation {
            let update = self.soc.update(
                now,
                &self.config,
                snapshot.current,
                snapshot.min_cell_voltage(),
                snapshot.max_cell_voltage(),
                snapshot.capacity_ah,
                snapshot.soc_reported,
            );
            if update.fault {
                self.record_fault(now);
            }
            update.soc_calc
        } else {
            snapshot.soc_reported
        };

        let voltage = self.voltage.update(now, &self.config, snapshot, soc_calc);
        if voltage.fault {
            self.record_fault(now);
        }
        if voltage.trigger_soc_reset {
            if let Some(hook) = self.soc_reset_hook.as_mut() {
                hook(now);
            }
        }

        let mut limits = self.current.update(now, &self.config, snapshot, soc_calc);
        if limits.fault {
            self.record_fault(now);
        }
        if self.force_charging_off {
            limits.control_charge_current = Some(0.0);
            limits.allow_to_charge = false;
        }
        if self.force_discharging_off {
            limits.control_discharge_current = Some(0.0);
            limits.allow_to_discharge = false;
        }

        self.errors.maybe_clear(now);

        let flags = protection::assess(
            &self.config,
            snapshot.protection,
            soc_calc,
            self.errors.error_code().is_some(),
        );

        ControlOutputs {
            control_voltage: voltage.control_voltage,
            charge_mode: voltage.mode,
            mode_flags: voltage.flags,
            charge_mode_label: voltage.label,
            charge_mode_debug: voltage.debug,
            control_charge_current: limits.control_charge_current,
            control_discharge_current: limits.control_discharge_current,
            charge_limitation: limits.charge_limitation,
            discharge_limitation: limits.discharge_limitation,
            allow_to_charge: limits.allow_to_charge
                && snapshot.charge_fet.unwrap_or(true)
                && !snapshot.blocked,
            allow_to_discharge: limits.allow_to_discharge
                && snapshot.discharge_fet.unwrap_or(true)
                && !snapshot.blocked,
            allow_to_balance: snapshot.balance_fet.unwrap_or(false) && !self.force_no_balance,
            soc_calc,
            protection: flags,
            error_code: self.errors.error_code(),
        }
    }

    fn record_fault(&mut self, now: f64) {
        self.errors.record_fault(now);
        self.errors.maybe_raise(now, ERROR_CODE_INTERNAL_FAILURE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CellReading, ChargeMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pack(cell_v: f64) -> PackSnapshot {
        PackSnapshot {
            cells: vec![CellReading { voltage: Some(cell_v), balancing: false }; 16],
            cell_count: Some(16),
            voltage: Some(cell_v * 16.0),
            current: Some(0.0),
            temp1: Some(20.0),
            temp2: Some(21.0),
            charge_fet: Some(true),
            discharge_fet: Some(true),
            balance_fet: Some(true),
            capacity_ah: Some(100.0),
            soc_reported: Some(80.0),
            ..Default::default()
        }
    }

    #[test]
    fn tick_produces_consistent_outputs() {
        let mut controller = BatteryController::new(ControlConfig::default());
        let outputs = controller.tick(0.0, &pack(3.30));
        assert_eq!(outputs.charge_mode, ChargeMode::Bulk);
        assert_eq!(outputs.soc_calc, Some(80.0));
        assert!(outputs.control_voltage.is_some());
        assert!(outputs.allow_to_charge && outputs.allow_to_discharge);
        assert!(outputs.allow_to_balance);
        assert_eq!(outputs.error_code, None);
    }

    #[test]
    fn soc_reset_hook_fires_once_on_float_entry() {
        let mut controller = BatteryController::new(ControlConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        controller.set_soc_reset_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let full = pack(3.46);
        controller.tick(0.0, &full);
        controller.tick(1.0, &full);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // hold timer expires: float entry fires the hook exactly once
        controller.tick(902.0, &full);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        controller.tick(903.0, &full);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_charging_off_zeroes_the_committed_limit() {
        let mut controller = BatteryController::new(ControlConfig::default());
        controller.set_force_charging_off(true);
        let outputs = controller.tick(0.0, &pack(3.30));
        assert_eq!(outputs.control_charge_current, Some(0.0));
        assert!(!outputs.allow_to_charge);
        // discharge side is unaffected
        assert!(outputs.allow_to_discharge);
    }

    #[test]
    fn force_no_balance_masks_the_fet() {
        let mut controller = BatteryController::new(ControlConfig::default());
        controller.set_force_no_balance(true);
        let outputs = controller.tick(0.0, &pack(3.30));
        assert!(!outputs.allow_to_balance);
    }

    #[test]
    fn reported_soc_is_passed_through_when_calculation_disabled() {
        let config = ControlConfig { soc_calculation: false, ..Default::default() };
        let mut controller = BatteryController::new(config);
        let outputs = controller.tick(0.0, &pack(3.30));
        assert_eq!(outputs.soc_calc, Some(80.0));
    }

    #[test]
    fn persisted_state_round_trip() {
        let mut first = BatteryController::new(ControlConfig::default());
        let mut full = pack(3.46);
        full.soc_reported = Some(95.0); // above the re-bulk threshold
        first.tick(0.0, &full);
        first.tick(901.0, &full); // leaves bulk, allow_max_voltage drops
        let state = first.persisted_state();
        assert!(!state.allow_max_voltage);
        assert!(state.soc_calc.is_some());

        let mut second = BatteryController::new(ControlConfig::default());
        second.restore(&state);
        // restored hysteresis: the pack stays in float instead of re-bulking
        let mut idle = pack(3.38);
        idle.soc_reported = Some(95.0);
        let outputs = second.tick(1000.0, &idle);
        assert!(outputs.charge_mode.is_float() || outputs.charge_mode == ChargeMode::Float);
        assert_eq!(second.persisted_state().soc_calc, state.soc_calc);
    }

    #[test]
    fn sustained_faults_raise_the_sticky_error_code() {
        let mut controller = BatteryController::new(ControlConfig::default());
        // capacity missing: every tick records a fault
        let mut snapshot = pack(3.30);
        snapshot.capacity_ah = None;
        let mut outputs = controller.tick(0.0, &snapshot);
        for i in 1..200 {
            outputs = controller.tick(i as f64, &snapshot);
        }
        assert_eq!(outputs.error_code, Some(ERROR_CODE_INTERNAL_FAILURE));
        assert_eq!(
            outputs.protection.internal_failure,
            crate::types::Severity::Alarm
        );
    }
}
