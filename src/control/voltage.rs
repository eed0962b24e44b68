// 充电电压状态机
// Bulk/Absorption/Float charge voltage controller with SoC-reset cycles

use crate::config::ControlConfig;
use crate::types::{charge_mode_label, round_to, ChargeMode, ModeFlags, PackSnapshot};

/// Ramp rate while easing from the absorption voltage down to float, in V/s.
const FLOAT_RAMP_VOLTS_PER_SECOND: f64 = 0.01 / 10.0;

/// Tolerance on the pack voltage falling away from the target while the
/// hold timer runs, in V.
const MEASUREMENT_TOLERANCE: f64 = 0.5;

/// Result of one controller update.
#[derive(Debug, Clone)]
pub struct VoltageControl {
    /// Commanded CVL in V
    pub control_voltage: Option<f64>,
    pub mode: ChargeMode,
    pub flags: ModeFlags,
    pub label: String,
    /// Multi-line decision breakdown, when enabled in config
    pub debug: Option<String>,
    /// The pack just entered the float stage and can be assumed full;
    /// the caller should fire the external SoC-reset hook exactly once
    pub trigger_soc_reset: bool,
    /// Cell data was incomplete and the fallback voltage was commanded
    pub fault: bool,
}

/// Timer-driven CVL state machine.
///
/// `allow_max_voltage` and the hold timer are the two pieces of hysteresis
/// state: the pack may sit at the target voltage while `allow_max_voltage`
/// is true, and the hold timer measures how long it has been there.
#[derive(Debug, Clone)]
pub struct ChargeVoltageController {
    allow_max_voltage: bool,
    max_voltage_start_time: Option<f64>,
    transition_start_time: Option<f64>,
    initial_control_voltage: f64,
    control_voltage: Option<f64>,
    mode: Option<ChargeMode>,
    min_battery_voltage: Option<f64>,
    max_battery_voltage: Option<f64>,
    soc_reset_battery_voltage: Option<f64>,
    soc_reset_requested: bool,
    /// Epoch seconds of the last completed reset cycle, 0 = never
    soc_reset_last_reached: f64,
}

impl Default for ChargeVoltageController {
    fn default() -> Self {
        Self {
            allow_max_voltage: true,
            max_voltage_start_time: None,
            transition_start_time: None,
            initial_control_voltage: 0.0,
            control_voltage: None,
            mode: None,
            min_battery_voltage: None,
            max_battery_voltage: None,
            soc_reset_battery_voltage: None,
            soc_reset_requested: false,
            soc_reset_last_reached: 0.0,
        }
    }
}

impl ChargeVoltageController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_max_voltage(&self) -> bool {
        self.allow_max_voltage
    }

    pub fn max_voltage_start_time(&self) -> Option<f64> {
        self.max_voltage_start_time
    }

    pub fn soc_reset_last_reached(&self) -> f64 {
        self.soc_reset_last_reached
    }

    /// Reload the hysteresis state from an external checkpoint.
    pub fn restore(
        &mut self,
        allow_max_voltage: bool,
        max_voltage_start_time: Option<f64>,
        soc_reset_last_reached: f64,
    ) {
        self.allow_max_voltage = allow_max_voltage;
        self.max_voltage_start_time = max_voltage_start_time;
        self.soc_reset_last_reached = soc_reset_last_reached;
    }

    /// Run one control cycle.
    pub fn update(
        &mut self,
        now: f64,
        config: &ControlConfig,
        snapshot: &PackSnapshot,
        soc_calc: Option<f64>,
    ) -> VoltageControl {
        // battery voltage bounds are derived once the cell count is known
        if let Some(count) = snapshot.cell_count {
            let count = count as f64;
            if self.min_battery_voltage.is_none() {
                self.min_battery_voltage = Some(round_to(config.min_cell_voltage * count, 2));
            }
            if self.max_battery_voltage.is_none() {
                self.max_battery_voltage = Some(round_to(config.max_cell_voltage * count, 2));
            }
            if config.soc_reset_after_days.is_some() {
                self.manage_soc_reset_voltage(now, config, count);
            }
        }

        if !config.cvcm_enable {
            self.control_voltage = self.max_battery_voltage;
            self.mode = Some(ChargeMode::KeepMaxVoltage);
            return self.result(ChargeMode::KeepMaxVoltage, ModeFlags::default(), config, None, false, false);
        }

        if config.linear_limitation_enable {
            self.update_linear(now, config, snapshot, soc_calc)
        } else {
            self.update_step(now, config, snapshot, soc_calc)
        }
    }

    /// Request a reset-voltage cycle every `soc_reset_after_days` and point
    /// `max_battery_voltage` at the reset ceiling while one is pending.
    fn manage_soc_reset_voltage(&mut self, now: f64, config: &ControlConfig, cell_count: f64) {
        let Some(after_days) = config.soc_reset_after_days else {
            return;
        };
        let days_ago = if self.soc_reset_last_reached == 0.0 {
            0.0
        } else {
            (now - self.soc_reset_last_reached) / 60.0 / 60.0 / 24.0
        };

        // the request is cleared only once the reset ceiling was reached
        // and the controller has moved on to float
        if !self.soc_reset_requested
            && self.allow_max_voltage
            && (self.soc_reset_last_reached == 0.0 || after_days < days_ago)
        {
            log::info!("SoC reset cycle requested, {days_ago:.2} days since the last one");
            self.soc_reset_requested = true;
        }

        self.soc_reset_battery_voltage = Some(round_to(config.soc_reset_voltage * cell_count, 2));

        self.max_battery_voltage = Some(if self.soc_reset_requested {
            round_to(config.soc_reset_voltage * cell_count, 2)
        } else {
            round_to(config.max_cell_voltage * cell_count, 2)
        });
    }

    fn update_linear(
        &mut self,
        now: f64,
        config: &ControlConfig,
        snapshot: &PackSnapshot,
        soc_calc: Option<f64>,
    ) -> VoltageControl {
        let (Some(max_battery_voltage), Some(min_battery_voltage)) =
            (self.max_battery_voltage, self.min_battery_voltage)
        else {
            return self.fallback(config, snapshot);
        };
        let (Some(max_cell_v), Some(min_cell_v)) =
            (snapshot.max_cell_voltage(), snapshot.min_cell_voltage())
        else {
            return self.fallback(config, snapshot);
        };

        let targeting_reset = self.soc_reset_battery_voltage.is_some()
            && self.soc_reset_battery_voltage == Some(max_battery_voltage);
        let cell_ceiling = if targeting_reset {
            config.soc_reset_voltage
        } else {
            config.max_cell_voltage
        };

        // voltage sum and per-cell overshoot above the ceiling
        let voltage_sum = snapshot.cell_voltage_sum();
        let mut penalty_sum = 0.0;
        let mut found_high_cell_voltage = false;
        for cell in &snapshot.cells {
            if let Some(v) = cell.voltage {
                if v > cell_ceiling {
                    found_high_cell_voltage = true;
                    penalty_sum += v - cell_ceiling;
                }
            }
        }

        let cell_diff = max_cell_v - min_cell_v;
        let mut time_diff = 0.0;
        let mut fault = false;
        let timer_was_running = self.max_voltage_start_time.is_some();

        match self.max_voltage_start_time {
            None => {
                // start the hold timer once the pack sits at the target
                // with balanced cells
                if max_battery_voltage - config.voltage_drop <= voltage_sum
                    && cell_diff <= config.cell_voltage_diff_keep_max_voltage_until
                    && self.allow_max_voltage
                {
                    self.max_voltage_start_time = Some(now);
                }
                // allow max voltage again if the cells drifted apart or
                // the SoC fell below the re-bulk threshold
                else if (config.soc_level_to_reset_voltage_limit > soc_calc.unwrap_or(100.0)
                    || cell_diff >= config.cell_voltage_diff_to_reset_voltage_limit)
                    && !self.allow_max_voltage
                {
                    log::info!("Re-enabling max voltage (cell diff {cell_diff:.3} V)");
                    self.allow_max_voltage = true;
                }
            }
            Some(start) => {
                if cell_diff > config.cell_voltage_diff_keep_max_voltage_time_restart {
                    self.max_voltage_start_time = Some(now);
                }
                let start = self.max_voltage_start_time.unwrap_or(start);

                time_diff = now - start;
                if config.max_voltage_time_sec < time_diff {
                    self.allow_max_voltage = false;
                    self.max_voltage_start_time = None;

                    if soc_calc.unwrap_or(100.0) <= config.soc_level_to_reset_voltage_limit {
                        // float would immediately bounce back to bulk
                        fault = true;
                        log::error!(
                            "Could not change to float voltage, SoC ({:?}%) is below the re-bulk threshold ({}%)",
                            soc_calc,
                            config.soc_level_to_reset_voltage_limit
                        );
                    }
                }

                // pack fell away from the target: cancel the pending
                // float transition and stay in bulk
                if voltage_sum < max_battery_voltage - MEASUREMENT_TOLERANCE {
                    self.max_voltage_start_time = None;
                }
            }
        }

        let (mode, flags) = if self.allow_max_voltage {
            let control_voltage = if config.cvl_icontroller_mode {
                let cv = match self.control_voltage {
                    Some(previous) => round_to(
                        previous
                            - (max_cell_v
                                - cell_ceiling
                                - config.cell_voltage_diff_keep_max_voltage_until)
                                * config.cvl_icontroller_factor,
                        6,
                    ),
                    None => max_battery_voltage,
                };
                cv.clamp(min_battery_voltage, max_battery_voltage)
            } else if found_high_cell_voltage {
                round_to(
                    (voltage_sum - penalty_sum).clamp(min_battery_voltage, max_battery_voltage),
                    6,
                )
            } else {
                max_battery_voltage
            };
            self.control_voltage = Some(control_voltage);

            // the cycle that starts the timer still reports bulk
            let mode = if self.max_voltage_start_time.is_some() && timer_was_running {
                ChargeMode::Absorption
            } else {
                ChargeMode::Bulk
            };
            let flags = ModeFlags {
                dynamic: found_high_cell_voltage,
                soc_reset: targeting_reset,
                balancing: snapshot.any_balancing()
                    && cell_diff >= config.cell_voltage_diff_to_reset_voltage_limit,
            };
            (mode, flags)
        } else {
            let mode = self.enter_float(now, config, snapshot);
            (mode, ModeFlags::default())
        };

        if self.mode.map_or(true, |m| m != mode) {
            log::info!("Charge mode changed to {:?}", mode);
        }
        let trigger = mode == ChargeMode::FloatTransition
            && self.mode.map_or(true, |m| m != ChargeMode::FloatTransition);
        self.mode = Some(mode);

        let debug = config.show_debug_info.then(|| {
            self.debug_breakdown(now, config, voltage_sum, cell_diff, max_cell_v, penalty_sum, soc_calc, time_diff)
        });
        self.result(mode, flags, config, debug, trigger, fault)
    }

    fn update_step(
        &mut self,
        now: f64,
        config: &ControlConfig,
        snapshot: &PackSnapshot,
        soc_calc: Option<f64>,
    ) -> VoltageControl {
        let Some(max_battery_voltage) = self.max_battery_voltage else {
            return self.fallback(config, snapshot);
        };
        if snapshot.max_cell_voltage().is_none() {
            return self.fallback(config, snapshot);
        }

        let voltage_sum = snapshot.cell_voltage_sum();
        let targeting_reset = self.soc_reset_battery_voltage.is_some()
            && self.soc_reset_battery_voltage == Some(max_battery_voltage);

        let timer_was_running = self.max_voltage_start_time.is_some();
        match self.max_voltage_start_time {
            None => {
                if max_battery_voltage - config.voltage_drop <= voltage_sum && self.allow_max_voltage {
                    self.max_voltage_start_time = Some(now);
                } else if config.soc_level_to_reset_voltage_limit > soc_calc.unwrap_or(100.0)
                    && !self.allow_max_voltage
                {
                    self.allow_max_voltage = true;
                }
            }
            Some(start) => {
                if config.max_voltage_time_sec < now - start {
                    self.allow_max_voltage = false;
                    self.max_voltage_start_time = None;
                }
            }
        }

        let (mode, flags) = if self.allow_max_voltage {
            self.control_voltage = Some(max_battery_voltage);
            let mode = if self.max_voltage_start_time.is_some() && timer_was_running {
                ChargeMode::Absorption
            } else {
                ChargeMode::Bulk
            };
            (mode, ModeFlags { soc_reset: targeting_reset, ..Default::default() })
        } else {
            // step mode jumps straight to the float voltage, no ramp
            let count = f64::from(snapshot.cell_count.unwrap_or(snapshot.cells.len() as u32));
            self.control_voltage = Some(round_to(config.float_cell_voltage * count, 2));
            self.finish_soc_reset(now);
            (ChargeMode::Float, ModeFlags::default())
        };

        let trigger = mode == ChargeMode::Float && self.mode.map_or(false, |m| !m.is_float());
        if self.mode.map_or(true, |m| m != mode) {
            log::info!("Charge mode changed to {:?}", mode);
        }
        self.mode = Some(mode);
        self.result(mode, flags, config, None, trigger, false)
    }

    /// Float branch of the linear state machine: ramp the CVL down from
    /// wherever absorption left it to the float voltage.
    fn enter_float(&mut self, now: f64, config: &ControlConfig, snapshot: &PackSnapshot) -> ChargeMode {
        let count = f64::from(snapshot.cell_count.unwrap_or(snapshot.cells.len() as u32));
        let float_voltage = round_to(config.float_cell_voltage * count, 2);

        self.finish_soc_reset(now);

        let Some(current_cv) = self.control_voltage else {
            self.control_voltage = Some(float_voltage);
            return ChargeMode::Float;
        };

        match self.mode {
            Some(mode) if !mode.is_float() => {
                // first cycle after leaving bulk/absorption
                self.transition_start_time = Some(now);
                self.initial_control_voltage = current_cv;
                ChargeMode::FloatTransition
            }
            Some(ChargeMode::FloatTransition) => {
                let elapsed = now - self.transition_start_time.unwrap_or(now);
                let reduction = (FLOAT_RAMP_VOLTS_PER_SECOND * elapsed)
                    .min(self.initial_control_voltage - float_voltage);
                let ramped = self.initial_control_voltage - reduction;
                if ramped <= float_voltage {
                    self.control_voltage = Some(float_voltage);
                    self.transition_start_time = None;
                    ChargeMode::Float
                } else {
                    self.control_voltage = Some(ramped);
                    ChargeMode::FloatTransition
                }
            }
            _ => ChargeMode::Float,
        }
    }

    /// Reaching float completes a pending SoC-reset cycle.
    fn finish_soc_reset(&mut self, now: f64) {
        if self.soc_reset_requested {
            self.soc_reset_requested = false;
            self.soc_reset_last_reached = now;
            log::info!("SoC reset cycle completed");
        }
    }

    /// Conservative fallback when cell data is incomplete: command the
    /// float voltage and flag the cycle, never leave the CVL unset.
    fn fallback(&mut self, config: &ControlConfig, snapshot: &PackSnapshot) -> VoltageControl {
        let count = snapshot.cell_count.map(f64::from).unwrap_or(snapshot.cells.len() as f64);
        if count > 0.0 {
            self.control_voltage = Some(round_to(config.float_cell_voltage * count, 2));
        }
        log::error!("Incomplete cell data, falling back to float voltage");
        self.mode = Some(ChargeMode::Error);
        self.result(ChargeMode::Error, ModeFlags::default(), config, None, false, true)
    }

    fn result(
        &self,
        mode: ChargeMode,
        flags: ModeFlags,
        config: &ControlConfig,
        debug: Option<String>,
        trigger_soc_reset: bool,
        fault: bool,
    ) -> VoltageControl {
        VoltageControl {
            control_voltage: self.control_voltage,
            mode,
            flags,
            label: charge_mode_label(mode, flags, config.linear_limitation_enable),
            debug,
            trigger_soc_reset,
            fault,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn debug_breakdown(
        &self,
        now: f64,
        config: &ControlConfig,
        voltage_sum: f64,
        cell_diff: f64,
        max_cell_v: f64,
        penalty_sum: f64,
        soc_calc: Option<f64>,
        time_diff: f64,
    ) -> String {
        let soc_reset_ago = if self.soc_reset_last_reached == 0.0 {
            "Never".to_string()
        } else {
            format!("{:.2} d ago", (now - self.soc_reset_last_reached) / 86400.0)
        };
        format!(
            "max_battery_voltage: {:?} V • control_voltage: {:?} V\n\
             voltage_sum: {voltage_sum:.2} V • voltage_cell_diff: {cell_diff:.3} V\n\
             max_cell_voltage: {max_cell_v:.3} V • penalty_sum: {penalty_sum:.3} V\n\
             soc_calc: {soc_calc:?}%\n\
             allow_max_voltage: {} • time_diff: {time_diff:.0}/{:.0} s\n\
             soc_reset_requested: {} • soc_reset_last_reached: {soc_reset_ago}",
            self.max_battery_voltage,
            self.control_voltage,
            self.allow_max_voltage,
            config.max_voltage_time_sec,
            self.soc_reset_requested,
        )
    }
}
