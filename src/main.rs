// 电池控制后台 (模拟遥测运行)
// Battery control backend, running the control core against simulated
// telemetry until a transport driver is wired in

use anyhow::{Context, Result};
use bms_control::{BatteryController, CellReading, ControlConfig, PackSnapshot};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time;

/// Poll period bounds for the adaptive scheduler, in seconds.
const POLL_INTERVAL_MIN: f64 = 1.0;
const POLL_INTERVAL_MAX: f64 = 60.0;

/// Consecutive over-budget cycles before the poll period is raised.
const SLOW_CYCLES_BEFORE_BACKOFF: u32 = 5;

fn load_config() -> Result<ControlConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))
        }
        None => Ok(ControlConfig::default()),
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A 16-cell pack that slowly charges towards the ceiling. Stands in for
/// a transport driver so the control loop can be exercised end to end.
fn simulated_snapshot(cycle: u64) -> PackSnapshot {
    let base = 3.30 + (cycle as f64 * 0.0001).min(0.16);
    let cells = (0..16)
        .map(|i| CellReading {
            voltage: Some(base + i as f64 * 0.0005),
            balancing: false,
        })
        .collect::<Vec<_>>();
    let mut snapshot = PackSnapshot {
        cells,
        cell_count: Some(16),
        current: Some(if base < 3.45 { 25.0 } else { 2.0 }),
        charge_fet: Some(true),
        discharge_fet: Some(true),
        balance_fet: Some(true),
        capacity_ah: Some(200.0),
        soc_reported: Some(65.0),
        ..Default::default()
    };
    snapshot.voltage = Some(snapshot.cell_voltage_sum());
    snapshot.set_temperature(1, 21.3);
    snapshot.set_temperature(2, 22.1);
    snapshot
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    log::info!("battery control backend starting");

    let config = load_config()?;
    let mut controller = BatteryController::new(config);
    controller.set_soc_reset_hook(|now| {
        log::info!("pack assumed full at {now:.0}, SoC reset hook fired");
    });

    let mut poll_interval = POLL_INTERVAL_MIN;
    let mut slow_cycles: u32 = 0;
    let mut cycle: u64 = 0;

    loop {
        let started = Instant::now();
        let snapshot = simulated_snapshot(cycle);
        let outputs = controller.tick(epoch_seconds(), &snapshot);

        log::info!(
            "cycle {cycle}: mode={} cvl={:?} ccl={:?} ({}) dcl={:?} ({}) soc={:?}",
            outputs.charge_mode_label,
            outputs.control_voltage,
            outputs.control_charge_current,
            outputs.charge_limitation,
            outputs.control_discharge_current,
            outputs.discharge_limitation,
            outputs.soc_calc,
        );
        if let Some(code) = outputs.error_code {
            log::error!("active error code: {code}");
        }
        if log::log_enabled!(log::Level::Debug) {
            match serde_json::to_string(&outputs) {
                Ok(json) => log::debug!("outputs: {json}"),
                Err(err) => log::warn!("could not serialize outputs: {err}"),
            }
        }

        // back off the poll period when processing keeps exceeding it
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > poll_interval {
            slow_cycles += 1;
            if slow_cycles >= SLOW_CYCLES_BEFORE_BACKOFF {
                poll_interval = (poll_interval * 2.0).min(POLL_INTERVAL_MAX);
                slow_cycles = 0;
                log::warn!("processing too slow, poll interval raised to {poll_interval} s");
            }
        } else {
            slow_cycles = 0;
        }

        cycle += 1;
        time::sleep(Duration::from_secs_f64(poll_interval)).await;
    }
}
