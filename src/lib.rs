// 电池充放电控制核心
// Charge/discharge control core for battery packs: CVL state machine,
// coulomb-counting SoC estimation, current limiting and protection mapping

pub mod config;
pub mod control;
pub mod core;
pub mod interp;
pub mod types;

pub use config::{ConfigIssue, ControlConfig};
pub use core::{BatteryController, ERROR_CODE_INTERNAL_FAILURE};
pub use types::{
    CellReading, ChargeMode, ControlOutputs, ModeFlags, PackSnapshot, PersistedState,
    ProtectionFlags, Severity,
};
