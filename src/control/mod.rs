// 控制核心模块
// Control core building blocks: one sub-module per concern

pub mod current;
pub mod error_window;
pub mod protection;
pub mod soc;
pub mod voltage;

pub use current::{CurrentLimiter, CurrentLimits};
pub use error_window::ErrorAccumulator;
pub use soc::{SocEstimator, SocUpdate};
pub use voltage::{ChargeVoltageController, VoltageControl};
