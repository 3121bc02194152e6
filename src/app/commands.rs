//! Inbound commands to the application service.
//!
//! These represent actions requested by the outside world (operator
//! console, configuration tooling) that the
//! [`AppService`](super::service::AppService) interprets and acts upon.
//! Backend notifications do not pass through here: they reach the gate
//! via the [`BackendBridge`](crate::backend::BackendBridge).

use crate::config::SystemConfig;

/// Commands that external adapters can send into the application core.
#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    /// Local start request.  Accepted only with the battery connected
    /// and the BMS permitting charge.
    OperatorStart,

    /// Local emergency stop.  Closes the gate and pushes the disable
    /// command within the same tick.
    EmergencyStop,

    /// Hot-reload configuration.
    UpdateConfig(SystemConfig),

    /// Persist the current config immediately.
    SaveConfig,
}
