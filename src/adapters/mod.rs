//! Adapters — concrete implementations of the hexagonal port traits.
//!
//! | Adapter      | Implements      | Connects to                   |
//! |--------------|-----------------|-------------------------------|
//! | `backend`    | BackendPort     | backend request channel       |
//! |              | BackendClient   | local-only session backend    |
//! | `can_bus`    | CanBusPort      | TWAI + MCP2515 controllers    |
//! | `log_sink`   | EventSink       | Serial log output             |
//! | `nvs`        | ConfigPort      | NVS / in-memory store         |
//! | `time`       |                 | ESP32 system timer            |

pub mod backend;
pub mod can_bus;
pub mod log_sink;
pub mod nvs;
pub mod time;
