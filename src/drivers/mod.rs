//! CAN controller drivers, receiver threads, and task helpers.

pub mod can_rx;
pub mod mcp2515;
pub mod task_pin;
pub mod twai;
