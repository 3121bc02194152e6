//! Application core — domain orchestration, zero direct I/O.
//!
//! [`service::AppService`] runs the comm loop: drains the frame rings,
//! supervises both buses, decides connectivity and charger health,
//! drives the charging gate and the polling scheduler.  All interaction
//! with controllers and the backend happens through **port traits**
//! defined in [`ports`], keeping this layer fully testable without real
//! peripherals.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;
