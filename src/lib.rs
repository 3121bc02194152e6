//! EVSE charge controller firmware library.
//!
//! Exposes the domain and driver modules for integration testing and the
//! firmware binary. All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module.

#![deny(unused_must_use)]

pub mod app;
pub mod backend;
pub mod can;
pub mod channels;
pub mod config;
pub mod connectivity;
pub mod console;
pub mod diagnostics;
pub mod energy;
pub mod gate;
pub mod health;
pub mod pins;
pub mod protocol;
pub mod safety;
pub mod scheduler;
pub mod soc;
pub mod store;
pub mod telemetry;

pub mod error;

// Controller drivers and adapters; the ESP-IDF paths are cfg-guarded
// inside, with simulation backends for host builds.
pub mod adapters;
pub mod drivers;

mod esp_link_shims;
