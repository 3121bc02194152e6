//! Charger module dialect.
//!
//! Multi-function group frames carry `0x01, func, ..` with the value in a
//! fixed byte range selected by the function code.  Terminal frames are
//! periodic and self-describing.
//!
//! | Frame            | Min len | Layout                                           |
//! |------------------|---------|--------------------------------------------------|
//! | control response | 8       | func 0x32: b3==0 ⇒ ON; 0x00/0x03: BE u32 @4..8   |
//! | telemetry resp.  | 8       | 0x84 BE u32/1024, 0x82 BE u16 @6..8, 0x80 ×0.001 |
//! | terminal power   | 8       | BE f32 volts @0..4, BE f32 amps @4..8            |
//! | terminal status  | 8       | (b6, b7) = (3,1) idle, (3,2) charging            |
//! | heartbeat        | 8       | b4 & 0x08 ⇒ alive                                |

use crate::can::ids::{self, func};
use crate::can::CanFrame;
use crate::config::ChargerCurrentScale;
use crate::error::DecodeError;

use super::{be_f32, be_u16, be_u32, require};

/// Control group fixed-point scales.
pub const VOLTAGE_SCALE: f32 = 1024.0;
pub const CURRENT_LIMIT_SCALE: f32 = 30.5;
/// Temperature field scale (°C per LSB).
pub const TEMPERATURE_SCALE: f32 = 0.001;

const GROUP_LEN: u8 = 8;
const TERMINAL_LEN: u8 = 8;
const HEARTBEAT_LEN: u8 = 8;

const HEARTBEAT_ALIVE_BIT: u8 = 0x08;

/// Output stage as reported by function 0x32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChargerStatus {
    #[default]
    Unknown,
    On,
    Off,
}

/// Charging state at the point of delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalStatus {
    #[default]
    Unknown,
    NotCharging,
    Charging,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlReading {
    Status(ChargerStatus),
    VoltageLimit(f32),
    CurrentLimit(f32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryReading {
    OutputVoltage(f32),
    OutputCurrent(f32),
    Metric79(u16),
    Temperature(f32),
    Metric83(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TerminalPower {
    pub volts: f32,
    pub amps: f32,
}

impl TerminalPower {
    pub fn watts(&self) -> f32 {
        self.volts * self.amps
    }
}

// ── Parsers ───────────────────────────────────────────────────

pub fn parse_control(frame: &CanFrame) -> Result<ControlReading, DecodeError> {
    let d = require(frame, GROUP_LEN)?;
    let raw = be_u32(d, 4);
    match d[1] {
        func::ENABLE => Ok(ControlReading::Status(if d[3] == 0x00 {
            ChargerStatus::On
        } else {
            ChargerStatus::Off
        })),
        func::VOLTAGE_LIMIT => Ok(ControlReading::VoltageLimit(raw as f32 / VOLTAGE_SCALE)),
        func::CURRENT_LIMIT => Ok(ControlReading::CurrentLimit(raw as f32 / CURRENT_LIMIT_SCALE)),
        other => Err(DecodeError::UnknownFunction(other)),
    }
}

pub fn parse_telemetry(
    frame: &CanFrame,
    current_scale: ChargerCurrentScale,
) -> Result<TelemetryReading, DecodeError> {
    let d = require(frame, GROUP_LEN)?;
    match d[1] {
        func::OUTPUT_VOLTAGE => Ok(TelemetryReading::OutputVoltage(
            be_u32(d, 4) as f32 / VOLTAGE_SCALE,
        )),
        func::OUTPUT_CURRENT => Ok(TelemetryReading::OutputCurrent(
            f32::from(be_u16(d, 6)) / current_scale.divisor(),
        )),
        func::METRIC_79 => Ok(TelemetryReading::Metric79(be_u16(d, 6))),
        func::TEMPERATURE => Ok(TelemetryReading::Temperature(
            f32::from(be_u16(d, 6)) * TEMPERATURE_SCALE,
        )),
        func::METRIC_83 => Ok(TelemetryReading::Metric83(be_f32(d, 4))),
        other => Err(DecodeError::UnknownFunction(other)),
    }
}

pub fn parse_terminal_power(frame: &CanFrame) -> Result<TerminalPower, DecodeError> {
    let d = require(frame, TERMINAL_LEN)?;
    Ok(TerminalPower {
        volts: be_f32(d, 0),
        amps: be_f32(d, 4),
    })
}

pub fn parse_terminal_status(frame: &CanFrame) -> Result<TerminalStatus, DecodeError> {
    let d = require(frame, TERMINAL_LEN)?;
    Ok(match (d[6], d[7]) {
        (0x03, 0x01) => TerminalStatus::NotCharging,
        (0x03, 0x02) => TerminalStatus::Charging,
        _ => TerminalStatus::Unknown,
    })
}

/// Returns the alive flag.
pub fn parse_heartbeat(frame: &CanFrame) -> Result<bool, DecodeError> {
    let d = require(frame, HEARTBEAT_LEN)?;
    Ok(d[4] & HEARTBEAT_ALIVE_BIT != 0)
}

// ── Encoders ──────────────────────────────────────────────────

fn group_payload(function: u8) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0] = 0x01;
    data[1] = function;
    data
}

/// Enable command on the control group.  Byte 3: 0x00 enable, 0x01 disable.
pub fn enable_command(enable: bool) -> CanFrame {
    let mut data = group_payload(func::ENABLE);
    data[2] = 0x00;
    data[3] = if enable { 0x00 } else { 0x01 };
    CanFrame::extended(ids::CTRL_REQUEST, &data)
}

/// Voltage (0x00) or current (0x03) setpoint with its raw fixed-point value.
pub fn setpoint_request(function: u8, raw: u32) -> CanFrame {
    let mut data = group_payload(function);
    data[4..8].copy_from_slice(&raw.to_be_bytes());
    CanFrame::extended(ids::CTRL_REQUEST, &data)
}

/// Plain query on any group.
pub fn query(request_id: u32, function: u8) -> CanFrame {
    CanFrame::extended(request_id, &group_payload(function))
}

/// BMS voltage limit → control group raw value.
pub fn voltage_setpoint_raw(volts: f32) -> u32 {
    (volts * VOLTAGE_SCALE).round() as u32
}

/// BMS current limit → control group raw value.
pub fn current_setpoint_raw(amps: f32) -> u32 {
    (amps * CURRENT_LIMIT_SCALE).round() as u32
}
