//! BMS dialect.
//!
//! The vehicle BMS sends one fixed-format limits frame and answers two
//! Ah-total queries.  We send it a feedback frame describing the charger
//! output every 100 ms.

use crate::can::ids;
use crate::can::CanFrame;
use crate::error::DecodeError;

use super::{be_u16, be_u32, require};

/// Limits are transmitted in tenths.
pub const LIMIT_DIVISOR: f32 = 10.0;
/// Ah totals are transmitted in mAh.
pub const AH_SCALE: f32 = 0.001;

const LIMITS_LEN: u8 = 6;
const AH_LEN: u8 = 4;

/// Feedback byte 4 flags.
pub mod flags {
    pub const OVER_TEMPERATURE: u8 = 0x02;
    pub const BATTERY_NOT_CONNECTED: u8 = 0x08;
    pub const COMM_TIMEOUT: u8 = 0x10;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BmsLimits {
    pub max_voltage: f32,
    pub max_current: f32,
    /// Byte 4 == 0x00.
    pub safe_to_charge: bool,
    /// Byte 5 == 0x01.
    pub heating: bool,
}

pub fn parse_limits(frame: &CanFrame) -> Result<BmsLimits, DecodeError> {
    let d = require(frame, LIMITS_LEN)?;
    Ok(BmsLimits {
        max_voltage: f32::from(be_u16(d, 0)) / LIMIT_DIVISOR,
        max_current: f32::from(be_u16(d, 2)) / LIMIT_DIVISOR,
        safe_to_charge: d[4] == 0x00,
        heating: d[5] == 0x01,
    })
}

/// Charge or discharge total, in Ah.
pub fn parse_ah_total(frame: &CanFrame) -> Result<f32, DecodeError> {
    let d = require(frame, AH_LEN)?;
    Ok(be_u32(d, 0) as f32 * AH_SCALE)
}

/// Charger output as seen by the BMS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feedback {
    pub volts: f32,
    pub amps: f32,
    pub flags: u8,
}

impl Feedback {
    pub fn to_frame(&self) -> CanFrame {
        let v = deci_u16(self.volts).to_be_bytes();
        let i = deci_u16(self.amps).to_be_bytes();
        CanFrame::extended(
            ids::CHARGER_FEEDBACK,
            &[v[0], v[1], i[0], i[1], self.flags, 0, 0, 0],
        )
    }
}

/// Round to tenths, clamped to the u16 range.
fn deci_u16(value: f32) -> u16 {
    let raw = (value * 10.0).round();
    if raw.is_nan() {
        0
    } else {
        raw.clamp(0.0, f32::from(u16::MAX)) as u16
    }
}

pub fn charge_ah_request() -> CanFrame {
    CanFrame::extended(ids::CHARGE_AH_REQUEST, &[0u8; 8])
}

pub fn discharge_ah_request() -> CanFrame {
    CanFrame::extended(ids::DISCHARGE_AH_REQUEST, &[0u8; 8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_layout() {
        // 84.0 V (840 = 0x0348), 60.0 A (600 = 0x0258), permit, heating
        let f = CanFrame::extended(ids::BMS_LIMITS, &[0x03, 0x48, 0x02, 0x58, 0x00, 0x01, 0, 0]);
        let l = parse_limits(&f).unwrap();
        assert!((l.max_voltage - 84.0).abs() < 1e-4);
        assert!((l.max_current - 60.0).abs() < 1e-4);
        assert!(l.safe_to_charge);
        assert!(l.heating);
    }

    #[test]
    fn any_nonzero_byte4_forbids_charging() {
        for b4 in [0x01u8, 0x80, 0xFF] {
            let f = CanFrame::extended(ids::BMS_LIMITS, &[0, 0, 0, 0, b4, 0]);
            assert!(!parse_limits(&f).unwrap().safe_to_charge);
        }
    }

    #[test]
    fn ah_total_milliamp_hours() {
        let f = CanFrame::extended(ids::CHARGE_AH_RESPONSE, &15_000u32.to_be_bytes());
        assert!((parse_ah_total(&f).unwrap() - 15.0).abs() < 1e-4);
    }

    #[test]
    fn short_frames_rejected() {
        let f = CanFrame::extended(ids::BMS_LIMITS, &[0, 0, 0, 0, 0]);
        assert_eq!(parse_limits(&f), Err(DecodeError::TooShort { need: 6, got: 5 }));
        let f = CanFrame::extended(ids::CHARGE_AH_RESPONSE, &[0, 0, 1]);
        assert!(parse_ah_total(&f).is_err());
    }

    #[test]
    fn feedback_encodes_and_clamps() {
        let fb = Feedback {
            volts: 72.46,
            amps: -3.0,
            flags: flags::BATTERY_NOT_CONNECTED,
        };
        let f = fb.to_frame();
        assert_eq!(f.id(), ids::CHARGER_FEEDBACK);
        // 724.6 rounds to 725 = 0x02D5
        assert_eq!(f.data(), &[0x02, 0xD5, 0x00, 0x00, 0x08, 0, 0, 0]);

        let big = Feedback { volts: 1.0e6, amps: f32::NAN, flags: 0 }.to_frame();
        assert_eq!(&big.data()[..4], &[0xFF, 0xFF, 0x00, 0x00]);
    }

    #[test]
    fn ah_requests_are_zero_payload() {
        assert_eq!(charge_ah_request().data(), &[0u8; 8]);
        assert_eq!(discharge_ah_request().id(), ids::DISCHARGE_AH_REQUEST);
    }
}
