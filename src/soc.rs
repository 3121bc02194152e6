//! State-of-charge derivation.
//!
//! The BMS never reports SOC.  It is reconstructed from the cumulative
//! charge and discharge Ah counters, with the pack capacity inferred from
//! the BMS current limit:
//!
//! | BMS Imax      | Class | Capacity |
//! |---------------|-------|----------|
//! | > 60 A        | High  | 90 Ah    |
//! | > 30 A        | Mid   | 60 Ah    |
//! | otherwise     | Low   | 30 Ah    |

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Vehicle capacity class inferred from the BMS current limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityClass {
    #[default]
    Unknown,
    Low,
    Mid,
    High,
}

/// Imax thresholds and pack sizes for the three vehicle classes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityTiers {
    /// Imax strictly above this selects the high class (A)
    pub high_current_threshold_a: f32,
    /// Imax strictly above this selects the mid class (A)
    pub mid_current_threshold_a: f32,
    pub high_capacity_ah: f32,
    pub mid_capacity_ah: f32,
    pub low_capacity_ah: f32,
    /// Range per remaining Ah (km)
    pub km_per_ah: f32,
}

impl Default for CapacityTiers {
    fn default() -> Self {
        Self {
            high_current_threshold_a: 60.0,
            mid_current_threshold_a: 30.0,
            high_capacity_ah: 90.0,
            mid_capacity_ah: 60.0,
            low_capacity_ah: 30.0,
            km_per_ah: 2.7,
        }
    }
}

impl CapacityTiers {
    pub fn classify(&self, bms_max_current: f32) -> (CapacityClass, f32) {
        if bms_max_current > self.high_current_threshold_a {
            (CapacityClass::High, self.high_capacity_ah)
        } else if bms_max_current > self.mid_current_threshold_a {
            (CapacityClass::Mid, self.mid_capacity_ah)
        } else {
            (CapacityClass::Low, self.low_capacity_ah)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.mid_current_threshold_a >= 0.0
            && self.mid_current_threshold_a < self.high_current_threshold_a)
        {
            return Err(Error::Config("capacity thresholds must satisfy 0 <= mid < high"));
        }
        for cap in [self.low_capacity_ah, self.mid_capacity_ah, self.high_capacity_ah] {
            if !(cap > 0.0) {
                return Err(Error::Config("capacities must be positive"));
            }
        }
        if !(self.km_per_ah >= 0.0) {
            return Err(Error::Config("km_per_ah must be >= 0"));
        }
        Ok(())
    }
}

/// Result of one derivation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocEstimate {
    /// Remaining charge, clamped to `[0, capacity_ah]`.
    pub battery_ah: f32,
    pub capacity_ah: f32,
    /// Clamped to `[0, 100]`.
    pub percent: f32,
    pub range_km: f32,
    pub class: CapacityClass,
}

/// Derive SOC from the Ah counters.
///
/// Returns `None` until a positive charge total has been seen.  A zero
/// discharge total is normal for a fresh pack.
pub fn derive(
    charge_ah: f32,
    discharge_ah: f32,
    bms_max_current: f32,
    tiers: &CapacityTiers,
) -> Option<SocEstimate> {
    if !(charge_ah > 0.0) {
        return None;
    }
    let (class, capacity_ah) = tiers.classify(bms_max_current);
    let battery_ah = (charge_ah - discharge_ah).clamp(0.0, capacity_ah);
    let percent = (battery_ah / capacity_ah * 100.0).clamp(0.0, 100.0);
    Some(SocEstimate {
        battery_ah,
        capacity_ah,
        percent,
        range_km: battery_ah * tiers.km_per_ah,
        class,
    })
}
