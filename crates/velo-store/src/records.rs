//! Persisted record types and their fixed on-storage layout.
//!
//! Records are packed field by field, little-endian, so the stored bytes do
//! not depend on in-memory struct layout. Layouts only ever grow; the
//! version marker guards against reading an incompatible map.

use serde::Deserialize;

/// Rider-editable vehicle parameters. Immutable during a ride.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VehicleConfig {
    /// Battery pack topology, e.g. 17p20s.
    pub batt_parallel: u8,
    pub batt_series: u8,
    pub cell_capacity_mah: u16,
    pub cell_mv_max: u16,
    pub cell_mv_min: u16,
    /// Flip the sign convention: negative wire current means discharge.
    pub reverse_current: bool,
    pub pulses_per_rev: u16,
    pub dist_per_rev_mm: u16,
    pub motor_temp_alarm_c: u8,
    pub batt_temp_alarm_c: u8,
    pub driver_temp_alarm_c: u8,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            batt_parallel: 17,
            batt_series: 20,
            cell_capacity_mah: 2850,
            cell_mv_max: 4200,
            cell_mv_min: 3200,
            reverse_current: false,
            pulses_per_rev: 16,
            dist_per_rev_mm: 1830,
            motor_temp_alarm_c: 90,
            batt_temp_alarm_c: 60,
            driver_temp_alarm_c: 90,
        }
    }
}

pub(crate) const CONFIG_LEN: usize = 16;

impl VehicleConfig {
    pub(crate) fn to_bytes(&self) -> [u8; CONFIG_LEN] {
        let mut b = [0u8; CONFIG_LEN];
        b[0] = self.batt_parallel;
        b[1] = self.batt_series;
        b[2..4].copy_from_slice(&self.cell_capacity_mah.to_le_bytes());
        b[4..6].copy_from_slice(&self.cell_mv_max.to_le_bytes());
        b[6..8].copy_from_slice(&self.cell_mv_min.to_le_bytes());
        b[8] = self.reverse_current as u8;
        b[9..11].copy_from_slice(&self.pulses_per_rev.to_le_bytes());
        b[11..13].copy_from_slice(&self.dist_per_rev_mm.to_le_bytes());
        b[13] = self.motor_temp_alarm_c;
        b[14] = self.batt_temp_alarm_c;
        b[15] = self.driver_temp_alarm_c;
        b
    }

    pub(crate) fn from_bytes(b: &[u8; CONFIG_LEN]) -> Self {
        Self {
            batt_parallel: b[0],
            batt_series: b[1],
            cell_capacity_mah: u16::from_le_bytes([b[2], b[3]]),
            cell_mv_max: u16::from_le_bytes([b[4], b[5]]),
            cell_mv_min: u16::from_le_bytes([b[6], b[7]]),
            reverse_current: b[8] != 0,
            pulses_per_rev: u16::from_le_bytes([b[9], b[10]]),
            dist_per_rev_mm: u16::from_le_bytes([b[11], b[12]]),
            motor_temp_alarm_c: b[13],
            batt_temp_alarm_c: b[14],
            driver_temp_alarm_c: b[15],
        }
    }
}

/// One resettable trip counter. `baseline_pulses` is a pulse offset against
/// the lifetime total at reset time; for the `total` counter it is the
/// persisted lifetime total itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TripCounter {
    pub baseline_pulses: u32,
    pub travel_time_s: u32,
    pub max_speed_kmh: u8,
    pub consumed_mah: u32,
}

const TRIP_LEN: usize = 13;

impl TripCounter {
    fn pack(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.baseline_pulses.to_le_bytes());
        out[4..8].copy_from_slice(&self.travel_time_s.to_le_bytes());
        out[8] = self.max_speed_kmh;
        out[9..13].copy_from_slice(&self.consumed_mah.to_le_bytes());
    }

    fn unpack(b: &[u8]) -> Self {
        Self {
            baseline_pulses: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            travel_time_s: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            max_speed_kmh: b[8],
            consumed_mah: u32::from_le_bytes([b[9], b[10], b[11], b[12]]),
        }
    }
}

/// Counters that survive power cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VehicleRuntime {
    /// Last seen pack voltage in decivolts. A millivolt field would
    /// overflow u16 above 65.5 V.
    pub last_batt_dv: u16,
    pub display_mode: u8,
    pub total: TripCounter,
    pub trip1: TripCounter,
    pub trip2: TripCounter,
}

pub(crate) const RUNTIME_LEN: usize = 3 + 3 * TRIP_LEN;

impl VehicleRuntime {
    pub(crate) fn to_bytes(&self) -> [u8; RUNTIME_LEN] {
        let mut b = [0u8; RUNTIME_LEN];
        b[0..2].copy_from_slice(&self.last_batt_dv.to_le_bytes());
        b[2] = self.display_mode;
        self.total.pack(&mut b[3..3 + TRIP_LEN]);
        self.trip1.pack(&mut b[3 + TRIP_LEN..3 + 2 * TRIP_LEN]);
        self.trip2.pack(&mut b[3 + 2 * TRIP_LEN..]);
        b
    }

    pub(crate) fn from_bytes(b: &[u8; RUNTIME_LEN]) -> Self {
        Self {
            last_batt_dv: u16::from_le_bytes([b[0], b[1]]),
            display_mode: b[2],
            total: TripCounter::unpack(&b[3..3 + TRIP_LEN]),
            trip1: TripCounter::unpack(&b[3 + TRIP_LEN..3 + 2 * TRIP_LEN]),
            trip2: TripCounter::unpack(&b[3 + 2 * TRIP_LEN..]),
        }
    }
}
