//! Display-node state: derived gauges and the outward-facing mode selector.

/// What the top display line shows. Cycled by the rider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// "70 km/h 30000.0km"
    Default,
    Trip1,
    Trip2,
    /// "25C 80C 30C 28C"
    Temp,
    /// "-1278Wh +100Wh"
    Power,
    /// "+4208W 108Wh/km"
    Power2,
}

impl DisplayMode {
    pub fn from_index(i: u8) -> Self {
        match i {
            1 => Self::Trip1,
            2 => Self::Trip2,
            3 => Self::Temp,
            4 => Self::Power,
            5 => Self::Power2,
            _ => Self::Default,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Trip1 => 1,
            Self::Trip2 => 2,
            Self::Temp => 3,
            Self::Power => 4,
            Self::Power2 => 5,
        }
    }

    pub fn next(self) -> Self {
        Self::from_index((self.index() + 1) % 6)
    }
}

/// Fully derived UI snapshot, rebuilt as frames arrive. Never persisted.
#[derive(Debug, Clone)]
pub struct VehicleGauges {
    /// Upstream power node stopped sending frames.
    pub offline: bool,
    pub batt_v: f32,
    pub batt_percent: u8,
    /// Pack current in amps, negative while regenerating.
    pub amps: f32,
    /// Cleared for the session when the first electric frame reports an
    /// implausible current (sensor absent or broken).
    pub current_gauges_enabled: bool,
    pub total_m: u32,
    pub trip1_m: u32,
    pub trip2_m: u32,
    pub speed_kmh: u8,
    pub ambient_temp_c: i16,
    pub motor_temp_c: i16,
    pub driver_temp_c: i16,
    pub batt_temp_c: i16,
    pub consumed_wh: f32,
    pub recovered_wh: f32,
    pub wh_per_km: f32,
    /// Raw fault bitmask from the power node, see `velo-power`.
    pub fault_bits: u16,
}

impl Default for VehicleGauges {
    fn default() -> Self {
        Self {
            offline: false,
            batt_v: 0.0,
            batt_percent: 0,
            amps: 0.0,
            current_gauges_enabled: true,
            total_m: 0,
            trip1_m: 0,
            trip2_m: 0,
            speed_kmh: 0,
            ambient_temp_c: 0,
            motor_temp_c: 0,
            driver_temp_c: 0,
            batt_temp_c: 0,
            consumed_wh: 0.0,
            recovered_wh: 0.0,
            wh_per_km: 0.0,
            fault_bits: 0,
        }
    }
}

/// Display/audio collaborator of the aggregation engine.
pub trait Console {
    fn show(&mut self, line1: &str, line2: &str);
    fn beep(&mut self) {}
    /// Local ambient temperature probe, if the panel has one.
    fn ambient_c(&mut self) -> Option<i16> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::DisplayMode;

    #[test]
    fn mode_cycles_through_all_and_wraps() {
        let mut m = DisplayMode::Default;
        for _ in 0..6 {
            m = m.next();
        }
        assert_eq!(m, DisplayMode::Default);
    }
}
