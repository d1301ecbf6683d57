//! Raw ADC samples to physical units, plus the power-on self calibration.
//!
//! Channel order matches the ADC scan sequence of the power board:
//! current shunt, battery temp, driver temp, pack voltage, then the two
//! possible motor temperature sensors (only one is ever populated).

use tracing::{info, warn};

use crate::curve::interp;

pub const ADC_CHANNELS: usize = 6;

pub const CH_CURRENT: usize = 0;
pub const CH_BATT_TEMP: usize = 1;
pub const CH_DRIVER_TEMP: usize = 2;
pub const CH_VOLTAGE: usize = 3;
pub const CH_MOTOR_PTC: usize = 4;
pub const CH_MOTOR_NTC: usize = 5;

const V_REF: f32 = 3.3;
const ADC_RES: f32 = 4096.0;
const V_REF_5V: f32 = 5.0;

const BATT_DIV_R1: f32 = 100_000.0;
const BATT_DIV_R2: f32 = 3_300.0;

// ACS770LCB-100B hall sensor.
const CURRENT_SENS_MV_PER_A: f32 = 20.0;
const CURRENT_SENS_ZERO_V: f32 = V_REF_5V / 2.0;
const CURRENT_DEADZONE_A: f32 = 0.4;
const CURRENT_CAL_WINDOW_V: f32 = 1.0;

const FIXED_TEMP_DIV_R: f32 = 2_200.0;
const MOTOR_PTC_DIV_R: f32 = 17_000.0;
const MOTOR_NTC_DIV_R: f32 = 10_000.0;

/// "No sensor / bad reading" temperature sentinel.
pub const TEMP_NONE: i16 = -1000;
const TEMP_MIN_PLAUSIBLE_V: f32 = 0.5;

// Calibration fault bits, also reported in the electric frame fault field.
pub const FAULT_CURRENT_SENSE: u16 = 0x01;
pub const FAULT_MOTOR_PTC: u16 = 0x02;
pub const FAULT_MOTOR_NTC: u16 = 0x04;
pub const FAULT_BATT_TEMP: u16 = 0x08;
pub const FAULT_DRIVER_TEMP: u16 = 0x10;

// Silicon PTC family on battery and driver (2.2k divider), ohms -> degC.
const PTC_TABLE: &[(f32, f32)] = &[
    (567.0, -40.0),
    (684.0, -20.0),
    (815.0, 0.0),
    (990.0, 25.0),
    (1194.0, 50.0),
    (1421.0, 75.0),
    (1696.0, 100.0),
    (1925.0, 125.0),
    (2211.0, 150.0),
];

// Motor-mounted 10k-class PTC variant (17k divider).
const MOTOR_PTC_TABLE: &[(f32, f32)] = &[
    (5_000.0, -40.0),
    (6_400.0, -20.0),
    (8_100.0, 0.0),
    (10_000.0, 25.0),
    (12_200.0, 50.0),
    (14_700.0, 75.0),
    (17_200.0, 100.0),
    (20_000.0, 125.0),
    (22_900.0, 150.0),
];

// Motor-mounted 10k NTC variant; resistance falls with temperature.
const NTC_TABLE: &[(f32, f32)] = &[
    (680.0, 100.0),
    (1250.0, 80.0),
    (2490.0, 60.0),
    (3600.0, 50.0),
    (5300.0, 40.0),
    (10_000.0, 25.0),
    (17_960.0, 10.0),
    (32_650.0, 0.0),
    (97_070.0, -20.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalPhase {
    /// Sensor identity and zero offset unknown; motor temp reads as none.
    Needed,
    /// One conversion cycle of self tests, entered after the settle window.
    InProgress,
    /// Terminal.
    Done,
}

/// Motor temperature sensor variants, in selection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorSensor {
    Ptc,
    Ntc,
}

const MOTOR_SENSOR_PRIORITY: [MotorSensor; 2] = [MotorSensor::Ptc, MotorSensor::Ntc];

#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub phase: CalPhase,
    pub faults: u16,
    /// Learned sensor output voltage at zero current flow.
    pub current_zero_v: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            phase: CalPhase::Needed,
            faults: 0,
            current_zero_v: CURRENT_SENS_ZERO_V,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Readings {
    pub voltage_dv: u16,
    pub current_da: i16,
    pub battery_temp_c: i16,
    pub driver_temp_c: i16,
    pub motor_temp_c: i16,
}

impl Default for Readings {
    fn default() -> Self {
        Self {
            voltage_dv: 0,
            current_da: 0,
            battery_temp_c: TEMP_NONE,
            driver_temp_c: TEMP_NONE,
            motor_temp_c: TEMP_NONE,
        }
    }
}

pub struct SensorPipeline {
    cal: Calibration,
    /// Measured vs true pack volts, corrects divider tolerance.
    volt_correction: &'static [(f32, f32)],
}

impl Default for SensorPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorPipeline {
    pub fn new() -> Self {
        Self {
            cal: Calibration::default(),
            volt_correction: &[(30.0, 32.5), (60.0, 62.3), (97.0, 100.3)],
        }
    }

    pub fn calibration(&self) -> &Calibration {
        &self.cal
    }

    /// Kick off the self test. Only meaningful after the post-power-up
    /// settle window, while no significant current is being drawn.
    pub fn begin_calibration(&mut self) {
        if self.cal.phase == CalPhase::Needed {
            self.cal.phase = CalPhase::InProgress;
            info!("current sensor calibration started");
        }
    }

    /// One full conversion cycle over all channels. While calibration is in
    /// progress this also runs the self tests and then advances to `Done`.
    pub fn convert(&mut self, raw: &[u16; ADC_CHANNELS]) -> Readings {
        let current_da = self.convert_current(raw[CH_CURRENT]);
        let battery_temp_c = temp_from_divider(raw[CH_BATT_TEMP], FIXED_TEMP_DIV_R, PTC_TABLE);
        let driver_temp_c = temp_from_divider(raw[CH_DRIVER_TEMP], FIXED_TEMP_DIV_R, PTC_TABLE);
        let voltage_dv = self.convert_voltage(raw[CH_VOLTAGE]);

        let motor_temp_c = match self.cal.phase {
            CalPhase::Done => self.motor_temp(raw),
            // Sensor identity not yet established.
            CalPhase::Needed => TEMP_NONE,
            CalPhase::InProgress => {
                self.probe_sensors(raw, battery_temp_c, driver_temp_c);
                TEMP_NONE
            }
        };

        if self.cal.phase == CalPhase::InProgress {
            self.cal.phase = CalPhase::Done;
            info!(faults = format_args!("0x{:02x}", self.cal.faults), "calibration complete");
        }

        Readings {
            voltage_dv,
            current_da,
            battery_temp_c,
            driver_temp_c,
            motor_temp_c,
        }
    }

    fn convert_current(&mut self, adc: u16) -> i16 {
        let v = V_REF * adc as f32 / ADC_RES;

        if self.cal.phase == CalPhase::InProgress {
            if (v - CURRENT_SENS_ZERO_V).abs() > CURRENT_CAL_WINDOW_V {
                // Implausible no-load reading; keep the previous offset.
                self.cal.faults |= FAULT_CURRENT_SENSE;
                warn!(reading_v = v, "current sensor self test failed");
            } else {
                self.cal.current_zero_v = v;
            }
        }

        let mut amps = (v - self.cal.current_zero_v) * 1000.0 / CURRENT_SENS_MV_PER_A;
        if amps.abs() <= CURRENT_DEADZONE_A {
            amps = 0.0;
        }
        (amps * 10.0) as i16
    }

    fn convert_voltage(&self, adc: u16) -> u16 {
        let v = V_REF * adc as f32 / ADC_RES;
        let measured = v * (BATT_DIV_R1 + BATT_DIV_R2) / BATT_DIV_R2;
        let corrected = interp(self.volt_correction, measured);
        (corrected * 10.0) as u16
    }

    fn motor_temp(&self, raw: &[u16; ADC_CHANNELS]) -> i16 {
        for sensor in MOTOR_SENSOR_PRIORITY {
            match sensor {
                MotorSensor::Ptc if self.cal.faults & FAULT_MOTOR_PTC == 0 => {
                    return temp_from_divider(raw[CH_MOTOR_PTC], MOTOR_PTC_DIV_R, MOTOR_PTC_TABLE);
                }
                MotorSensor::Ntc if self.cal.faults & FAULT_MOTOR_NTC == 0 => {
                    return temp_from_divider(raw[CH_MOTOR_NTC], MOTOR_NTC_DIV_R, NTC_TABLE);
                }
                _ => {}
            }
        }
        TEMP_NONE
    }

    fn probe_sensors(&mut self, raw: &[u16; ADC_CHANNELS], batt_c: i16, drv_c: i16) {
        if temp_from_divider(raw[CH_MOTOR_PTC], MOTOR_PTC_DIV_R, MOTOR_PTC_TABLE) == TEMP_NONE {
            self.cal.faults |= FAULT_MOTOR_PTC;
        }
        if temp_from_divider(raw[CH_MOTOR_NTC], MOTOR_NTC_DIV_R, NTC_TABLE) == TEMP_NONE {
            self.cal.faults |= FAULT_MOTOR_NTC;
        }
        if batt_c == TEMP_NONE {
            self.cal.faults |= FAULT_BATT_TEMP;
        }
        if drv_c == TEMP_NONE {
            self.cal.faults |= FAULT_DRIVER_TEMP;
        }
    }
}

fn temp_from_divider(adc: u16, divider_r: f32, table: &[(f32, f32)]) -> i16 {
    let adc_v = V_REF * adc as f32 / ADC_RES;
    if adc_v < TEMP_MIN_PLAUSIBLE_V {
        return TEMP_NONE;
    }
    let rt = adc_v * divider_r / (V_REF_5V - adc_v);
    interp(table, rt) as i16
}
