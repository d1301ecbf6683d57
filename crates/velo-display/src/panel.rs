//! 16x2 character panel rendering.
//!
//! Values are right-aligned at fixed unit positions, switching precision by
//! magnitude and falling back to a `k` suffix past 1000, the way small trip
//! computers do.

use crate::state::{DisplayMode, VehicleGauges};

const WIDTH: usize = 16;

fn put_str(line: &mut [u8; WIDTH], s: &str, at: usize) {
    for (i, b) in s.bytes().enumerate() {
        if at + i < WIDTH {
            line[at + i] = b;
        }
    }
}

/// Right-aligned engineering value ending just before `last`; `unit` lands
/// at `last`.
fn put_unit(line: &mut [u8; WIDTH], v: f32, unit: u8, last: usize) {
    if v < 0.1 {
        line[last - 1] = b'0';
    } else if v < 10.0 {
        put_str(line, &format!("{v:.1}"), last - 3);
    } else if v < 100.0 {
        put_str(line, &format!("{v:.1}"), last - 4);
    } else if v < 1000.0 {
        put_str(line, &format!("{v:.0}"), last - 3);
    } else if v < 10_000.0 {
        put_str(line, &format!("{:.1}k", v / 1000.0), last - 4);
    } else {
        put_str(line, &format!("{:.0}k", v / 1000.0), last - 3);
    }
    line[last] = unit;
}

fn put_unit_int(line: &mut [u8; WIDTH], v: u32, unit: u8, last: usize) {
    if v < 10 {
        put_str(line, &format!("{v}"), last - 1);
    } else if v < 100 {
        put_str(line, &format!("{v}"), last - 2);
    } else if v < 1000 {
        put_str(line, &format!("{v}"), last - 3);
    }
    line[last] = unit;
}

fn blank() -> [u8; WIDTH] {
    [b' '; WIDTH]
}

fn to_string(line: [u8; WIDTH]) -> String {
    String::from_utf8_lossy(&line).into_owned()
}

fn trip_line(speed: u8, dist_m: u32, trip_num: u8) -> String {
    let d_km = dist_m / 1000;
    let d_01 = (dist_m % 1000) / 100;
    if d_km < 10_000 {
        if trip_num == 0 {
            format!("{speed} km/h {d_km}.{d_01}km")
        } else {
            format!("{speed} km/h {d_km}.{d_01}km-{trip_num}")
        }
    } else if trip_num == 0 {
        format!("{speed} km/h {d_km}km")
    } else {
        format!("{speed} km/h {d_km}km-{trip_num}")
    }
}

/// Render both panel lines for the given mode.
pub fn render(g: &VehicleGauges, mode: DisplayMode) -> (String, String) {
    let line2 = if g.offline {
        "OFFLINE!".to_string()
    } else if g.current_gauges_enabled {
        let mut l = blank();
        put_unit(&mut l, g.batt_v, b'V', 4);
        put_unit_int(&mut l, g.batt_percent as u32, b'%', 9);
        put_unit(&mut l, g.amps.abs(), b'A', 15);
        to_string(l)
    } else {
        format!("{:.1}V {}% {}C", g.batt_v, g.batt_percent, g.ambient_temp_c)
    };

    let line1 = match mode {
        DisplayMode::Trip1 => trip_line(g.speed_kmh, g.trip1_m, 1),
        DisplayMode::Trip2 => trip_line(g.speed_kmh, g.trip2_m, 2),
        DisplayMode::Temp => format!(
            "{}C {}C {}C {}C",
            g.ambient_temp_c,
            g.motor_temp_c.max(0),
            g.driver_temp_c.max(0),
            g.batt_temp_c.max(0)
        ),
        DisplayMode::Power => format!("-{:.1}Wh +{:.1}Wh", g.consumed_wh, g.recovered_wh),
        DisplayMode::Power2 => {
            let mut l = blank();
            put_unit(&mut l, g.amps.abs() * g.batt_v, b'W', 5);
            put_unit(&mut l, g.wh_per_km.max(0.0), b'W', 11);
            put_str(&mut l, "h/km", 12);
            if g.amps < 0.0 {
                // Regenerative braking: energy flowing back into the pack.
                l[0] = b'+';
            }
            to_string(l)
        }
        DisplayMode::Default => trip_line(g.speed_kmh, g.total_m, 0),
    };

    (line1, line2)
}
