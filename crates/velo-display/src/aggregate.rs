//! Frame-to-gauges aggregation for the display node.
//!
//! [`TelemetryAggregator`] consumes decoded bus frames, maintains the
//! persisted trip counters and derives everything the panel shows. The
//! caller drains inbound frames first and then calls [`TelemetryAggregator::on_tick`]
//! with the local millisecond clock; all periodic work (rendering, watchdogs,
//! energy folding, persistence) hangs off internal timers.

use tracing::warn;

use velo_proto::clock::{pulse_delta, timestamp_delta, PeriodicTimer};
use velo_proto::wire::{BusMessage, ElectricMsg, MotionMsg};
use velo_store::{NvStorage, Store, TripCounter, VehicleConfig, VehicleRuntime};

use crate::panel;
use crate::state::{Console, DisplayMode, VehicleGauges};

const UI_PERIOD_MS: u32 = 500;
const SECOND_PERIOD_MS: u32 = 1_000;
const ENERGY_PERIOD_MS: u32 = 10_000;
const AMBIENT_PERIOD_MS: u32 = 30_000;

/// Seconds without any frame before the power node counts as offline.
const OFFLINE_AFTER_S: u32 = 3;
/// Seconds of standstill before the idle reminder beep.
const INACTIVITY_BEEP_S: u32 = 60;
/// A first current reading beyond this means the sensor is absent or broken.
const CURRENT_PLAUSIBLE_MAX_A: f32 = 30.0;

/// Resettable trip selector for [`TelemetryAggregator::reset_trip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trip {
    One,
    Two,
}

/// Convert lifetime wheel pulses to meters.
///
/// Stays in u32 on purpose: full revolutions first, then millimeters. Once
/// `revs * dist_per_rev_mm` would overflow, the division by 1000 moves in
/// front of the multiplication and resolution drops to whole kilometers of
/// revolutions, which is fine at those distances.
pub fn pulses_to_m(pulses: u32, pulses_per_rev: u16, dist_per_rev_mm: u16) -> u32 {
    if pulses_per_rev == 0 {
        return 0;
    }
    let revs = pulses / pulses_per_rev as u32;
    let dpr = dist_per_rev_mm as u32;
    if dpr != 0 && revs > u32::MAX / dpr {
        (revs / 1000) * dpr
    } else {
        revs * dpr / 1000
    }
}

pub struct TelemetryAggregator {
    cfg: VehicleConfig,
    runtime: VehicleRuntime,
    gauges: VehicleGauges,
    mode: DisplayMode,

    /// Wheel pulses accumulated this session, on top of the persisted
    /// lifetime baseline.
    session_pulses: u32,
    prev_motion: Option<(u16, u32)>,
    prev_electric_ts: Option<u16>,

    consumed_ws: f32,
    recovered_ws: f32,

    inactivity_s: u32,
    any_movement: bool,
    upstream_watchdog: u32,

    ui: PeriodicTimer,
    second: PeriodicTimer,
    energy: PeriodicTimer,
    ambient: PeriodicTimer,
}

impl TelemetryAggregator {
    pub fn new(cfg: VehicleConfig, runtime: VehicleRuntime) -> Self {
        let mode = DisplayMode::from_index(runtime.display_mode);
        let mut agg = Self {
            cfg,
            runtime,
            gauges: VehicleGauges::default(),
            mode,
            session_pulses: 0,
            prev_motion: None,
            prev_electric_ts: None,
            consumed_ws: 0.0,
            recovered_ws: 0.0,
            inactivity_s: 0,
            any_movement: false,
            upstream_watchdog: 0,
            ui: PeriodicTimer::new(UI_PERIOD_MS),
            second: PeriodicTimer::new(SECOND_PERIOD_MS),
            energy: PeriodicTimer::new(ENERGY_PERIOD_MS),
            ambient: PeriodicTimer::new(AMBIENT_PERIOD_MS),
        };
        agg.refresh_distances();
        agg
    }

    pub fn gauges(&self) -> &VehicleGauges {
        &self.gauges
    }

    pub fn runtime(&self) -> &VehicleRuntime {
        &self.runtime
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn render_lines(&self) -> (String, String) {
        panel::render(&self.gauges, self.mode)
    }

    /// Advance to the next display mode and remember it in the runtime
    /// record so it survives the next inactivity save.
    pub fn next_display_mode(&mut self) -> DisplayMode {
        self.mode = self.mode.next();
        self.runtime.display_mode = self.mode.index();
        self.mode
    }

    /// Restart a trip counter from the current lifetime pulse count.
    pub fn reset_trip(&mut self, which: Trip) {
        let lifetime = self.lifetime_pulses();
        let trip = match which {
            Trip::One => &mut self.runtime.trip1,
            Trip::Two => &mut self.runtime.trip2,
        };
        *trip = TripCounter {
            baseline_pulses: lifetime,
            ..TripCounter::default()
        };
        self.refresh_distances();
    }

    pub fn on_frame(&mut self, msg: BusMessage) {
        self.upstream_watchdog = 0;
        match msg {
            BusMessage::Electric(e) => self.on_electric(e),
            BusMessage::Motion(m) => self.on_motion(m),
            BusMessage::SensorBlock(s) => {
                self.gauges.motor_temp_c = s.motor_temp_c;
                self.gauges.driver_temp_c = s.driver_temp_c;
                self.gauges.batt_temp_c = s.battery_temp_c;
            }
        }
    }

    /// Periodic work. Call after draining all pending frames.
    pub fn on_tick<S: NvStorage>(
        &mut self,
        now_ms: u32,
        store: &mut Store<S>,
        console: &mut dyn Console,
    ) {
        if self.ui.fire(now_ms) {
            self.gauges.offline = self.upstream_watchdog > OFFLINE_AFTER_S;
            let (line1, line2) = panel::render(&self.gauges, self.mode);
            console.show(&line1, &line2);

            if self.gauges.speed_kmh != 0 {
                self.inactivity_s = 0;
                self.any_movement = true;
            }
        }

        if self.second.fire(now_ms) {
            self.upstream_watchdog = self.upstream_watchdog.saturating_add(1);

            if self.gauges.speed_kmh == 0 {
                self.inactivity_s = self.inactivity_s.saturating_add(1);
            } else {
                for trip in [
                    &mut self.runtime.total,
                    &mut self.runtime.trip1,
                    &mut self.runtime.trip2,
                ] {
                    trip.travel_time_s = trip.travel_time_s.saturating_add(1);
                }
            }

            // Exactly once per stop, one second after the wheel stops.
            if self.inactivity_s == 1 && self.any_movement {
                self.persist(store);
            }
            if self.inactivity_s == INACTIVITY_BEEP_S && self.any_movement {
                console.beep();
            }
        }

        if self.energy.fire(now_ms) {
            self.fold_energy();
        }

        if self.ambient.fire(now_ms) {
            if let Some(t) = console.ambient_c() {
                self.gauges.ambient_temp_c = t;
            }
        }
    }

    fn on_electric(&mut self, e: ElectricMsg) {
        let volts = e.voltage_dv as f32 / 10.0;
        let mut amps = e.current_da as f32 / 10.0;
        if self.cfg.reverse_current {
            amps = -amps;
        }

        self.gauges.batt_v = volts;
        self.gauges.amps = amps;
        self.gauges.fault_bits = e.faults;
        self.runtime.last_batt_dv = e.voltage_dv;

        let series = self.cfg.batt_series as f32;
        let pack_min_v = series * self.cfg.cell_mv_min as f32 / 1000.0;
        let pack_max_v = series * self.cfg.cell_mv_max as f32 / 1000.0;
        if pack_max_v > pack_min_v {
            let frac = (volts - pack_min_v) / (pack_max_v - pack_min_v);
            self.gauges.batt_percent = (100.0 * frac.clamp(0.0, 1.0)) as u8;
        }

        match self.prev_electric_ts {
            None => {
                if amps.abs() > CURRENT_PLAUSIBLE_MAX_A {
                    warn!(amps, "implausible first current reading, disabling current gauges");
                    self.gauges.current_gauges_enabled = false;
                }
            }
            Some(prev) => {
                let dt_ms = timestamp_delta(prev, e.timestamp);
                let ws = amps * volts * dt_ms as f32 / 1000.0;
                if ws > 0.0 {
                    self.consumed_ws += ws;
                } else if ws < 0.0 {
                    self.recovered_ws += -ws;
                }
            }
        }
        self.prev_electric_ts = Some(e.timestamp);
    }

    fn on_motion(&mut self, m: MotionMsg) {
        let Some((prev_ts, prev_pulses)) = self.prev_motion else {
            // No baseline yet; the power node may have been up for a while.
            self.prev_motion = Some((m.timestamp, m.total_pulses));
            return;
        };
        self.prev_motion = Some((m.timestamp, m.total_pulses));

        let dp = pulse_delta(prev_pulses, m.total_pulses);
        let dt_ms = timestamp_delta(prev_ts, m.timestamp).max(1);
        self.session_pulses = self.session_pulses.wrapping_add(dp);

        let ppr = self.cfg.pulses_per_rev.max(1) as u64;
        let delta_mm = dp as u64 * self.cfg.dist_per_rev_mm as u64 / ppr;
        let speed = (36 * delta_mm / (10 * dt_ms as u64)).min(u8::MAX as u64) as u8;
        self.gauges.speed_kmh = speed;

        for trip in [
            &mut self.runtime.total,
            &mut self.runtime.trip1,
            &mut self.runtime.trip2,
        ] {
            if speed > trip.max_speed_kmh {
                trip.max_speed_kmh = speed;
            }
        }

        self.refresh_distances();
    }

    fn lifetime_pulses(&self) -> u32 {
        self.runtime.total.baseline_pulses.wrapping_add(self.session_pulses)
    }

    fn refresh_distances(&mut self) {
        let lifetime = self.lifetime_pulses();
        let ppr = self.cfg.pulses_per_rev;
        let dpr = self.cfg.dist_per_rev_mm;
        self.gauges.total_m = pulses_to_m(lifetime, ppr, dpr);
        self.gauges.trip1_m =
            pulses_to_m(lifetime.wrapping_sub(self.runtime.trip1.baseline_pulses), ppr, dpr);
        self.gauges.trip2_m =
            pulses_to_m(lifetime.wrapping_sub(self.runtime.trip2.baseline_pulses), ppr, dpr);
    }

    /// Save the runtime record with the session pulses folded into the
    /// lifetime baseline, then restore the in-memory baseline: the ride may
    /// continue and distances keep building on the session counter, so a
    /// later save must not count these pulses twice. Also called by the
    /// host on orderly shutdown.
    pub fn persist<S: NvStorage>(&mut self, store: &mut Store<S>) {
        let saved = self.runtime.total.baseline_pulses;
        self.runtime.total.baseline_pulses = saved.wrapping_add(self.session_pulses);
        if let Err(err) = store.save_runtime(&self.runtime) {
            warn!(%err, "saving runtime counters failed");
        }
        self.runtime.total.baseline_pulses = saved;
    }

    fn fold_energy(&mut self) {
        let traveled_km = self.gauges.total_m as f32 / 1000.0;
        if traveled_km <= 0.01 {
            return;
        }

        self.gauges.consumed_wh += self.consumed_ws / 3600.0;
        self.gauges.recovered_wh += self.recovered_ws / 3600.0;
        self.gauges.wh_per_km =
            (self.gauges.consumed_wh - self.gauges.recovered_wh) / traveled_km;

        if self.gauges.batt_v > 1.0 {
            // Ws / V = As, /3.6 scales to mAh.
            let mah = (self.consumed_ws / (3.6 * self.gauges.batt_v)) as u32;
            for trip in [
                &mut self.runtime.total,
                &mut self.runtime.trip1,
                &mut self.runtime.trip2,
            ] {
                trip.consumed_mah = trip.consumed_mah.saturating_add(mah);
            }
        }

        self.consumed_ws = 0.0;
        self.recovered_ws = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velo_proto::clock::wire_timestamp;
    use velo_proto::wire::SensorBlockMsg;
    use velo_store::{MemStorage, DEVICE_SIZE};

    #[derive(Default)]
    struct MockConsole {
        beeps: u32,
        last: Option<(String, String)>,
    }

    impl Console for MockConsole {
        fn show(&mut self, line1: &str, line2: &str) {
            self.last = Some((line1.to_string(), line2.to_string()));
        }
        fn beep(&mut self) {
            self.beeps += 1;
        }
        fn ambient_c(&mut self) -> Option<i16> {
            Some(25)
        }
    }

    fn electric(ts: u16, voltage_dv: u16, current_da: i16) -> BusMessage {
        BusMessage::Electric(ElectricMsg {
            timestamp: ts,
            voltage_dv,
            current_da,
            faults: 0,
            seq_id: 0,
        })
    }

    fn motion(ts: u16, total_pulses: u32) -> BusMessage {
        BusMessage::Motion(MotionMsg {
            timestamp: ts,
            total_pulses,
            seq_id: 0,
        })
    }

    fn fresh() -> (TelemetryAggregator, Store<MemStorage>) {
        let cfg = VehicleConfig::default();
        let mut store = Store::new(MemStorage::new(DEVICE_SIZE));
        let rt = store.bootstrap(&cfg).unwrap();
        (TelemetryAggregator::new(cfg, rt), store)
    }

    fn in_mode(mode: DisplayMode) -> TelemetryAggregator {
        let rt = VehicleRuntime {
            display_mode: mode.index(),
            ..VehicleRuntime::default()
        };
        TelemetryAggregator::new(VehicleConfig::default(), rt)
    }

    #[test]
    fn pulses_to_m_is_accurate_at_100_km() {
        // 100 km at 16 pulses per 1830 mm revolution.
        assert_eq!(pulses_to_m(874_316, 16, 1830), 99_998);
    }

    #[test]
    fn pulses_to_m_switches_order_before_overflow() {
        // ~5000 km: revs * 1830 would overflow u32.
        let pulses = 43_715_840;
        let m = pulses_to_m(pulses, 16, 1830);
        assert!((m as i64 - 5_000_000).abs() < 1000, "got {m}");
    }

    #[test]
    fn power_panel_scenarios() {
        let mut agg = in_mode(DisplayMode::Power2);

        agg.on_frame(electric(0, 840, 10));
        assert_eq!(agg.render_lines(), (" 84.0W    0Wh/km".into(), "84.0V 100%  1.0A".into()));

        agg.on_frame(electric(50, 840, 100));
        assert_eq!(agg.render_lines(), ("  840W    0Wh/km".into(), "84.0V 100% 10.0A".into()));

        agg.on_frame(electric(100, 840, 8000));
        assert_eq!(agg.render_lines(), ("  67kW    0Wh/km".into(), "84.0V 100%  800A".into()));
    }

    #[test]
    fn regenerative_current_renders_plus_and_zero_percent() {
        let mut agg = in_mode(DisplayMode::Power2);
        agg.on_frame(electric(0, 600, -1));
        assert_eq!(agg.render_lines(), ("+ 6.0W    0Wh/km".into(), "60.0V   0%  0.1A".into()));
    }

    #[test]
    fn percentage_clamps_at_both_ends() {
        let (mut agg, _) = fresh();
        agg.on_frame(electric(0, 900, 0));
        assert_eq!(agg.gauges().batt_percent, 100);
        agg.on_frame(electric(50, 500, 0));
        assert_eq!(agg.gauges().batt_percent, 0);
        agg.on_frame(electric(100, 725, 0));
        assert_eq!(agg.gauges().batt_percent, 42);
    }

    #[test]
    fn reverse_current_flips_sign() {
        let cfg = VehicleConfig {
            reverse_current: true,
            ..VehicleConfig::default()
        };
        let mut agg = TelemetryAggregator::new(cfg, VehicleRuntime::default());
        agg.on_frame(electric(0, 840, 100));
        assert_eq!(agg.gauges().amps, -10.0);
    }

    #[test]
    fn implausible_first_current_disables_gauges_for_good() {
        let (mut agg, _) = fresh();
        agg.on_frame(electric(0, 840, 400));
        assert!(!agg.gauges().current_gauges_enabled);
        agg.on_frame(electric(50, 840, 10));
        assert!(!agg.gauges().current_gauges_enabled);
    }

    #[test]
    fn plausible_first_current_keeps_gauges() {
        let (mut agg, _) = fresh();
        agg.on_frame(electric(0, 840, 299));
        assert!(agg.gauges().current_gauges_enabled);
    }

    #[test]
    fn sensor_block_fills_temperatures() {
        let (mut agg, _) = fresh();
        agg.on_frame(BusMessage::SensorBlock(SensorBlockMsg {
            motor_temp_c: 80,
            driver_temp_c: 45,
            battery_temp_c: -5,
        }));
        assert_eq!(agg.gauges().motor_temp_c, 80);
        assert_eq!(agg.gauges().driver_temp_c, 45);
        assert_eq!(agg.gauges().batt_temp_c, -5);
    }

    #[test]
    fn speed_and_distance_from_motion_deltas() {
        let (mut agg, _) = fresh();
        // 16 pulses per 500 ms at 16 ppr / 1830 mm: one rev per half second.
        agg.on_frame(motion(0, 1000));
        agg.on_frame(motion(500, 1016));
        assert_eq!(agg.gauges().speed_kmh, 13);
        // 16 pulses = 1 rev = 1.83 m, rounded down.
        assert_eq!(agg.gauges().total_m, 1);
        agg.on_frame(motion(1000, 1016));
        assert_eq!(agg.gauges().speed_kmh, 0);
    }

    #[test]
    fn first_motion_frame_only_sets_the_baseline() {
        let (mut agg, _) = fresh();
        // Power node was up long before us; no phantom distance.
        agg.on_frame(motion(4000, 5_000_000));
        assert_eq!(agg.gauges().speed_kmh, 0);
        assert_eq!(agg.gauges().total_m, 0);
    }

    #[test]
    fn trip_reset_zeroes_one_counter_only() {
        let (mut agg, _) = fresh();
        agg.on_frame(motion(0, 0));
        agg.on_frame(motion(500, 3200));
        let before = agg.gauges().trip1_m;
        assert!(before > 300);
        assert_eq!(agg.gauges().trip2_m, before);
        agg.reset_trip(Trip::One);
        assert_eq!(agg.gauges().trip1_m, 0);
        assert_eq!(agg.gauges().trip2_m, before);
        assert_eq!(agg.gauges().total_m, before);
    }

    #[test]
    fn consumption_settles_near_64_wh_per_km() {
        // One simulated hour at 840 W and one wheel revolution per half
        // second: 840 Wh over ~13.2 km.
        let (mut agg, mut store) = fresh();
        let mut console = MockConsole::default();
        let mut pulses = 0u32;
        for i in 0..=7200u32 {
            let now = i * 500;
            let ts = wire_timestamp(now);
            agg.on_frame(electric(ts, 840, 100));
            agg.on_frame(motion(ts, pulses));
            pulses += 16;
            agg.on_tick(now, &mut store, &mut console);
        }
        assert_eq!(agg.gauges().total_m, 13_176);
        assert!((agg.gauges().consumed_wh - 840.0).abs() < 1.0);
        assert!((agg.gauges().wh_per_km - 63.75).abs() < 0.5);
        assert!(agg.runtime().total.consumed_mah > 9_500);
        assert_eq!(agg.runtime().total.max_speed_kmh, 13);
    }

    #[test]
    fn energy_splits_into_consumed_and_recovered() {
        let (mut agg, mut store) = fresh();
        let mut console = MockConsole::default();
        // Enough distance for the fold to run.
        agg.on_frame(motion(0, 0));
        agg.on_frame(motion(500, 3200));
        let mut ts = 0u32;
        agg.on_frame(electric(wire_timestamp(ts), 840, 0));
        for _ in 0..20 {
            ts += 500;
            agg.on_frame(electric(wire_timestamp(ts), 840, 100));
        }
        for _ in 0..20 {
            ts += 500;
            agg.on_frame(electric(wire_timestamp(ts), 840, -100));
        }
        agg.on_tick(20_000, &mut store, &mut console);
        let g = agg.gauges();
        assert!((g.consumed_wh - 8_400.0 / 3_600.0).abs() < 0.01);
        assert!((g.recovered_wh - 8_400.0 / 3_600.0).abs() < 0.01);
        assert!(g.wh_per_km.abs() < 0.01);
    }

    #[test]
    fn inactivity_save_folds_baseline_without_double_counting() {
        let (mut agg, mut store) = fresh();
        let mut console = MockConsole::default();
        let mut now = 0u32;
        let mut pulses = 0u32;

        let mut ride = |agg: &mut TelemetryAggregator,
                        store: &mut Store<MemStorage>,
                        console: &mut MockConsole,
                        frames: u32,
                        moving: bool| {
            for _ in 0..frames {
                now += 500;
                if moving {
                    pulses += 16;
                }
                agg.on_frame(motion(wire_timestamp(now), pulses));
                agg.on_tick(now, store, console);
            }
        };

        // The first frame only sets the pulse baseline, so ten frames of
        // 16 pulses accumulate 144.
        ride(&mut agg, &mut store, &mut console, 10, true);
        ride(&mut agg, &mut store, &mut console, 6, false);
        let (_, rt) = store.load().unwrap();
        assert_eq!(rt.total.baseline_pulses, 144);

        // Ride continues on the in-memory baseline; the next save must not
        // count the first leg twice.
        ride(&mut agg, &mut store, &mut console, 10, true);
        ride(&mut agg, &mut store, &mut console, 6, false);
        let (_, rt) = store.load().unwrap();
        assert_eq!(rt.total.baseline_pulses, 304);
        assert_eq!(agg.runtime().total.baseline_pulses, 0);
        assert_eq!(agg.gauges().total_m, pulses_to_m(304, 16, 1830));
    }

    #[test]
    fn long_standstill_beeps_once() {
        let (mut agg, mut store) = fresh();
        let mut console = MockConsole::default();
        let mut now = 0u32;
        // Brief movement, then a long stop.
        agg.on_frame(motion(0, 0));
        agg.on_frame(motion(500, 160));
        agg.on_tick(500, &mut store, &mut console);
        agg.on_frame(motion(1000, 160));
        for _ in 0..140 {
            now += 500;
            agg.on_tick(now, &mut store, &mut console);
        }
        assert_eq!(console.beeps, 1);
    }

    #[test]
    fn upstream_silence_flips_offline_and_recovers() {
        let (mut agg, mut store) = fresh();
        let mut console = MockConsole::default();
        agg.on_frame(electric(0, 840, 0));
        let mut now = 0u32;
        for _ in 0..10 {
            now += 500;
            agg.on_tick(now, &mut store, &mut console);
        }
        assert!(agg.gauges().offline);
        assert_eq!(console.last.as_ref().unwrap().1, "OFFLINE!");

        agg.on_frame(electric(100, 840, 0));
        now += 500;
        agg.on_tick(now, &mut store, &mut console);
        assert!(!agg.gauges().offline);
    }

    #[test]
    fn ambient_probe_read_every_30_s() {
        let (mut agg, mut store) = fresh();
        let mut console = MockConsole::default();
        agg.on_tick(29_999, &mut store, &mut console);
        assert_eq!(agg.gauges().ambient_temp_c, 0);
        agg.on_tick(30_000, &mut store, &mut console);
        assert_eq!(agg.gauges().ambient_temp_c, 25);
    }

    #[test]
    fn display_mode_persists_in_runtime_record() {
        let (mut agg, _) = fresh();
        agg.next_display_mode();
        agg.next_display_mode();
        assert_eq!(agg.display_mode(), DisplayMode::Trip2);
        assert_eq!(agg.runtime().display_mode, 2);
    }
}
