use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use velo_display::aggregate::TelemetryAggregator;
use velo_display::state::Console;
use velo_power::curve::interp;
use velo_power::pipeline::{
    ADC_CHANNELS, CH_BATT_TEMP, CH_CURRENT, CH_DRIVER_TEMP, CH_MOTOR_PTC, CH_VOLTAGE,
};
use velo_power::scheduler::{FrameSink, PowerNode, SampleError, Sampler};
use velo_proto::wire::{self, BusMessage, Frame, FRAME_LEN};
use velo_store::{FileStorage, Store, StoreError, VehicleConfig, DEVICE_SIZE};

#[derive(Debug, Parser)]
#[command(name = "velo", version, about = "velo - two-node e-bike telemetry")]
struct Cli {
    #[arg(long, default_value = "velo.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sanity-check the config and the storage path.
    Doctor,
    /// Closed-loop simulation of the power node and the display node.
    Run,
    /// Decode one bus frame given as 16 hex characters.
    Decode { frame: String },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    vehicle: VehicleConfig,
    storage: StorageCfg,
    sim: SimCfg,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct StorageCfg {
    path: String,
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self { path: "velo-nv.bin".to_string() }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct SimCfg {
    duration_s: u32,
    seed: u64,
    /// Resting pack voltage fed into the analog model.
    pack_volts: f32,
    cruise_kmh: f32,
    cruise_amps: f32,
    accel_amps: f32,
    regen_amps: f32,
    /// Rider cycle segments, repeated until the duration runs out.
    idle_s: u32,
    accel_s: u32,
    cruise_s: u32,
    brake_s: u32,
    /// Pace the virtual clock at one millisecond per real millisecond.
    realtime: bool,
}

impl Default for SimCfg {
    fn default() -> Self {
        Self {
            duration_s: 180,
            seed: 7,
            pack_volts: 82.0,
            cruise_kmh: 25.0,
            cruise_amps: 10.0,
            accel_amps: 25.0,
            regen_amps: 5.0,
            idle_s: 10,
            accel_s: 5,
            cruise_s: 40,
            brake_s: 5,
            realtime: false,
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Doctor => doctor(&load_config(&cli.config)?)?,
        Command::Run => run(&load_config(&cli.config)?).await?,
        Command::Decode { frame } => decode_frame(&frame)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let v = &cfg.vehicle;
    ensure!(v.batt_parallel > 0, "vehicle.batt_parallel must be at least 1");
    ensure!(v.batt_series > 0, "vehicle.batt_series must be at least 1");
    ensure!(v.cell_mv_min < v.cell_mv_max, "vehicle cell voltage bounds are inverted");
    ensure!(
        (2500..=5000).contains(&v.cell_mv_max),
        "vehicle.cell_mv_max outside the lithium cell range"
    );
    ensure!(v.pulses_per_rev > 0, "vehicle.pulses_per_rev must be positive");
    ensure!(
        (300..=4000).contains(&v.dist_per_rev_mm),
        "vehicle.dist_per_rev_mm outside a sane wheel range"
    );
    for (name, c, lo, hi) in [
        ("motor", v.motor_temp_alarm_c, 25u8, 150u8),
        ("batt", v.batt_temp_alarm_c, 25, 80),
        ("driver", v.driver_temp_alarm_c, 25, 150),
    ] {
        ensure!(
            (lo..=hi).contains(&c),
            "vehicle.{name}_temp_alarm_c outside {lo}..={hi}"
        );
    }

    FileStorage::open(&cfg.storage.path, DEVICE_SIZE).context("storage path not usable")?;
    ensure!(cfg.sim.duration_s > 0, "sim.duration_s must be positive");

    info!("doctor: OK");
    Ok(())
}

fn decode_frame(arg: &str) -> Result<()> {
    let bytes = hex::decode(arg.trim()).context("frame must be hex")?;
    let frame: Frame = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected {FRAME_LEN} bytes, got {}", bytes.len()))?;

    match wire::decode(&frame)? {
        BusMessage::Electric(m) => {
            println!("electric seq={} ts={} ms", m.seq_id, m.timestamp);
            println!("  voltage {:.1} V", m.voltage_dv as f32 / 10.0);
            println!("  current {:.1} A", m.current_da as f32 / 10.0);
            println!("  faults  0x{:03x}", m.faults);
        }
        BusMessage::Motion(m) => {
            println!(
                "motion seq={} ts={} ms total_pulses={}",
                m.seq_id, m.timestamp, m.total_pulses
            );
        }
        BusMessage::SensorBlock(s) => {
            println!(
                "sensors motor={} C driver={} C battery={} C",
                s.motor_temp_c, s.driver_temp_c, s.battery_temp_c
            );
        }
    }
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");

    let dev = FileStorage::open(&cfg.storage.path, DEVICE_SIZE).context("open storage")?;
    let mut store = Store::new(dev);
    let (vehicle, runtime) = match store.load() {
        Ok((stored, rt)) => {
            if stored != cfg.vehicle {
                info!("vehicle config changed, updating stored copy");
                store.save_config(&cfg.vehicle)?;
            }
            (cfg.vehicle.clone(), rt)
        }
        Err(StoreError::NotBootstrapped) => {
            let rt = store.bootstrap(&cfg.vehicle)?;
            (cfg.vehicle.clone(), rt)
        }
        Err(e) => return Err(e.into()),
    };

    let mut node = PowerNode::new();
    let mut bus = SimBus::default();
    let mut sampler = AnalogModel::new(cfg.sim.seed, cfg.sim.pack_volts);
    let mut rider = Rider::new(&cfg.sim, &vehicle);
    let mut agg = TelemetryAggregator::new(vehicle, runtime);
    let mut console = StdoutConsole::default();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let end_ms = cfg.sim.duration_s.saturating_mul(1000);
    let mut bad_frames = 0u32;
    for now_ms in 0..end_ms {
        if stop.load(Ordering::Relaxed) {
            warn!("interrupted, stopping simulation");
            break;
        }

        let (amps, pulses) = rider.step(now_ms);
        sampler.set_load(amps);
        if pulses > 0 {
            node.on_pulses(pulses);
        }
        node.poll(now_ms, &mut sampler, &mut bus);

        // Inbound frames first, then the periodic display work.
        while let Some(frame) = bus.queue.pop_front() {
            match wire::decode(&frame) {
                Ok(msg) => agg.on_frame(msg),
                Err(e) => {
                    bad_frames += 1;
                    warn!("undecodable frame on bus: {e}");
                }
            }
        }
        agg.on_tick(now_ms, &mut store, &mut console);

        if cfg.sim.realtime {
            tokio::time::sleep(Duration::from_millis(1)).await;
        } else if now_ms % 8192 == 0 {
            tokio::task::yield_now().await;
        }
    }

    agg.persist(&mut store);
    let g = agg.gauges();
    info!(
        total_m = g.total_m,
        consumed_wh = g.consumed_wh,
        recovered_wh = g.recovered_wh,
        max_speed_kmh = agg.runtime().total.max_speed_kmh,
        bad_frames,
        "run: finished"
    );
    Ok(())
}

/// In-memory stand-in for the bus transceiver: a small transmit mailbox
/// that overflows exactly like the real one.
const BUS_MAILBOX: usize = 3;

#[derive(Default)]
struct SimBus {
    queue: VecDeque<Frame>,
}

impl FrameSink for SimBus {
    fn try_send(&mut self, frame: Frame) -> bool {
        if self.queue.len() >= BUS_MAILBOX {
            return false;
        }
        self.queue.push_back(frame);
        true
    }
}

/// Rider profile: a repeating idle / accelerate / cruise / brake cycle,
/// advanced one virtual millisecond per step.
struct Rider {
    cruise_kmh: f32,
    cruise_amps: f32,
    accel_amps: f32,
    regen_amps: f32,
    idle_ms: u32,
    accel_ms: u32,
    cruise_ms: u32,
    brake_ms: u32,
    pulses_per_mm: f64,
    pulse_frac: f64,
}

impl Rider {
    fn new(sim: &SimCfg, v: &VehicleConfig) -> Self {
        Self {
            cruise_kmh: sim.cruise_kmh,
            cruise_amps: sim.cruise_amps,
            accel_amps: sim.accel_amps,
            regen_amps: sim.regen_amps,
            idle_ms: sim.idle_s * 1000,
            accel_ms: sim.accel_s.max(1) * 1000,
            cruise_ms: sim.cruise_s * 1000,
            brake_ms: sim.brake_s.max(1) * 1000,
            pulses_per_mm: v.pulses_per_rev as f64 / v.dist_per_rev_mm.max(1) as f64,
            pulse_frac: 0.0,
        }
    }

    /// Pack current and wheel pulses for this millisecond.
    fn step(&mut self, now_ms: u32) -> (f32, u32) {
        let cycle = self.idle_ms + self.accel_ms + self.cruise_ms + self.brake_ms;
        let t = now_ms % cycle;

        let (speed_kmh, amps) = if t < self.idle_ms {
            (0.0, 0.0)
        } else if t < self.idle_ms + self.accel_ms {
            let k = (t - self.idle_ms) as f32 / self.accel_ms as f32;
            (self.cruise_kmh * k, self.accel_amps)
        } else if t < self.idle_ms + self.accel_ms + self.cruise_ms {
            (self.cruise_kmh, self.cruise_amps)
        } else {
            let k = (t - self.idle_ms - self.accel_ms - self.cruise_ms) as f32
                / self.brake_ms as f32;
            (self.cruise_kmh * (1.0 - k), -self.regen_amps)
        };

        // km/h over one millisecond is exactly mm/3.6.
        self.pulse_frac += speed_kmh as f64 / 3.6 * self.pulses_per_mm;
        let whole = self.pulse_frac as u32;
        self.pulse_frac -= whole as f64;
        (amps, whole)
    }
}

const SIM_V_REF: f32 = 3.3;
const SIM_ADC_FS: f32 = 4096.0;

/// True pack volts vs what the tolerance-skewed measurement divider reports.
/// Mirror image of the correction table the pipeline applies.
const TRUE_TO_MEASURED_V: &[(f32, f32)] = &[(32.5, 30.0), (62.3, 60.0), (100.3, 97.0)];

/// Simulated analog front end: hall current sensor at 20 mV/A around 2.5 V,
/// 100k/3.3k voltage divider, PTC temperature dividers, a couple LSB of
/// noise on everything.
struct AnalogModel {
    rng: StdRng,
    amps: f32,
    pack_v: f32,
}

impl AnalogModel {
    fn new(seed: u64, pack_v: f32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            amps: 0.0,
            pack_v,
        }
    }

    fn set_load(&mut self, amps: f32) {
        self.amps = amps;
    }

    fn noisy(&mut self, adc: u16) -> u16 {
        (adc as i32 + self.rng.gen_range(-2..=2)).clamp(0, 4095) as u16
    }
}

fn adc_for_volts(v: f32) -> u16 {
    (v.clamp(0.0, SIM_V_REF) * SIM_ADC_FS / SIM_V_REF) as u16
}

fn adc_for_divider(rt: f32, divider_r: f32) -> u16 {
    adc_for_volts(5.0 * rt / (rt + divider_r))
}

impl Sampler for AnalogModel {
    fn acquire(&mut self) -> Result<[u16; ADC_CHANNELS], SampleError> {
        let sagged = self.pack_v - self.amps * 0.05;
        let measured = interp(TRUE_TO_MEASURED_V, sagged);

        let mut raw = [0u16; ADC_CHANNELS];
        raw[CH_CURRENT] = self.noisy(adc_for_volts(2.5 + self.amps * 0.02));
        raw[CH_BATT_TEMP] = self.noisy(adc_for_divider(990.0, 2_200.0));
        raw[CH_DRIVER_TEMP] = self.noisy(adc_for_divider(1_100.0, 2_200.0));
        raw[CH_VOLTAGE] = self.noisy(adc_for_volts(measured * 3_300.0 / 103_300.0));
        raw[CH_MOTOR_PTC] = self.noisy(adc_for_divider(11_000.0, 17_000.0));
        // NTC variant not populated on the simulated bike.
        Ok(raw)
    }
}

/// Prints the 16x2 panel whenever its content changes.
#[derive(Default)]
struct StdoutConsole {
    last: Option<(String, String)>,
}

impl Console for StdoutConsole {
    fn show(&mut self, line1: &str, line2: &str) {
        if self
            .last
            .as_ref()
            .is_some_and(|(a, b)| a == line1 && b == line2)
        {
            return;
        }
        println!("|{line1:<16}|");
        println!("|{line2:<16}|");
        self.last = Some((line1.to_string(), line2.to_string()));
    }

    fn beep(&mut self) {
        println!("*beep*");
    }

    fn ambient_c(&mut self) -> Option<i16> {
        Some(21)
    }
}
