//! Periodic telemetry production on the power node.
//!
//! One monotonic millisecond clock drives three independent periods:
//! 50 ms electric (full ADC conversion), 500 ms motion (also triggers the
//! calibration self test after the settle window), 5 s sensor block.
//! Frames are fire-and-forget: a busy bus drops the frame, the next cycle
//! supersedes it.

use thiserror::Error;
use tracing::warn;

use velo_proto::clock::{wire_timestamp, PeriodicTimer};
use velo_proto::wire::{ElectricMsg, Frame, MotionMsg, SensorBlockMsg};

use crate::pipeline::{Readings, SensorPipeline, ADC_CHANNELS};

pub const ELECTRIC_PERIOD_MS: u32 = 50;
pub const MOTION_PERIOD_MS: u32 = 500;
pub const SENSORS_PERIOD_MS: u32 = 5_000;

#[derive(Debug, Error)]
pub enum SampleError {
    /// The multi-channel conversion did not complete within the bound.
    #[error("analog conversion timed out after {0} ms")]
    Timeout(u32),
    #[error("analog unit fault: {0}")]
    Device(String),
}

/// Multi-channel analog acquisition collaborator. Implementations must
/// return within a bounded time and surface `SampleError::Timeout` instead
/// of spinning.
pub trait Sampler {
    fn acquire(&mut self) -> Result<[u16; ADC_CHANNELS], SampleError>;
}

/// Bus transmit collaborator. `false` means no transmit slot was free.
pub trait FrameSink {
    fn try_send(&mut self, frame: Frame) -> bool;
}

pub struct PowerNode {
    pipeline: SensorPipeline,
    electric_timer: PeriodicTimer,
    motion_timer: PeriodicTimer,
    sensors_timer: PeriodicTimer,
    electric_seq: u8,
    motion_seq: u8,
    pulse_count: u32,
    last: Readings,
}

impl Default for PowerNode {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerNode {
    pub fn new() -> Self {
        Self {
            pipeline: SensorPipeline::new(),
            electric_timer: PeriodicTimer::new(ELECTRIC_PERIOD_MS),
            motion_timer: PeriodicTimer::new(MOTION_PERIOD_MS),
            sensors_timer: PeriodicTimer::new(SENSORS_PERIOD_MS),
            electric_seq: 0,
            motion_seq: 0,
            pulse_count: 0,
            last: Readings::default(),
        }
    }

    pub fn pipeline(&self) -> &SensorPipeline {
        &self.pipeline
    }

    /// Wheel rotation sensor ticks, normally fed from an edge interrupt.
    pub fn on_pulses(&mut self, n: u32) {
        self.pulse_count = self.pulse_count.wrapping_add(n);
    }

    pub fn pulse_count(&self) -> u32 {
        self.pulse_count
    }

    /// One control-loop iteration.
    pub fn poll(&mut self, now_ms: u32, sampler: &mut dyn Sampler, bus: &mut dyn FrameSink) {
        if self.electric_timer.fire(now_ms) {
            match sampler.acquire() {
                Ok(raw) => {
                    self.last = self.pipeline.convert(&raw);
                    let msg = ElectricMsg {
                        timestamp: wire_timestamp(now_ms),
                        voltage_dv: self.last.voltage_dv,
                        current_da: self.last.current_da,
                        faults: self.pipeline.calibration().faults & 0x7ff,
                        seq_id: next_seq(&mut self.electric_seq),
                    };
                    send(bus, msg.encode(), "electric");
                }
                Err(e) => warn!("conversion cycle skipped: {e}"),
            }
        }

        if self.motion_timer.fire(now_ms) {
            // By now the caps have charged and no significant current flows,
            // so the zero-offset self test can run.
            self.pipeline.begin_calibration();
            let msg = MotionMsg {
                timestamp: wire_timestamp(now_ms),
                total_pulses: self.pulse_count,
                seq_id: next_seq(&mut self.motion_seq),
            };
            send(bus, msg.encode(), "motion");
        }

        if self.sensors_timer.fire(now_ms) {
            let msg = SensorBlockMsg {
                motor_temp_c: self.last.motor_temp_c,
                driver_temp_c: self.last.driver_temp_c,
                battery_temp_c: self.last.battery_temp_c,
            };
            send(bus, msg.encode(), "sensor block");
        }
    }
}

fn next_seq(seq: &mut u8) -> u8 {
    let id = *seq;
    *seq = seq.wrapping_add(1);
    id
}

fn send(bus: &mut dyn FrameSink, frame: Frame, what: &str) {
    if !bus.try_send(frame) {
        warn!("bus busy, {what} frame dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velo_proto::wire::{decode, BusMessage};

    struct FixedSampler(Result<(), u32>);

    impl Sampler for FixedSampler {
        fn acquire(&mut self) -> Result<[u16; ADC_CHANNELS], SampleError> {
            match self.0 {
                Ok(()) => {
                    let mut raw = [0u16; ADC_CHANNELS];
                    raw[crate::pipeline::CH_CURRENT] = 3103; // ~2.5 V
                    raw[crate::pipeline::CH_VOLTAGE] = 2379; // ~60 V measured
                    raw[crate::pipeline::CH_BATT_TEMP] = 1926;
                    raw[crate::pipeline::CH_DRIVER_TEMP] = 1926;
                    raw[crate::pipeline::CH_MOTOR_PTC] = 2298;
                    Ok(raw)
                }
                Err(ms) => Err(SampleError::Timeout(ms)),
            }
        }
    }

    #[derive(Default)]
    struct CollectSink {
        frames: Vec<Frame>,
        full: bool,
    }

    impl FrameSink for CollectSink {
        fn try_send(&mut self, frame: Frame) -> bool {
            if self.full {
                return false;
            }
            self.frames.push(frame);
            true
        }
    }

    fn drive(node: &mut PowerNode, sink: &mut CollectSink, until_ms: u32) {
        let mut sampler = FixedSampler(Ok(()));
        let mut now = 0;
        while now <= until_ms {
            node.poll(now, &mut sampler, sink);
            now += 10;
        }
    }

    #[test]
    fn periods_and_sequence_ids() {
        let mut node = PowerNode::new();
        let mut sink = CollectSink::default();
        drive(&mut node, &mut sink, 1_000);

        let mut electric = Vec::new();
        let mut motion = Vec::new();
        for f in &sink.frames {
            match decode(f).unwrap() {
                BusMessage::Electric(m) => electric.push(m),
                BusMessage::Motion(m) => motion.push(m),
                BusMessage::SensorBlock(_) => {}
            }
        }
        assert_eq!(electric.len(), 20);
        assert_eq!(motion.len(), 2);
        for (i, m) in electric.iter().enumerate() {
            assert_eq!(m.seq_id as usize, i);
        }
        for (i, m) in motion.iter().enumerate() {
            assert_eq!(m.seq_id as usize, i);
        }
    }

    #[test]
    fn motion_carries_pulse_counter() {
        let mut node = PowerNode::new();
        let mut sink = CollectSink::default();
        node.on_pulses(123);
        drive(&mut node, &mut sink, 500);

        let motion = sink
            .frames
            .iter()
            .find_map(|f| match decode(f).unwrap() {
                BusMessage::Motion(m) => Some(m),
                _ => None,
            })
            .unwrap();
        assert_eq!(motion.total_pulses, 123);
    }

    #[test]
    fn first_motion_tick_starts_calibration() {
        let mut node = PowerNode::new();
        let mut sink = CollectSink::default();
        drive(&mut node, &mut sink, 600);
        // The 500 ms tick moved Needed -> InProgress and the next 50 ms
        // conversion finished it.
        assert_eq!(
            node.pipeline().calibration().phase,
            crate::pipeline::CalPhase::Done
        );
    }

    #[test]
    fn sample_timeout_skips_cycle_without_frame() {
        let mut node = PowerNode::new();
        let mut sampler = FixedSampler(Err(20));
        let mut sink = CollectSink::default();
        node.poll(50, &mut sampler, &mut sink);
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn busy_bus_drops_frames_silently() {
        let mut node = PowerNode::new();
        let mut sampler = FixedSampler(Ok(()));
        let mut sink = CollectSink { frames: Vec::new(), full: true };
        node.poll(50, &mut sampler, &mut sink);
        node.poll(100, &mut sampler, &mut sink);
        assert!(sink.frames.is_empty());
        // The node keeps running; a later cycle with a free slot goes out.
        sink.full = false;
        node.poll(150, &mut sampler, &mut sink);
        assert_eq!(sink.frames.len(), 1);
    }
}
