//! On-wire format for the velo telemetry bus.
//!
//! Every exchange is one fixed 8-byte frame. Byte 0 selects the message
//! kind, bytes 1..8 carry a bit-packed payload. Fields are packed LSB-first
//! across the payload bytes, so the layout is stable regardless of how the
//! compiler lays structs out in memory. Signed fields use sign-magnitude
//! encoding (top bit = sign, remaining bits = absolute value), not two's
//! complement; +0 and -0 are both valid encodings of zero.

use thiserror::Error;

pub const FRAME_LEN: usize = 8;
const PAYLOAD_LEN: usize = 7;

pub const KIND_ELECTRIC: u8 = 0x01;
pub const KIND_MOTION: u8 = 0x02;
pub const KIND_SENSOR_BLOCK: u8 = 0x03;

pub type Frame = [u8; FRAME_LEN];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unrecognized frame kind 0x{0:02x}")]
    UnknownKind(u8),
}

/// Encode a signed value into an `bits`-wide sign-magnitude field.
/// Magnitudes beyond the (bits-1)-bit range saturate.
pub fn encode_signed(v: i32, bits: u32) -> u32 {
    let max_mag = (1u32 << (bits - 1)) - 1;
    let mag = v.unsigned_abs().min(max_mag);
    if v < 0 {
        (1 << (bits - 1)) | mag
    } else {
        mag
    }
}

/// Decode an `bits`-wide sign-magnitude field.
pub fn decode_signed(raw: u32, bits: u32) -> i32 {
    let mag = (raw & ((1u32 << (bits - 1)) - 1)) as i32;
    if raw & (1 << (bits - 1)) != 0 {
        -mag
    } else {
        mag
    }
}

struct BitWriter {
    buf: [u8; PAYLOAD_LEN],
    pos: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self { buf: [0; PAYLOAD_LEN], pos: 0 }
    }

    fn put(&mut self, value: u32, bits: u32) {
        debug_assert!(self.pos + bits <= 8 * PAYLOAD_LEN as u32);
        let mut v = value as u64 & ((1u64 << bits) - 1);
        let mut left = bits;
        while left > 0 {
            let byte = (self.pos / 8) as usize;
            let bit = self.pos % 8;
            let take = (8 - bit).min(left);
            self.buf[byte] |= ((v & ((1 << take) - 1)) as u8) << bit;
            v >>= take;
            self.pos += take;
            left -= take;
        }
    }

    fn finish(self, kind: u8) -> Frame {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = kind;
        frame[1..].copy_from_slice(&self.buf);
        frame
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: u32,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, bits: u32) -> u32 {
        let mut v = 0u64;
        let mut got = 0;
        while got < bits {
            let byte = (self.pos / 8) as usize;
            let bit = self.pos % 8;
            let take = (8 - bit).min(bits - got);
            let chunk = (self.buf[byte] >> bit) as u64 & ((1 << take) - 1);
            v |= chunk << got;
            self.pos += take;
            got += take;
        }
        v as u32
    }
}

/// Power readings: timestamp(13) voltage(10) current(14) faults(11) seq(8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectricMsg {
    /// Sender milliseconds, modulo [`crate::clock::TIMESTAMP_MODULO`].
    pub timestamp: u16,
    /// Pack voltage in decivolts (60.7 V = 607).
    pub voltage_dv: u16,
    /// Pack current in deciamps (10.8 A = 108), negative while regenerating.
    pub current_da: i16,
    /// Sensor fault bitmask, see `velo-power`.
    pub faults: u16,
    pub seq_id: u8,
}

impl ElectricMsg {
    pub fn encode(&self) -> Frame {
        let mut w = BitWriter::new();
        w.put(self.timestamp as u32 & 0x1fff, 13);
        w.put(self.voltage_dv as u32 & 0x3ff, 10);
        w.put(encode_signed(self.current_da as i32, 14), 14);
        w.put(self.faults as u32 & 0x7ff, 11);
        w.put(self.seq_id as u32, 8);
        w.finish(KIND_ELECTRIC)
    }
}

/// Wheel rotation: timestamp(13) total_pulses(32) seq(8) reserved(2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionMsg {
    pub timestamp: u16,
    /// Lifetime pulse counter of the power node, wraps at 2^32.
    pub total_pulses: u32,
    pub seq_id: u8,
}

impl MotionMsg {
    pub fn encode(&self) -> Frame {
        let mut w = BitWriter::new();
        w.put(self.timestamp as u32 & 0x1fff, 13);
        w.put(self.total_pulses, 32);
        w.put(self.seq_id as u32, 8);
        w.finish(KIND_MOTION)
    }
}

/// Temperatures, 9-bit sign-magnitude degrees Celsius each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorBlockMsg {
    pub motor_temp_c: i16,
    pub driver_temp_c: i16,
    pub battery_temp_c: i16,
}

impl SensorBlockMsg {
    pub fn encode(&self) -> Frame {
        let mut w = BitWriter::new();
        w.put(encode_signed(self.motor_temp_c as i32, 9), 9);
        w.put(encode_signed(self.driver_temp_c as i32, 9), 9);
        w.put(encode_signed(self.battery_temp_c as i32, 9), 9);
        w.finish(KIND_SENSOR_BLOCK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMessage {
    Electric(ElectricMsg),
    Motion(MotionMsg),
    SensorBlock(SensorBlockMsg),
}

pub fn decode(frame: &Frame) -> Result<BusMessage, CodecError> {
    let mut r = BitReader::new(&frame[1..]);
    match frame[0] {
        KIND_ELECTRIC => Ok(BusMessage::Electric(ElectricMsg {
            timestamp: r.take(13) as u16,
            voltage_dv: r.take(10) as u16,
            current_da: decode_signed(r.take(14), 14) as i16,
            faults: r.take(11) as u16,
            seq_id: r.take(8) as u8,
        })),
        KIND_MOTION => Ok(BusMessage::Motion(MotionMsg {
            timestamp: r.take(13) as u16,
            total_pulses: r.take(32),
            seq_id: r.take(8) as u8,
        })),
        KIND_SENSOR_BLOCK => Ok(BusMessage::SensorBlock(SensorBlockMsg {
            motor_temp_c: decode_signed(r.take(9), 9) as i16,
            driver_temp_c: decode_signed(r.take(9), 9) as i16,
            battery_temp_c: decode_signed(r.take(9), 9) as i16,
        })),
        kind => Err(CodecError::UnknownKind(kind)),
    }
}
