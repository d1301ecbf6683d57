//! Versioned load/bootstrap/save of vehicle configuration and runtime
//! counters over a byte-addressable non-volatile device.
//!
//! Page map (one page per logical record, 24LC256-style):
//! page 0 = bootstrap marker (magic + version string), page 1 = vehicle
//! configuration, page 2 = runtime counters. A missing or mismatched
//! marker means virgin storage: the caller bootstraps defaults and saves
//! them. A version string mismatch is treated the same way; there is no
//! migration path yet.

pub mod records;
pub mod storage;

use thiserror::Error;
use tracing::{info, warn};

pub use records::{TripCounter, VehicleConfig, VehicleRuntime};
pub use storage::{FileStorage, MemStorage, NvStorage};

pub const PAGE: usize = 0x400;
pub const DEVICE_SIZE: usize = 3 * PAGE;

const MARKER_OFFSET: usize = 0;
const CONFIG_OFFSET: usize = PAGE;
const RUNTIME_OFFSET: usize = 2 * PAGE;

const MAGIC: u32 = 0x00ab_d131;
const VERSION_LEN: usize = 16;
const MARKER_LEN: usize = 4 + VERSION_LEN;

/// Version string stamped into the marker page.
pub const STORE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum StoreError {
    /// Virgin storage, or a record map from another firmware version.
    #[error("storage not bootstrapped")]
    NotBootstrapped,
    #[error("storage read failed")]
    Read(#[source] std::io::Error),
    #[error("storage write failed")]
    Write(#[source] std::io::Error),
}

pub struct Store<S> {
    dev: S,
}

impl<S: NvStorage> Store<S> {
    pub fn new(dev: S) -> Self {
        Self { dev }
    }

    /// Load both records. Fails with [`StoreError::NotBootstrapped`] when
    /// the marker is absent or from a different version.
    pub fn load(&mut self) -> Result<(VehicleConfig, VehicleRuntime), StoreError> {
        let mut marker = [0u8; MARKER_LEN];
        self.dev.read(MARKER_OFFSET, &mut marker).map_err(StoreError::Read)?;

        let magic = u32::from_le_bytes([marker[0], marker[1], marker[2], marker[3]]);
        if magic != MAGIC {
            warn!("no bootstrap marker, storage is virgin");
            return Err(StoreError::NotBootstrapped);
        }
        let stored = trimmed_version(&marker[4..]);
        if stored != STORE_VERSION.as_bytes() {
            warn!(
                stored = %String::from_utf8_lossy(stored),
                current = STORE_VERSION,
                "version marker mismatch, treating storage as virgin"
            );
            return Err(StoreError::NotBootstrapped);
        }

        let mut cfg = [0u8; records::CONFIG_LEN];
        self.dev.read(CONFIG_OFFSET, &mut cfg).map_err(StoreError::Read)?;
        let mut rt = [0u8; records::RUNTIME_LEN];
        self.dev.read(RUNTIME_OFFSET, &mut rt).map_err(StoreError::Read)?;

        Ok((VehicleConfig::from_bytes(&cfg), VehicleRuntime::from_bytes(&rt)))
    }

    /// Initialize virgin storage: marker, given config, zeroed runtime.
    pub fn bootstrap(&mut self, cfg: &VehicleConfig) -> Result<VehicleRuntime, StoreError> {
        info!("bootstrapping storage, version {STORE_VERSION}");
        let mut marker = [0u8; MARKER_LEN];
        marker[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        let v = STORE_VERSION.as_bytes();
        marker[4..4 + v.len().min(VERSION_LEN)].copy_from_slice(&v[..v.len().min(VERSION_LEN)]);
        self.dev.write(MARKER_OFFSET, &marker).map_err(StoreError::Write)?;

        self.save_config(cfg)?;
        let rt = VehicleRuntime::default();
        self.save_runtime(&rt)?;
        Ok(rt)
    }

    pub fn save_config(&mut self, cfg: &VehicleConfig) -> Result<(), StoreError> {
        self.dev.write(CONFIG_OFFSET, &cfg.to_bytes()).map_err(StoreError::Write)
    }

    pub fn save_runtime(&mut self, rt: &VehicleRuntime) -> Result<(), StoreError> {
        self.dev.write(RUNTIME_OFFSET, &rt.to_bytes()).map_err(StoreError::Write)
    }
}

fn trimmed_version(b: &[u8]) -> &[u8] {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    &b[..end]
}
