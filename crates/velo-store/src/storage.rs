//! Byte-addressable non-volatile storage collaborators.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Narrow interface over an EEPROM-like device: fixed-size, addressable by
/// byte offset.
pub trait NvStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<()>;
    fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()>;
}

/// In-memory device, zero-initialized (virgin) at construction.
pub struct MemStorage {
    bytes: Vec<u8>,
}

impl MemStorage {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }
}

impl NvStorage for MemStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let end = offset + buf.len();
        if end > self.bytes.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past device end"));
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        let end = offset + data.len();
        if end > self.bytes.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "write past device end"));
        }
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }
}

/// Single-file backing, used by the simulator so trips survive restarts.
/// The file is created zero-filled at the device size when absent.
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>, size: usize) -> io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        if file.metadata()?.len() < size as u64 {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&vec![0u8; size])?;
            file.flush()?;
        }
        Ok(Self { file })
    }
}

impl NvStorage for FileStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(data)?;
        self.file.flush()
    }
}
