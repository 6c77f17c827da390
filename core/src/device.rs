use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::LodestoneError;

/// Description of a block device as seen by the layer above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub device_type: DeviceType,
    pub source: PathBuf,
    pub is_removable: bool,
    pub is_system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    HardDisk,
    SSD,
    USB,
    SDCard,
    Virtual,
    Unknown,
}

/// Synchronous byte-range access to a block device or device image.
///
/// Mounting is single-threaded and blocking, so every operation here blocks
/// until the underlying I/O completes. A caller that wants a timeout has to
/// enforce it around this boundary.
pub trait BlockDevice: Send {
    /// Total size of the device in bytes.
    fn size(&self) -> u64;

    /// Read exactly `len` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, LodestoneError>;

    /// Write `data` starting at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), LodestoneError>;

    /// Flush pending writes to stable storage.
    fn sync(&mut self) -> Result<(), LodestoneError>;
}

/// File-backed block device, used both for raw devices and for image files.
pub struct FileBlockDevice {
    file: File,
    size: u64,
    writable: bool,
}

impl FileBlockDevice {
    /// Open a device node or image file read-only.
    pub fn open_read_only(path: &std::path::Path) -> Result<Self, LodestoneError> {
        let file = File::open(path)
            .map_err(|e| LodestoneError::from_device_io(e, &path.display().to_string()))?;
        let size = file
            .metadata()
            .map_err(|e| LodestoneError::from_device_io(e, "reading device metadata"))?
            .len();
        debug!("opened {} read-only, {} bytes", path.display(), size);
        Ok(Self { file, size, writable: false })
    }

    /// Open a device node or image file for read-write access.
    pub fn open_read_write(path: &std::path::Path) -> Result<Self, LodestoneError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LodestoneError::from_device_io(e, &path.display().to_string()))?;
        let size = file
            .metadata()
            .map_err(|e| LodestoneError::from_device_io(e, "reading device metadata"))?
            .len();
        debug!("opened {} read-write, {} bytes", path.display(), size);
        Ok(Self { file, size, writable: true })
    }
}

impl BlockDevice for FileBlockDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, LodestoneError> {
        let mut buffer = vec![0u8; len];
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| LodestoneError::from_device_io(e, "seeking"))?;
        self.file
            .read_exact(&mut buffer)
            .map_err(|e| LodestoneError::from_device_io(e, &format!("reading at {:#x}", offset)))?;
        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), LodestoneError> {
        if !self.writable {
            return Err(LodestoneError::ReadOnly(
                "device opened read-only".to_string(),
            ));
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| LodestoneError::from_device_io(e, "seeking"))?;
        self.file
            .write_all(data)
            .map_err(|e| LodestoneError::from_device_io(e, &format!("writing at {:#x}", offset)))?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), LodestoneError> {
        self.file
            .sync_all()
            .map_err(|e| LodestoneError::from_device_io(e, "syncing device"))
    }
}

/// In-memory block device for tests and fault injection.
pub struct MemoryBlockDevice {
    data: Vec<u8>,
    writable: bool,
}

impl MemoryBlockDevice {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, writable: true }
    }

    pub fn new_read_only(data: Vec<u8>) -> Self {
        Self { data, writable: false }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, LodestoneError> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| LodestoneError::InvalidInput("read range overflow".to_string()))?;
        if end > self.data.len() {
            return Err(LodestoneError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read past end of device: {:#x}+{}", offset, len),
            )));
        }
        Ok(self.data[start..end].to_vec())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), LodestoneError> {
        if !self.writable {
            return Err(LodestoneError::ReadOnly(
                "memory device is read-only".to_string(),
            ));
        }
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| LodestoneError::InvalidInput("write range overflow".to_string()))?;
        if end > self.data.len() {
            return Err(LodestoneError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "write past end of device".to_string(),
            )));
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), LodestoneError> {
        Ok(())
    }
}
