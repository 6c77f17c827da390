pub mod device;
pub mod error;

pub use device::{BlockDevice, Device, DeviceType, FileBlockDevice, MemoryBlockDevice};
pub use error::LodestoneError;
