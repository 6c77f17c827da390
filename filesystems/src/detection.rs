// Filesystem detection trait and utilities

use lodestone_core::{BlockDevice, LodestoneError};

/// Filesystem-specific detection logic.
pub trait FilesystemDetector {
    /// Check whether the boot sector (and optional extended data, e.g. an
    /// ext superblock at offset 1024) matches this filesystem. Returns the
    /// variant name on a match.
    fn detect(boot_sector: &[u8], ext_superblock: Option<&[u8]>) -> Option<String>;
}

/// Detect the filesystem on a device using all known detectors.
pub fn detect_filesystem(device: &mut dyn BlockDevice) -> Result<String, LodestoneError> {
    let boot_sector = device.read_at(0, 512)?;
    let ext_superblock = if device.size() >= 1536 {
        device.read_at(1024, 512).ok()
    } else {
        None
    };

    if let Some(fs) = crate::ntfs::NtfsDetector::detect(&boot_sector, ext_superblock.as_deref()) {
        return Ok(fs);
    }

    Ok("unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::test_image::build_default_image;
    use lodestone_core::MemoryBlockDevice;

    #[test]
    fn detects_the_synthetic_volume() {
        let image = build_default_image();
        let mut device = MemoryBlockDevice::new(image.bytes);
        assert_eq!(detect_filesystem(&mut device).unwrap(), "ntfs");
    }

    #[test]
    fn unknown_content_reports_unknown() {
        let mut device = MemoryBlockDevice::new(vec![0u8; 4096]);
        assert_eq!(detect_filesystem(&mut device).unwrap(), "unknown");
    }
}
