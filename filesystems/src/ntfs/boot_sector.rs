// NTFS boot-sector decoding
// Produces the immutable Geometry value the rest of the mount path trusts.

use lodestone_core::LodestoneError;
use log::debug;

use crate::ntfs::structures::NtfsBootSector;

/// Validated volume geometry, parsed once from the boot sector and owned by
/// the `Volume` for the life of the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u32,
    pub sectors_per_cluster: u32,
    pub cluster_size: u64,
    pub mft_record_size: u64,
    pub index_record_size: u64,
    pub mft_start: u64,
    pub mirror_start: u64,
    pub total_sectors: u64,
    pub total_clusters: u64,
    pub volume_serial: u64,
}

impl Geometry {
    /// Parse and sanity-check a raw boot sector.
    ///
    /// A failure here means the device does not carry this filesystem at all;
    /// the mount classifier maps it to `NotFilesystem`.
    pub fn parse(boot_sector: &[u8]) -> Result<Geometry, LodestoneError> {
        if boot_sector.len() < 512 {
            return Err(LodestoneError::InvalidInput(format!(
                "boot sector too short: {} bytes",
                boot_sector.len()
            )));
        }

        let boot = unsafe {
            std::ptr::read_unaligned(boot_sector.as_ptr() as *const NtfsBootSector)
        };

        if &boot.oem_id != b"NTFS    " {
            return Err(LodestoneError::InvalidInput(
                "not an NTFS volume (OEM ID mismatch)".to_string(),
            ));
        }
        let end_marker = boot.end_marker;
        if end_marker != 0xAA55 {
            return Err(LodestoneError::InvalidInput(format!(
                "bad boot sector end marker: {:#06x}",
                end_marker
            )));
        }

        let sector_size = boot.bytes_per_sector as u32;
        if sector_size < 256 || sector_size > 4096 || !sector_size.is_power_of_two() {
            return Err(LodestoneError::InvalidInput(format!(
                "invalid bytes per sector: {}",
                sector_size
            )));
        }

        let sectors_per_cluster = boot.sectors_per_cluster as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(LodestoneError::InvalidInput(format!(
                "invalid sectors per cluster: {}",
                sectors_per_cluster
            )));
        }

        let cluster_size = boot.bytes_per_cluster();
        let total_sectors = boot.total_sectors;
        if total_sectors == 0 {
            return Err(LodestoneError::InvalidInput(
                "zero total sectors".to_string(),
            ));
        }
        let total_clusters = total_sectors / sectors_per_cluster as u64;

        let mft_start = boot.mft_lcn;
        let mirror_start = boot.mft_mirror_lcn;
        if mft_start == 0 || mft_start >= total_clusters {
            return Err(LodestoneError::InvalidInput(format!(
                "MFT start cluster {} outside volume of {} clusters",
                mft_start, total_clusters
            )));
        }
        if mirror_start == 0 || mirror_start >= total_clusters {
            return Err(LodestoneError::InvalidInput(format!(
                "MFT mirror start cluster {} outside volume of {} clusters",
                mirror_start, total_clusters
            )));
        }
        if mft_start == mirror_start {
            return Err(LodestoneError::InvalidInput(
                "MFT and mirror declare the same start cluster".to_string(),
            ));
        }

        let mft_record_size = boot.mft_record_size();
        if mft_record_size < 256
            || mft_record_size > 65536
            || !mft_record_size.is_power_of_two()
        {
            return Err(LodestoneError::InvalidInput(format!(
                "invalid MFT record size: {}",
                mft_record_size
            )));
        }

        let geometry = Geometry {
            sector_size,
            sectors_per_cluster,
            cluster_size,
            mft_record_size,
            index_record_size: boot.index_record_size(),
            mft_start,
            mirror_start,
            total_sectors,
            total_clusters,
            volume_serial: boot.volume_serial,
        };
        debug!(
            "parsed geometry: {} byte sectors, {} byte clusters, {} byte records, MFT at {}, mirror at {}",
            geometry.sector_size,
            geometry.cluster_size,
            geometry.mft_record_size,
            geometry.mft_start,
            geometry.mirror_start
        );
        Ok(geometry)
    }

    /// Byte offset of a cluster on the device.
    pub fn cluster_offset(&self, lcn: u64) -> u64 {
        lcn * self.cluster_size
    }

    /// How many whole metadata records fit in `bytes`.
    pub fn records_in(&self, bytes: u64) -> u64 {
        bytes / self.mft_record_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::test_image::minimal_boot_sector;

    #[test]
    fn parses_a_valid_boot_sector() {
        let boot = minimal_boot_sector(512, 8, 1_000_000, 4, 1000, -10);
        let geometry = Geometry::parse(&boot).unwrap();
        assert_eq!(geometry.sector_size, 512);
        assert_eq!(geometry.cluster_size, 4096);
        assert_eq!(geometry.mft_record_size, 1024);
        assert_eq!(geometry.mft_start, 4);
        assert_eq!(geometry.mirror_start, 1000);
        assert_eq!(geometry.total_clusters, 125_000);
    }

    #[test]
    fn rejects_wrong_oem_id() {
        let mut boot = minimal_boot_sector(512, 8, 1_000_000, 4, 1000, -10);
        boot[3..11].copy_from_slice(b"MSDOS5.0");
        assert!(Geometry::parse(&boot).is_err());
    }

    #[test]
    fn rejects_missing_end_marker() {
        let mut boot = minimal_boot_sector(512, 8, 1_000_000, 4, 1000, -10);
        boot[510] = 0;
        boot[511] = 0;
        assert!(Geometry::parse(&boot).is_err());
    }

    #[test]
    fn rejects_non_power_of_two_sector_size() {
        let mut boot = minimal_boot_sector(512, 8, 1_000_000, 4, 1000, -10);
        boot[0x0B..0x0D].copy_from_slice(&1000u16.to_le_bytes());
        assert!(Geometry::parse(&boot).is_err());
    }

    #[test]
    fn rejects_mft_outside_volume() {
        let boot = minimal_boot_sector(512, 8, 1_000_000, 999_999_999, 1000, -10);
        assert!(Geometry::parse(&boot).is_err());
    }

    #[test]
    fn extreme_record_size_byte_is_rejected_not_a_panic() {
        // 0x80 = -128: the negation does not fit an i8 and the shift does
        // not fit a u64
        let boot = minimal_boot_sector(512, 8, 1_000_000, 4, 1000, -128);
        assert!(Geometry::parse(&boot).is_err());
    }

    #[test]
    fn positive_clusters_per_record_scales_with_cluster_size() {
        let boot = minimal_boot_sector(512, 2, 1_000_000, 4, 1000, 1);
        let geometry = Geometry::parse(&boot).unwrap();
        assert_eq!(geometry.mft_record_size, 1024);
    }
}
