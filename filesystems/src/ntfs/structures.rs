// NTFS on-disk structures and constants
// Only the pieces the mount path needs: boot sector, MFT record header,
// attribute layout offsets, and the well-known system records.

use static_assertions::const_assert_eq;

// ===== RECORD MAGICS =====

pub const MAGIC_FILE: &[u8; 4] = b"FILE";
pub const MAGIC_INDX: &[u8; 4] = b"INDX";
pub const MAGIC_HOLE: &[u8; 4] = b"HOLE";
pub const MAGIC_CHKD: &[u8; 4] = b"CHKD";
pub const MAGIC_BAAD: &[u8; 4] = b"BAAD";
pub const MAGIC_RSTR: &[u8; 4] = b"RSTR";

/// Record magics that can legitimately appear in a metadata record.
/// Anything else (including BAAD, which marks a torn write detected by a
/// driver) is corruption.
pub const KNOWN_RECORD_MAGICS: [&[u8; 4]; 4] = [MAGIC_FILE, MAGIC_INDX, MAGIC_HOLE, MAGIC_CHKD];

// ===== WELL-KNOWN MFT RECORDS =====

pub const MFT_RECORD_MFT: u64 = 0;
pub const MFT_RECORD_MFTMIRR: u64 = 1;
pub const MFT_RECORD_LOGFILE: u64 = 2;
pub const MFT_RECORD_VOLUME: u64 = 3;
pub const MFT_RECORD_ATTRDEF: u64 = 4;
pub const MFT_RECORD_ROOT: u64 = 5;
pub const MFT_RECORD_BITMAP: u64 = 6;
pub const MFT_RECORD_BOOT: u64 = 7;
pub const MFT_RECORD_SECURE: u64 = 9;
pub const MFT_RECORD_UPCASE: u64 = 10;

/// Number of leading system records cross-checked against the mirror.
/// May be truncated to the mirror's actual record count.
pub const MIRROR_CHECK_RECORDS: u64 = 16;

// ===== ATTRIBUTE TYPE CODES =====

pub const ATTR_TYPE_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_TYPE_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_TYPE_FILE_NAME: u32 = 0x30;
pub const ATTR_TYPE_VOLUME_NAME: u32 = 0x60;
pub const ATTR_TYPE_VOLUME_INFORMATION: u32 = 0x70;
pub const ATTR_TYPE_DATA: u32 = 0x80;
pub const ATTR_TYPE_INDEX_ROOT: u32 = 0x90;
pub const ATTR_TYPE_BITMAP: u32 = 0xB0;
pub const ATTR_END: u32 = 0xFFFF_FFFF;

// ===== MFT RECORD FLAGS =====

pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

// ===== VOLUME INFORMATION FLAGS =====

pub const VOLUME_IS_DIRTY: u16 = 0x0001;
pub const VOLUME_MODIFIED_BY_CHKDSK: u16 = 0x8000;

// ===== VALIDATION CAPS =====

/// Upper bound on the $UpCase table: 65536 UTF-16 entries.
pub const UPCASE_MAX_BYTES: u64 = 131_072;
/// The $AttrDef stream length must fit a 24-bit count.
pub const ATTRDEF_MAX_BYTES: u64 = 0xFF_FFFF;
/// Cap on an attribute-list extension buffer.
pub const ATTR_LIST_MAX_BYTES: u64 = 262_144;

// ===== $LOGFILE RESTART AREA =====

pub const RESTART_VOLUME_IS_CLEAN: u16 = 0x0002;
pub const LOGFILE_NO_CLIENT: u16 = 0xFFFF;

// ===== HIBERNATION IMAGE SIGNATURES =====

/// Leading signatures a hibernation image may carry. Only the `hibr` forms
/// mark an image that is still live; `wake` and all-zero mean cleared.
pub const HIBERNATE_ACTIVE_SIGNATURES: [&[u8; 4]; 2] = [b"hibr", b"HIBR"];
pub const HIBERNATE_CLEARED_SIGNATURES: [&[u8; 4]; 2] = [b"wake", b"WAKE"];

// ===== BOOT SECTOR =====

/// NTFS boot sector (volume boot record), 512 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct NtfsBootSector {
    pub jump: [u8; 3],
    pub oem_id: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub zeroed_0: [u8; 3],
    pub unused_0: u16,
    pub media_descriptor: u8,
    pub zeroed_1: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub unused_1: u32,
    pub unused_2: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    /// Signed: a negative value means the record size is `1 << -value` bytes,
    /// independent of the cluster size.
    pub clusters_per_mft_record: i8,
    pub reserved_0: [u8; 3],
    pub clusters_per_index_record: i8,
    pub reserved_1: [u8; 3],
    pub volume_serial: u64,
    pub checksum: u32,
    pub bootstrap_code: [u8; 426],
    /// 0xAA55
    pub end_marker: u16,
}

const_assert_eq!(std::mem::size_of::<NtfsBootSector>(), 512);

/// Decode the signed clusters-per-record byte. Widened to i32 first: the
/// byte is untrusted, and -128 cannot be negated in i8. A shift that would
/// not fit a u64 yields 0, which the geometry validation rejects.
fn record_size(clusters: i8, cluster_size: u64) -> u64 {
    let clusters = i32::from(clusters);
    if clusters < 0 {
        1u64.checked_shl((-clusters) as u32).unwrap_or(0)
    } else {
        clusters as u64 * cluster_size
    }
}

impl NtfsBootSector {
    pub fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn mft_record_size(&self) -> u64 {
        record_size(self.clusters_per_mft_record, self.bytes_per_cluster())
    }

    pub fn index_record_size(&self) -> u64 {
        record_size(self.clusters_per_index_record, self.bytes_per_cluster())
    }
}

// ===== MFT RECORD HEADER =====

/// Header of an MFT (FILE) record, 48 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct MftRecordHeader {
    pub signature: [u8; 4],
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence: u16,
    pub link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_used: u32,
    pub bytes_allocated: u32,
    pub base_record: u64,
    pub next_attr_id: u16,
    pub reserved: u16,
    pub record_number: u32,
}

const_assert_eq!(std::mem::size_of::<MftRecordHeader>(), 48);

// ===== ATTRIBUTE HEADER OFFSETS =====
//
// Attribute headers are walked by offset rather than cast: the record is
// untrusted and every length must be validated before the next step.

pub const ATTR_OFF_TYPE: usize = 0;
pub const ATTR_OFF_LENGTH: usize = 4;
pub const ATTR_OFF_NON_RESIDENT: usize = 8;
pub const ATTR_OFF_NAME_LENGTH: usize = 9;
pub const ATTR_OFF_NAME_OFFSET: usize = 10;
pub const ATTR_OFF_FLAGS: usize = 12;
pub const ATTR_OFF_INSTANCE: usize = 14;
// Resident form
pub const ATTR_OFF_VALUE_LENGTH: usize = 16;
pub const ATTR_OFF_VALUE_OFFSET: usize = 20;
// Non-resident form
pub const ATTR_OFF_LOWEST_VCN: usize = 16;
pub const ATTR_OFF_HIGHEST_VCN: usize = 24;
pub const ATTR_OFF_MAPPING_PAIRS: usize = 32;
pub const ATTR_OFF_ALLOCATED_SIZE: usize = 40;
pub const ATTR_OFF_DATA_SIZE: usize = 48;
pub const ATTR_OFF_INITIALIZED_SIZE: usize = 56;

pub const ATTR_RESIDENT_HEADER_LEN: usize = 24;
pub const ATTR_NON_RESIDENT_HEADER_LEN: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_clusters_per_record_is_a_shift() {
        let mut boot: NtfsBootSector = unsafe { std::mem::zeroed() };
        boot.bytes_per_sector = 512;
        boot.sectors_per_cluster = 8;
        boot.clusters_per_mft_record = -10; // 1 KiB records
        assert_eq!(boot.mft_record_size(), 1024);
        boot.clusters_per_mft_record = 1;
        assert_eq!(boot.mft_record_size(), 4096);
    }

    #[test]
    fn unrepresentable_shift_yields_zero_instead_of_overflowing() {
        let mut boot: NtfsBootSector = unsafe { std::mem::zeroed() };
        boot.bytes_per_sector = 512;
        boot.sectors_per_cluster = 8;
        boot.clusters_per_mft_record = -128; // would be 1 << 128
        assert_eq!(boot.mft_record_size(), 0);
        boot.clusters_per_mft_record = -64;
        assert_eq!(boot.mft_record_size(), 0);
    }

    #[test]
    fn baad_is_not_a_known_magic() {
        assert!(!KNOWN_RECORD_MAGICS.contains(&MAGIC_BAAD));
        assert!(KNOWN_RECORD_MAGICS.contains(&MAGIC_FILE));
    }
}
