// Mirror cross-validation and the table-dependent system structures:
// the cluster bitmap, $UpCase, $Volume, $AttrDef, and the security store.

use byteorder::{ByteOrder, LittleEndian};
use lodestone_core::{BlockDevice, LodestoneError};
use log::{debug, warn};

use crate::ntfs::boot_sector::Geometry;
use crate::ntfs::fixup::{apply_fixups, read_fixed};
use crate::ntfs::mft::{
    mft_record_offset, open_inode, read_stream, read_stream_all, AttributeHandle, MftRecord,
};
use crate::ntfs::structures::*;

// ===== MIRROR CROSS-VALIDATION =====

/// Compare the first system records of the table against the mirror.
///
/// Only records the table marks in use participate: a free slot carries no
/// promise about its mirror copy. For participating records both copies must
/// carry a known record magic, and the table copy's used bytes must match
/// the mirror byte for byte. Any disagreement means a torn or rolled-back
/// metadata write, and nothing downstream of the table can be trusted.
pub fn cross_validate_mirror(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
    mirror: &AttributeHandle,
) -> Result<(), LodestoneError> {
    let record_size = geometry.mft_record_size;
    let in_table = geometry.records_in(mft_data.data_size);
    let in_mirror = geometry.records_in(mirror.data_size);
    let count = MIRROR_CHECK_RECORDS.min(in_table).min(in_mirror);

    let mut mirror_bytes = read_stream(device, geometry, mirror, 0, (count * record_size) as usize)?;
    for chunk in mirror_bytes.chunks_mut(record_size as usize) {
        apply_fixups(chunk, geometry.sector_size as usize)?;
    }

    let mut compared = 0u64;
    for number in 0..count {
        let offset = mft_record_offset(geometry, mft_data, number)?;
        let table_copy = read_fixed(device, offset, 1, record_size, geometry.sector_size)?;
        let flags = LittleEndian::read_u16(&table_copy[22..24]);
        if flags & MFT_RECORD_IN_USE == 0 {
            continue;
        }

        let mirror_copy =
            &mirror_bytes[(number * record_size) as usize..((number + 1) * record_size) as usize];
        for (which, copy) in [("table", &table_copy[..]), ("mirror", mirror_copy)] {
            let magic = &copy[0..4];
            if !KNOWN_RECORD_MAGICS.iter().any(|known| &known[..] == magic) {
                return Err(LodestoneError::Corruption(format!(
                    "{} copy of record {} has unknown magic {:?}",
                    which, number, magic
                )));
            }
        }

        let bytes_used = (LittleEndian::read_u32(&table_copy[24..28]) as u64).min(record_size)
            as usize;
        if table_copy[..bytes_used] != mirror_copy[..bytes_used] {
            return Err(LodestoneError::Corruption(format!(
                "record {} differs between the table and its mirror",
                number
            )));
        }
        compared += 1;
    }
    debug!("mirror matches the table across {} in-use records", compared);
    Ok(())
}

// ===== CLUSTER BITMAP =====

/// Open the $Bitmap data stream and check it can describe the whole volume.
pub fn load_cluster_bitmap(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
) -> Result<AttributeHandle, LodestoneError> {
    let inode = open_inode(device, geometry, mft_data, MFT_RECORD_BITMAP)?;
    let handle = AttributeHandle::open(&inode.record, ATTR_TYPE_DATA, None)?;
    if handle.data_size > handle.allocated_size && handle.resident.is_none() {
        return Err(LodestoneError::Corruption(format!(
            "cluster bitmap claims {} bytes in {} allocated",
            handle.data_size, handle.allocated_size
        )));
    }
    let needed_bits = geometry.total_clusters;
    if handle.data_size * 8 < needed_bits {
        return Err(LodestoneError::Corruption(format!(
            "cluster bitmap of {} bytes cannot cover {} clusters",
            handle.data_size, needed_bits
        )));
    }
    Ok(handle)
}

/// Count the zero bits among the first `total_bits` of a bitmap.
pub fn count_free_bits(bitmap: &[u8], total_bits: u64) -> u64 {
    let mut free = 0u64;
    for bit in 0..total_bits {
        let byte = (bit / 8) as usize;
        if byte >= bitmap.len() {
            break;
        }
        if bitmap[byte] & (1 << (bit % 8)) == 0 {
            free += 1;
        }
    }
    free
}

// ===== CASE FOLDING TABLE =====

/// The volume's case folding table.
pub struct UpcaseTable {
    pub table: Vec<u16>,
    /// How many entries actually came from disk; the rest are the built-in
    /// default a short table was overlaid onto
    pub disk_entries: usize,
}

// 65536 entries are noise in a failure message
impl std::fmt::Debug for UpcaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcaseTable")
            .field("disk_entries", &self.disk_entries)
            .finish_non_exhaustive()
    }
}

impl UpcaseTable {
    pub fn upper(&self, unit: u16) -> u16 {
        self.table[unit as usize]
    }
}

/// The identity mapping with ASCII lower case folded to upper case.
pub fn default_upcase_table() -> Vec<u16> {
    (0u32..65536)
        .map(|code| match code {
            0x61..=0x7A => (code - 0x20) as u16,
            other => other as u16,
        })
        .collect()
}

/// Check the printable ASCII range behaves: letters fold upward, the rest
/// map to themselves.
fn upcase_probe(table: &[u16]) -> bool {
    (0x20u16..=0x7E).all(|code| match code {
        0x61..=0x7A => table[code as usize] == code - 0x20,
        _ => table[code as usize] == code,
    })
}

/// Load $UpCase. A short table overlays the built-in default; an odd or
/// oversized one is corruption. A table that fails the ASCII probe is fatal
/// too: every case-insensitive name comparison afterwards would silently
/// give wrong answers.
pub fn load_upcase(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
) -> Result<UpcaseTable, LodestoneError> {
    let inode = open_inode(device, geometry, mft_data, MFT_RECORD_UPCASE)?;
    let handle = AttributeHandle::open(&inode.record, ATTR_TYPE_DATA, None)?;
    if handle.data_size % 2 != 0 || handle.data_size == 0 || handle.data_size > UPCASE_MAX_BYTES {
        return Err(LodestoneError::Corruption(format!(
            "$UpCase stream of {} bytes (maximum {}, must be even)",
            handle.data_size, UPCASE_MAX_BYTES
        )));
    }
    let bytes = read_stream_all(device, geometry, &handle)?;
    let mut table = default_upcase_table();
    let disk_entries = bytes.len() / 2;
    if disk_entries < table.len() {
        warn!(
            "$UpCase holds {} of {} entries, keeping defaults for the rest",
            disk_entries,
            table.len()
        );
    }
    for (entry, raw) in table.iter_mut().zip(bytes.chunks_exact(2)) {
        *entry = LittleEndian::read_u16(raw);
    }
    if !upcase_probe(&table) {
        return Err(LodestoneError::Corruption(
            "$UpCase fails the ASCII folding probe".to_string(),
        ));
    }
    Ok(UpcaseTable {
        table,
        disk_entries,
    })
}

// ===== VOLUME DESCRIPTOR =====

/// The decoded $Volume record: label and version/dirty flags.
#[derive(Debug)]
pub struct VolumeInfo {
    pub label: String,
    /// The on-disk name value had an odd length; a rewrite on a writable
    /// mount will store the truncated form
    pub label_needs_rewrite: bool,
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: u16,
    pub record: MftRecord,
}

impl VolumeInfo {
    pub fn is_dirty(&self) -> bool {
        self.flags & VOLUME_IS_DIRTY != 0
    }
}

pub fn load_volume_info(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
) -> Result<VolumeInfo, LodestoneError> {
    let inode = open_inode(device, geometry, mft_data, MFT_RECORD_VOLUME)?;
    let record = inode.record;

    let (label, label_needs_rewrite) = match record.find_attribute(ATTR_TYPE_VOLUME_NAME, None)? {
        Some(attr) if !attr.non_resident => {
            let value = record.resident_value(&attr)?;
            let odd = value.len() % 2 != 0;
            if odd {
                warn!("volume name value has odd length {}, truncating", value.len());
            }
            let even = &value[..value.len() - value.len() % 2];
            let units: Vec<u16> = even.chunks_exact(2).map(LittleEndian::read_u16).collect();
            // Unmappable units become '_' rather than failing the mount
            let label: String = char::decode_utf16(units.iter().copied())
                .map(|unit| unit.unwrap_or('_'))
                .collect();
            (label, odd)
        }
        Some(_) => {
            return Err(LodestoneError::Corruption(
                "volume name attribute is non-resident".to_string(),
            ))
        }
        None => (String::new(), false),
    };

    let info_attr = record
        .find_attribute(ATTR_TYPE_VOLUME_INFORMATION, None)?
        .ok_or_else(|| {
            LodestoneError::Corruption("$Volume lacks a volume information attribute".to_string())
        })?;
    let info = record.resident_value(&info_attr)?.to_vec();
    if info.len() < 12 {
        return Err(LodestoneError::Corruption(format!(
            "volume information value of {} bytes is too short",
            info.len()
        )));
    }
    let major_version = info[8];
    let minor_version = info[9];
    let flags = LittleEndian::read_u16(&info[10..12]);
    debug!(
        "volume '{}' (NTFS {}.{}, flags {:#06x})",
        label, major_version, minor_version, flags
    );

    Ok(VolumeInfo {
        label,
        label_needs_rewrite,
        major_version,
        minor_version,
        flags,
        record,
    })
}

// ===== ATTRIBUTE DEFINITIONS =====

/// Load the $AttrDef stream into an owned buffer.
pub fn load_attrdef(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
) -> Result<Vec<u8>, LodestoneError> {
    let inode = open_inode(device, geometry, mft_data, MFT_RECORD_ATTRDEF)?;
    let handle = AttributeHandle::open(&inode.record, ATTR_TYPE_DATA, None)?;
    if handle.data_size == 0 || handle.data_size > ATTRDEF_MAX_BYTES {
        return Err(LodestoneError::Corruption(format!(
            "$AttrDef stream size {} is out of bounds",
            handle.data_size
        )));
    }
    read_stream_all(device, geometry, &handle)
}

// ===== SECURITY STORE =====

/// Open the $Secure:$SDS stream. Volumes from before security descriptors
/// were centralized have no $Secure record at all, so absence is not an
/// error.
pub fn load_security(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
) -> Result<Option<AttributeHandle>, LodestoneError> {
    if geometry.records_in(mft_data.data_size) <= MFT_RECORD_SECURE {
        return Ok(None);
    }
    let offset = mft_record_offset(geometry, mft_data, MFT_RECORD_SECURE)?;
    let bytes = read_fixed(device, offset, 1, geometry.mft_record_size, geometry.sector_size)?;
    let record = MftRecord::parse(MFT_RECORD_SECURE, bytes)?;
    if !record.is_in_use() {
        debug!("no $Secure record, treating the volume as pre-3.0");
        return Ok(None);
    }
    match record.find_attribute(ATTR_TYPE_DATA, Some("$SDS"))? {
        Some(_) => Ok(Some(AttributeHandle::open(
            &record,
            ATTR_TYPE_DATA,
            Some("$SDS"),
        )?)),
        None => {
            debug!("$Secure record carries no $SDS stream");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::bootstrap::{bootstrap_mft, open_mirror};
    use crate::ntfs::test_image::{build_default_image, build_image, ImageOptions};
    use lodestone_core::MemoryBlockDevice;

    struct Opened {
        device: MemoryBlockDevice,
        geometry: Geometry,
        mft_data: AttributeHandle,
    }

    fn open(bytes: Vec<u8>) -> Opened {
        let geometry = Geometry::parse(&bytes[..512]).unwrap();
        let mut device = MemoryBlockDevice::new(bytes);
        let mft = bootstrap_mft(&mut device, &geometry).unwrap();
        Opened {
            device,
            geometry,
            mft_data: mft.data,
        }
    }

    #[test]
    fn healthy_mirror_cross_validates() {
        let image = build_default_image();
        let mut o = open(image.bytes);
        let mirror = open_mirror(&mut o.device, &o.geometry, &o.mft_data).unwrap();
        cross_validate_mirror(&mut o.device, &o.geometry, &o.mft_data, &mirror).unwrap();
    }

    #[test]
    fn diverged_mirror_is_rejected() {
        let image = build_default_image();
        let mut bytes = image.bytes;
        // Flip a payload byte in the mirror's copy of record 0, away from
        // the sector-end fixup positions
        bytes[image.mirror_offset as usize + 100] ^= 0xFF;
        let mut o = open(bytes);
        let mirror = open_mirror(&mut o.device, &o.geometry, &o.mft_data).unwrap();
        let err =
            cross_validate_mirror(&mut o.device, &o.geometry, &o.mft_data, &mirror).unwrap_err();
        assert!(matches!(err, LodestoneError::Corruption(_)));
    }

    #[test]
    fn bitmap_covers_the_volume_and_counts_free_clusters() {
        let image = build_default_image();
        let expected = image.expected_free_clusters;
        let mut o = open(image.bytes);
        let bitmap = load_cluster_bitmap(&mut o.device, &o.geometry, &o.mft_data).unwrap();
        let bytes = read_stream_all(&mut o.device, &o.geometry, &bitmap).unwrap();
        assert_eq!(count_free_bits(&bytes, o.geometry.total_clusters), expected);
    }

    #[test]
    fn upcase_loads_and_folds() {
        let image = build_default_image();
        let mut o = open(image.bytes);
        let upcase = load_upcase(&mut o.device, &o.geometry, &o.mft_data).unwrap();
        assert_eq!(upcase.disk_entries, 65536);
        assert_eq!(upcase.upper(b'a' as u16), b'A' as u16);
        // Debug must summarize, not dump 65536 entries
        let dump = format!("{:?}", upcase);
        assert!(dump.contains("disk_entries") && dump.len() < 128);
    }

    #[test]
    fn garbled_upcase_is_corruption() {
        let image = build_default_image();
        let mut bytes = image.bytes;
        // Make 'A' fold to something absurd
        let at = image.upcase_offset as usize + 0x41 * 2;
        bytes[at] = 0x00;
        bytes[at + 1] = 0x30;
        let mut o = open(bytes);
        let err = load_upcase(&mut o.device, &o.geometry, &o.mft_data).unwrap_err();
        assert!(matches!(err, LodestoneError::Corruption(_)));
    }

    #[test]
    fn volume_info_reads_the_label() {
        let image = build_default_image();
        let mut o = open(image.bytes);
        let info = load_volume_info(&mut o.device, &o.geometry, &o.mft_data).unwrap();
        assert_eq!(info.label, "TestVolume");
        assert!(!info.label_needs_rewrite);
        assert!(!info.is_dirty());
        assert_eq!(info.major_version, 3);
    }

    #[test]
    fn odd_length_label_is_truncated_and_flagged() {
        let image = build_image(&ImageOptions {
            odd_label_byte: true,
            ..ImageOptions::default()
        });
        let mut o = open(image.bytes);
        let info = load_volume_info(&mut o.device, &o.geometry, &o.mft_data).unwrap();
        assert_eq!(info.label, "TestVolume");
        assert!(info.label_needs_rewrite);
    }

    #[test]
    fn oversized_attrdef_is_rejected() {
        let image = build_image(&ImageOptions {
            attrdef_declared_size: Some(0x0100_0001),
            ..ImageOptions::default()
        });
        let mut o = open(image.bytes);
        let err = load_attrdef(&mut o.device, &o.geometry, &o.mft_data).unwrap_err();
        assert!(matches!(err, LodestoneError::Corruption(_)));
    }

    #[test]
    fn security_store_is_present_on_the_synthetic_volume() {
        let image = build_default_image();
        let mut o = open(image.bytes);
        let sds = load_security(&mut o.device, &o.geometry, &o.mft_data).unwrap();
        assert!(sds.is_some());
    }
}
