// Bootstrapping the MFT and its mirror
//
// Record 0 describes the MFT itself, so the generic open path cannot be used
// for it: we read the record directly at the boot sector's MFT cluster, then
// grow the data runlist extent by extent, resolving each extension record
// through the runs merged so far. Only once record 0 is fully open does the
// rest of the volume go through `open_inode`.

use byteorder::{ByteOrder, LittleEndian};
use lodestone_core::{BlockDevice, LodestoneError};
use log::{debug, info};

use crate::ntfs::boot_sector::Geometry;
use crate::ntfs::fixup::read_fixed;
use crate::ntfs::mft::{open_inode, read_stream_all, AttributeHandle, MftRecord};
use crate::ntfs::structures::*;

/// The fully opened MFT: its own record, data stream, and record bitmap.
pub struct MftHandles {
    pub record: MftRecord,
    pub data: AttributeHandle,
    pub bitmap: AttributeHandle,
}

/// One entry of an $ATTRIBUTE_LIST value.
struct AttrListEntry {
    attr_type: u32,
    lowest_vcn: u64,
    record: u64,
}

fn parse_attr_list(list: &[u8]) -> Result<Vec<AttrListEntry>, LodestoneError> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset + 26 <= list.len() {
        let attr_type = LittleEndian::read_u32(&list[offset..offset + 4]);
        let length = LittleEndian::read_u16(&list[offset + 4..offset + 6]) as usize;
        if length < 26 || offset + length > list.len() {
            return Err(LodestoneError::Corruption(format!(
                "attribute list entry at {} has invalid length {}",
                offset, length
            )));
        }
        let lowest_vcn = LittleEndian::read_u64(&list[offset + 8..offset + 16]);
        // Low 48 bits of the file reference are the record number
        let reference = LittleEndian::read_u64(&list[offset + 16..offset + 24]);
        entries.push(AttrListEntry {
            attr_type,
            lowest_vcn,
            record: reference & 0x0000_FFFF_FFFF_FFFF,
        });
        offset += length;
    }
    if offset != list.len() {
        return Err(LodestoneError::Corruption(
            "attribute list has trailing bytes that are not an entry".to_string(),
        ));
    }
    Ok(entries)
}

/// Open record 0 and its data stream without any table to go through.
pub fn bootstrap_mft(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
) -> Result<MftHandles, LodestoneError> {
    let offset = geometry.cluster_offset(geometry.mft_start);
    let bytes = read_fixed(device, offset, 1, geometry.mft_record_size, geometry.sector_size)?;
    let record = MftRecord::parse(MFT_RECORD_MFT, bytes)?;
    if !record.is_in_use() {
        return Err(LodestoneError::Corruption(
            "MFT record 0 is not marked in use".to_string(),
        ));
    }

    let mut data = AttributeHandle::open(&record, ATTR_TYPE_DATA, None)?;
    if data.resident.is_some() {
        return Err(LodestoneError::Corruption(
            "MFT data stream is resident".to_string(),
        ));
    }

    // A large MFT spills further DATA extents into extension records, named
    // by the attribute list. Each extension must be reachable through the
    // runs merged before it; a forward reference is unresolvable and
    // therefore corruption.
    if let Some(attr) = record.find_attribute(ATTR_TYPE_ATTRIBUTE_LIST, None)? {
        let list = if attr.non_resident {
            let handle = AttributeHandle::open(&record, ATTR_TYPE_ATTRIBUTE_LIST, None)?;
            if handle.data_size > ATTR_LIST_MAX_BYTES {
                return Err(LodestoneError::Corruption(format!(
                    "MFT attribute list of {} bytes is out of bounds",
                    handle.data_size
                )));
            }
            read_stream_all(device, geometry, &handle)?
        } else {
            record.resident_value(&attr)?.to_vec()
        };
        for entry in parse_attr_list(&list)? {
            if entry.attr_type != ATTR_TYPE_DATA || entry.record == MFT_RECORD_MFT {
                continue;
            }
            debug!(
                "MFT data extent at VCN {} lives in extension record {}",
                entry.lowest_vcn, entry.record
            );
            let ext_byte = entry
                .record
                .checked_mul(geometry.mft_record_size)
                .ok_or_else(|| {
                    LodestoneError::Corruption("extension record number overflow".to_string())
                })?;
            let vcn = ext_byte / geometry.cluster_size;
            let within = ext_byte % geometry.cluster_size;
            let lcn = data.runlist.map_vcn(vcn)?.ok_or_else(|| {
                LodestoneError::Corruption(format!(
                    "extension record {} is not covered by the runs read so far",
                    entry.record
                ))
            })?;
            let ext_bytes = read_fixed(
                device,
                geometry.cluster_offset(lcn) + within,
                1,
                geometry.mft_record_size,
                geometry.sector_size,
            )?;
            let ext = MftRecord::parse(entry.record, ext_bytes)?;
            let ext_attr = ext
                .attributes()?
                .into_iter()
                .find(|a| {
                    a.attr_type == ATTR_TYPE_DATA
                        && a.non_resident
                        && LittleEndian::read_u64(
                            &a.data[ATTR_OFF_LOWEST_VCN..ATTR_OFF_LOWEST_VCN + 8],
                        ) == entry.lowest_vcn
                })
                .ok_or_else(|| {
                    LodestoneError::Corruption(format!(
                        "extension record {} lacks the data extent at VCN {}",
                        entry.record, entry.lowest_vcn
                    ))
                })?;
            data.merge_extent(&ext_attr)?;
        }
    }

    // The table cannot have holes: every record must map to a real cluster.
    if data.runlist.runs().iter().any(|run| run.lcn.is_none()) {
        return Err(LodestoneError::Corruption(
            "MFT data stream contains sparse runs".to_string(),
        ));
    }
    let covered: u64 = data
        .runlist
        .runs()
        .iter()
        .map(|run| run.length)
        .sum::<u64>()
        * geometry.cluster_size;
    if covered != data.allocated_size || data.data_size > data.allocated_size {
        return Err(LodestoneError::Corruption(format!(
            "MFT runlist covers {} bytes but the record declares {} allocated / {} used",
            covered, data.allocated_size, data.data_size
        )));
    }
    if data.runlist.first_lcn() != Some(geometry.mft_start) {
        return Err(LodestoneError::Corruption(
            "MFT runlist disagrees with the boot sector about its first cluster".to_string(),
        ));
    }

    let bitmap = AttributeHandle::open(&record, ATTR_TYPE_BITMAP, None)?;
    info!(
        "MFT open: {} records in {} runs",
        geometry.records_in(data.data_size),
        data.runlist.runs().len()
    );
    Ok(MftHandles {
        record,
        data,
        bitmap,
    })
}

/// Open the $MFTMirr data stream through the now-working table and check it
/// against the boot sector's mirror cluster.
pub fn open_mirror(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
) -> Result<AttributeHandle, LodestoneError> {
    let inode = open_inode(device, geometry, mft_data, MFT_RECORD_MFTMIRR)?;
    let mirror = AttributeHandle::open(&inode.record, ATTR_TYPE_DATA, None)?;
    if mirror.resident.is_none() && mirror.runlist.first_lcn() != Some(geometry.mirror_start) {
        return Err(LodestoneError::Corruption(format!(
            "mirror runlist starts at {:?} but the boot sector says cluster {}",
            mirror.runlist.first_lcn(),
            geometry.mirror_start
        )));
    }
    if mirror.data_size < geometry.mft_record_size {
        return Err(LodestoneError::Corruption(format!(
            "mirror stream of {} bytes cannot hold a single record",
            mirror.data_size
        )));
    }
    Ok(mirror)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::test_image::{build_default_image, build_image, ImageOptions};
    use lodestone_core::MemoryBlockDevice;

    fn geometry_of(bytes: &[u8]) -> Geometry {
        Geometry::parse(&bytes[..512]).unwrap()
    }

    #[test]
    fn bootstraps_the_synthetic_mft() {
        let image = build_default_image();
        let geometry = geometry_of(&image.bytes);
        let mut device = MemoryBlockDevice::new(image.bytes);
        let mft = bootstrap_mft(&mut device, &geometry).unwrap();
        assert_eq!(mft.data.data_size, 32 * 1024);
        assert_eq!(mft.data.runlist.first_lcn(), Some(geometry.mft_start));
        assert!(mft.bitmap.resident.is_some());
    }

    #[test]
    fn rejects_a_record_zero_with_bad_magic() {
        let image = build_default_image();
        let geometry = geometry_of(&image.bytes);
        let mut bytes = image.bytes;
        bytes[image.mft_offset as usize] = b'X';
        let mut device = MemoryBlockDevice::new(bytes);
        assert!(matches!(
            bootstrap_mft(&mut device, &geometry),
            Err(LodestoneError::Corruption(_))
        ));
    }

    #[test]
    fn mirror_runlist_must_match_the_boot_sector() {
        let image = build_image(&ImageOptions {
            mirror_run_lcn: Some(17),
            ..ImageOptions::default()
        });
        let geometry = geometry_of(&image.bytes);
        let mut device = MemoryBlockDevice::new(image.bytes);
        let mft = bootstrap_mft(&mut device, &geometry).unwrap();
        assert!(matches!(
            open_mirror(&mut device, &geometry, &mft.data),
            Err(LodestoneError::Corruption(_))
        ));
    }

    #[test]
    fn opens_the_healthy_mirror() {
        let image = build_default_image();
        let geometry = geometry_of(&image.bytes);
        let mut device = MemoryBlockDevice::new(image.bytes);
        let mft = bootstrap_mft(&mut device, &geometry).unwrap();
        let mirror = open_mirror(&mut device, &geometry, &mft.data).unwrap();
        assert_eq!(mirror.data_size, image.cluster_size);
        assert_eq!(mirror.runlist.first_lcn(), Some(geometry.mirror_start));
    }
}
