// MFT records, attributes, and the generic open/read primitives
// Everything here treats record bytes as untrusted input: every offset and
// length is validated against both the attribute header and the record's
// used length before it is dereferenced.

use byteorder::{ByteOrder, LittleEndian};
use lodestone_core::{BlockDevice, LodestoneError};
use log::{debug, trace};

use crate::ntfs::boot_sector::Geometry;
use crate::ntfs::data_runs::{decode_data_runs, Runlist};
use crate::ntfs::fixup::{read_fixed, write_fixed};
use crate::ntfs::structures::*;

/// A fixed-up MFT record held in memory.
#[derive(Debug, Clone)]
pub struct MftRecord {
    pub number: u64,
    pub data: Vec<u8>,
}

/// Borrowed view of one attribute inside a record.
#[derive(Debug, Clone)]
pub struct RawAttribute<'a> {
    /// Offset of the attribute header within the record
    pub offset: usize,
    pub attr_type: u32,
    pub non_resident: bool,
    pub name: Option<String>,
    /// The full attribute (header + name + value or mapping pairs)
    pub data: &'a [u8],
}

impl MftRecord {
    /// Wrap fixed-up record bytes, validating the header shape. `number` is
    /// the index the caller read the record from.
    pub fn parse(number: u64, data: Vec<u8>) -> Result<Self, LodestoneError> {
        if data.len() < std::mem::size_of::<MftRecordHeader>() {
            return Err(LodestoneError::Corruption(format!(
                "MFT record {} shorter than its header",
                number
            )));
        }
        let record = Self { number, data };
        let header = record.header();
        if &header.signature != MAGIC_FILE {
            return Err(LodestoneError::Corruption(format!(
                "MFT record {} has bad magic {:?}",
                number, header.signature
            )));
        }
        let bytes_used = header.bytes_used as usize;
        let attrs_offset = header.attrs_offset as usize;
        if bytes_used > record.data.len() || attrs_offset >= bytes_used || attrs_offset < 48 {
            return Err(LodestoneError::Corruption(format!(
                "MFT record {} has inconsistent layout: used {}, attrs at {}",
                number, bytes_used, attrs_offset
            )));
        }
        Ok(record)
    }

    pub fn header(&self) -> MftRecordHeader {
        unsafe { std::ptr::read_unaligned(self.data.as_ptr() as *const MftRecordHeader) }
    }

    pub fn is_in_use(&self) -> bool {
        self.header().flags & MFT_RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.header().flags & MFT_RECORD_IS_DIRECTORY != 0
    }

    /// Bytes of the record that are actually in use, clamped to the record.
    pub fn bytes_used(&self) -> usize {
        (self.header().bytes_used as usize).min(self.data.len())
    }

    /// Walk the attributes of this record in storage order.
    pub fn attributes(&self) -> Result<Vec<RawAttribute<'_>>, LodestoneError> {
        let bytes_used = self.bytes_used();
        let mut offset = self.header().attrs_offset as usize;
        let mut attrs = Vec::new();

        while offset + 8 <= bytes_used {
            let attr_type = LittleEndian::read_u32(&self.data[offset..offset + 4]);
            if attr_type == ATTR_END {
                return Ok(attrs);
            }
            let length = LittleEndian::read_u32(&self.data[offset + 4..offset + 8]) as usize;
            if length < ATTR_RESIDENT_HEADER_LEN
                || length % 8 != 0
                || offset + length > bytes_used
            {
                return Err(LodestoneError::Corruption(format!(
                    "record {}: attribute {:#x} at {} has invalid length {}",
                    self.number, attr_type, offset, length
                )));
            }
            let slice = &self.data[offset..offset + length];
            let non_resident = slice[ATTR_OFF_NON_RESIDENT] != 0;
            if non_resident && length < ATTR_NON_RESIDENT_HEADER_LEN {
                return Err(LodestoneError::Corruption(format!(
                    "record {}: non-resident attribute {:#x} shorter than its header",
                    self.number, attr_type
                )));
            }
            let name = attribute_name(slice, self.number)?;
            attrs.push(RawAttribute {
                offset,
                attr_type,
                non_resident,
                name,
                data: slice,
            });
            offset += length;
        }
        Err(LodestoneError::Corruption(format!(
            "record {}: attribute walk ran past used bytes without an end marker",
            self.number
        )))
    }

    /// Find the first attribute of `attr_type` with the given name whose
    /// extent starts at VCN zero (the base extent).
    pub fn find_attribute(
        &self,
        attr_type: u32,
        name: Option<&str>,
    ) -> Result<Option<RawAttribute<'_>>, LodestoneError> {
        for attr in self.attributes()? {
            if attr.attr_type != attr_type {
                continue;
            }
            if attr.name.as_deref() != name {
                continue;
            }
            if attr.non_resident {
                let lowest_vcn =
                    LittleEndian::read_u64(&attr.data[ATTR_OFF_LOWEST_VCN..ATTR_OFF_LOWEST_VCN + 8]);
                if lowest_vcn != 0 {
                    continue;
                }
            }
            return Ok(Some(attr));
        }
        Ok(None)
    }

    /// Bounds-checked access to a resident attribute's value.
    ///
    /// The declared `(value_offset, value_length)` pair is validated against
    /// the attribute's own length and the record's used length; an on-disk
    /// value that would read outside either bound is corruption.
    pub fn resident_value<'a>(
        &'a self,
        attr: &RawAttribute<'a>,
    ) -> Result<&'a [u8], LodestoneError> {
        if attr.non_resident {
            return Err(LodestoneError::InvalidInput(format!(
                "attribute {:#x} in record {} is not resident",
                attr.attr_type, self.number
            )));
        }
        let value_length =
            LittleEndian::read_u32(&attr.data[ATTR_OFF_VALUE_LENGTH..ATTR_OFF_VALUE_LENGTH + 4])
                as usize;
        let value_offset =
            LittleEndian::read_u16(&attr.data[ATTR_OFF_VALUE_OFFSET..ATTR_OFF_VALUE_OFFSET + 2])
                as usize;
        let end = value_offset
            .checked_add(value_length)
            .ok_or_else(|| LodestoneError::Corruption("resident value overflow".to_string()))?;
        if value_offset < ATTR_RESIDENT_HEADER_LEN || end > attr.data.len() {
            return Err(LodestoneError::Corruption(format!(
                "record {}: resident value ({}, {}) outside attribute of {} bytes",
                self.number,
                value_offset,
                value_length,
                attr.data.len()
            )));
        }
        if attr.offset + end > self.bytes_used() {
            return Err(LodestoneError::Corruption(format!(
                "record {}: resident value reads past the record's used length",
                self.number
            )));
        }
        Ok(&attr.data[value_offset..end])
    }

    /// Replace (or insert, keeping type order) a resident attribute's value
    /// and fix up the record's accounting. Used by label rename.
    pub fn replace_resident_value(
        &mut self,
        attr_type: u32,
        new_value: &[u8],
    ) -> Result<(), LodestoneError> {
        let header = self.header();
        let bytes_used = self.bytes_used();

        // Locate the attribute, or the sorted insertion point
        let mut splice_at = None;
        let mut remove_len = 0usize;
        for attr in self.attributes()? {
            if attr.attr_type == attr_type && attr.name.is_none() && !attr.non_resident {
                splice_at = Some(attr.offset);
                remove_len = attr.data.len();
                break;
            }
            if attr.attr_type > attr_type {
                splice_at = Some(attr.offset);
                break;
            }
        }
        // Insertion point defaults to the end marker
        let splice_at = match splice_at {
            Some(at) => at,
            None => {
                let mut at = header.attrs_offset as usize;
                for attr in self.attributes()? {
                    at = attr.offset + attr.data.len();
                }
                at
            }
        };

        // Build the replacement attribute: 24-byte resident header + value,
        // padded to 8 bytes
        let attr_len = (ATTR_RESIDENT_HEADER_LEN + new_value.len() + 7) & !7;
        let mut attr = vec![0u8; attr_len];
        LittleEndian::write_u32(&mut attr[ATTR_OFF_TYPE..ATTR_OFF_TYPE + 4], attr_type);
        LittleEndian::write_u32(&mut attr[ATTR_OFF_LENGTH..ATTR_OFF_LENGTH + 4], attr_len as u32);
        LittleEndian::write_u16(
            &mut attr[ATTR_OFF_INSTANCE..ATTR_OFF_INSTANCE + 2],
            header.next_attr_id,
        );
        LittleEndian::write_u32(
            &mut attr[ATTR_OFF_VALUE_LENGTH..ATTR_OFF_VALUE_LENGTH + 4],
            new_value.len() as u32,
        );
        LittleEndian::write_u16(
            &mut attr[ATTR_OFF_VALUE_OFFSET..ATTR_OFF_VALUE_OFFSET + 2],
            ATTR_RESIDENT_HEADER_LEN as u16,
        );
        attr[ATTR_RESIDENT_HEADER_LEN..ATTR_RESIDENT_HEADER_LEN + new_value.len()]
            .copy_from_slice(new_value);

        let new_used = bytes_used - remove_len + attr_len;
        if new_used > header.bytes_allocated as usize || new_used > self.data.len() {
            return Err(LodestoneError::InvalidInput(format!(
                "record {} cannot hold a {} byte resident value",
                self.number,
                new_value.len()
            )));
        }

        // Splice: shift the tail, drop the old attribute, place the new one
        let tail: Vec<u8> = self.data[splice_at + remove_len..bytes_used].to_vec();
        self.data[splice_at..splice_at + attr_len].copy_from_slice(&attr);
        self.data[splice_at + attr_len..splice_at + attr_len + tail.len()].copy_from_slice(&tail);
        for byte in &mut self.data[new_used..bytes_used.max(new_used)] {
            *byte = 0;
        }

        LittleEndian::write_u32(&mut self.data[24..28], new_used as u32);
        LittleEndian::write_u16(&mut self.data[40..42], header.next_attr_id.wrapping_add(1));
        Ok(())
    }
}

fn attribute_name(attr: &[u8], record: u64) -> Result<Option<String>, LodestoneError> {
    let name_length = attr[ATTR_OFF_NAME_LENGTH] as usize;
    if name_length == 0 {
        return Ok(None);
    }
    let name_offset =
        LittleEndian::read_u16(&attr[ATTR_OFF_NAME_OFFSET..ATTR_OFF_NAME_OFFSET + 2]) as usize;
    let end = name_offset + name_length * 2;
    if end > attr.len() {
        return Err(LodestoneError::Corruption(format!(
            "record {}: attribute name outside attribute bounds",
            record
        )));
    }
    let units: Vec<u16> = attr[name_offset..end]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    Ok(Some(String::from_utf16_lossy(&units)))
}

/// An opened data stream of an inode.
#[derive(Debug, Clone)]
pub struct AttributeHandle {
    pub inode: u64,
    pub attr_type: u32,
    pub name: Option<String>,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
    /// Copy of the value for resident attributes
    pub resident: Option<Vec<u8>>,
    pub runlist: Runlist,
}

impl AttributeHandle {
    /// Open the base extent of an attribute from an in-memory record.
    pub fn open(
        record: &MftRecord,
        attr_type: u32,
        name: Option<&str>,
    ) -> Result<AttributeHandle, LodestoneError> {
        let attr = record.find_attribute(attr_type, name)?.ok_or_else(|| {
            LodestoneError::Corruption(format!(
                "record {} has no attribute {:#x} (name {:?})",
                record.number, attr_type, name
            ))
        })?;

        if attr.non_resident {
            let lowest =
                LittleEndian::read_u64(&attr.data[ATTR_OFF_LOWEST_VCN..ATTR_OFF_LOWEST_VCN + 8]);
            let allocated = LittleEndian::read_u64(
                &attr.data[ATTR_OFF_ALLOCATED_SIZE..ATTR_OFF_ALLOCATED_SIZE + 8],
            );
            let data_size =
                LittleEndian::read_u64(&attr.data[ATTR_OFF_DATA_SIZE..ATTR_OFF_DATA_SIZE + 8]);
            let initialized = LittleEndian::read_u64(
                &attr.data[ATTR_OFF_INITIALIZED_SIZE..ATTR_OFF_INITIALIZED_SIZE + 8],
            );
            let mapping_offset = LittleEndian::read_u16(
                &attr.data[ATTR_OFF_MAPPING_PAIRS..ATTR_OFF_MAPPING_PAIRS + 2],
            ) as usize;
            if mapping_offset < ATTR_NON_RESIDENT_HEADER_LEN || mapping_offset > attr.data.len() {
                return Err(LodestoneError::Corruption(format!(
                    "record {}: mapping pairs offset {} out of bounds",
                    record.number, mapping_offset
                )));
            }
            let runs = decode_data_runs(&attr.data[mapping_offset..])?;
            let mut runlist = Runlist::new();
            runlist.append(lowest, &runs)?;
            trace!(
                "opened non-resident attribute {:#x} of record {}: {} bytes in {} runs",
                attr_type,
                record.number,
                data_size,
                runlist.runs().len()
            );
            Ok(AttributeHandle {
                inode: record.number,
                attr_type,
                name: name.map(str::to_string),
                allocated_size: allocated,
                data_size,
                initialized_size: initialized,
                resident: None,
                runlist,
            })
        } else {
            let value = record.resident_value(&attr)?.to_vec();
            let len = value.len() as u64;
            Ok(AttributeHandle {
                inode: record.number,
                attr_type,
                name: name.map(str::to_string),
                allocated_size: len,
                data_size: len,
                initialized_size: len,
                resident: Some(value),
                runlist: Runlist::new(),
            })
        }
    }

    /// Merge a further extent of this attribute (from an extension record).
    pub fn merge_extent(&mut self, attr: &RawAttribute<'_>) -> Result<(), LodestoneError> {
        if !attr.non_resident {
            return Err(LodestoneError::Corruption(
                "attribute extent is resident".to_string(),
            ));
        }
        let lowest =
            LittleEndian::read_u64(&attr.data[ATTR_OFF_LOWEST_VCN..ATTR_OFF_LOWEST_VCN + 8]);
        let mapping_offset = LittleEndian::read_u16(
            &attr.data[ATTR_OFF_MAPPING_PAIRS..ATTR_OFF_MAPPING_PAIRS + 2],
        ) as usize;
        if mapping_offset < ATTR_NON_RESIDENT_HEADER_LEN || mapping_offset > attr.data.len() {
            return Err(LodestoneError::Corruption(
                "extent mapping pairs offset out of bounds".to_string(),
            ));
        }
        let runs = decode_data_runs(&attr.data[mapping_offset..])?;
        self.runlist.append(lowest, &runs)
    }
}

/// Read `len` bytes at `offset` from an opened stream.
pub fn read_stream(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    handle: &AttributeHandle,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>, LodestoneError> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| LodestoneError::InvalidInput("stream read overflow".to_string()))?;
    if end > handle.data_size {
        return Err(LodestoneError::InvalidInput(format!(
            "read of {} bytes at {} past stream size {}",
            len, offset, handle.data_size
        )));
    }

    if let Some(resident) = &handle.resident {
        return Ok(resident[offset as usize..end as usize].to_vec());
    }

    let cluster_size = geometry.cluster_size;
    let mut out = Vec::with_capacity(len);
    let mut position = offset;
    while position < end {
        let vcn = position / cluster_size;
        let within = position % cluster_size;
        let chunk = ((cluster_size - within) as usize).min((end - position) as usize);
        match handle.runlist.map_vcn(vcn)? {
            Some(lcn) => {
                let bytes = device.read_at(geometry.cluster_offset(lcn) + within, chunk)?;
                out.extend_from_slice(&bytes);
            }
            None => {
                // Sparse cluster reads as zeros
                out.resize(out.len() + chunk, 0);
            }
        }
        position += chunk as u64;
    }
    Ok(out)
}

/// Read a whole stream into an owned buffer.
pub fn read_stream_all(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    handle: &AttributeHandle,
) -> Result<Vec<u8>, LodestoneError> {
    read_stream(device, geometry, handle, 0, handle.data_size as usize)
}

/// An in-memory metadata record plus its attribute-list extension, if any.
#[derive(Debug, Clone)]
pub struct Inode {
    pub number: u64,
    pub record: MftRecord,
    pub attr_list: Option<Vec<u8>>,
}

/// Byte offset of an MFT record on the device, resolved through the MFT's
/// own runlist.
pub fn mft_record_offset(
    geometry: &Geometry,
    mft_data: &AttributeHandle,
    number: u64,
) -> Result<u64, LodestoneError> {
    let byte_offset = number
        .checked_mul(geometry.mft_record_size)
        .ok_or_else(|| LodestoneError::InvalidInput("record number overflow".to_string()))?;
    if byte_offset + geometry.mft_record_size > mft_data.data_size {
        return Err(LodestoneError::Corruption(format!(
            "MFT record {} lies past the end of the MFT data stream",
            number
        )));
    }
    let vcn = byte_offset / geometry.cluster_size;
    let within = byte_offset % geometry.cluster_size;
    let lcn = mft_data.runlist.map_vcn(vcn)?.ok_or_else(|| {
        LodestoneError::Corruption(format!("MFT record {} maps to a sparse cluster", number))
    })?;
    Ok(geometry.cluster_offset(lcn) + within)
}

/// Open an inode through the generic path: locate its record via the MFT
/// runlist, apply fixups, and attach the attribute-list extension when the
/// record carries one.
pub fn open_inode(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
    number: u64,
) -> Result<Inode, LodestoneError> {
    let offset = mft_record_offset(geometry, mft_data, number)?;
    let bytes = read_fixed(device, offset, 1, geometry.mft_record_size, geometry.sector_size)?;
    let record = MftRecord::parse(number, bytes)?;
    if !record.is_in_use() {
        return Err(LodestoneError::Corruption(format!(
            "system record {} is not marked in use",
            number
        )));
    }

    let attr_list = match record.find_attribute(ATTR_TYPE_ATTRIBUTE_LIST, None)? {
        Some(attr) => {
            let list = if attr.non_resident {
                let handle = AttributeHandle::open(&record, ATTR_TYPE_ATTRIBUTE_LIST, None)?;
                read_stream_all(device, geometry, &handle)?
            } else {
                record.resident_value(&attr)?.to_vec()
            };
            if list.is_empty() || list.len() as u64 > ATTR_LIST_MAX_BYTES {
                return Err(LodestoneError::Corruption(format!(
                    "record {}: attribute list of {} bytes is out of bounds",
                    number,
                    list.len()
                )));
            }
            debug!("inode {} carries a {} byte attribute list", number, list.len());
            Some(list)
        }
        None => None,
    };

    Ok(Inode {
        number,
        record,
        attr_list,
    })
}

/// Write a modified record back through the MFT runlist with fresh fixups.
pub fn write_record(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
    record: &MftRecord,
) -> Result<(), LodestoneError> {
    let offset = mft_record_offset(geometry, mft_data, record.number)?;
    write_fixed(device, offset, &record.data, geometry.sector_size)
}
