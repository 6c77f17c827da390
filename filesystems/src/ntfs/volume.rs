// A mounted volume: the opened system structures and the operations that
// work through them. Every structure sits in an Option slot so teardown can
// release them one by one in a fixed order.

use std::fmt;

use serde::{Deserialize, Serialize};

use byteorder::{ByteOrder, LittleEndian};
use lodestone_core::{BlockDevice, LodestoneError};
use log::{debug, info};

use crate::ntfs::boot_sector::Geometry;
use crate::ntfs::fixup::write_fixed;
use crate::ntfs::mft::{read_stream_all, write_record, AttributeHandle, MftRecord};
use crate::ntfs::structures::*;
use crate::ntfs::validation::{count_free_bits, UpcaseTable, VolumeInfo};

/// Longest label the volume name attribute accepts, in UTF-16 units.
pub const MAX_LABEL_UNITS: usize = 32;

/// Space accounting for a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpace {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub total_clusters: u64,
    pub free_clusters: u64,
    pub free_mft_records: u64,
}

pub struct Volume {
    pub(crate) device: Box<dyn BlockDevice>,
    pub(crate) geometry: Geometry,
    pub(crate) read_only: bool,
    // Slots in acquisition order; teardown drains them in reverse
    pub(crate) mft_record: Option<MftRecord>,
    pub(crate) mft_data: Option<AttributeHandle>,
    pub(crate) mft_bitmap: Option<AttributeHandle>,
    pub(crate) mirror: Option<AttributeHandle>,
    pub(crate) cluster_bitmap: Option<AttributeHandle>,
    pub(crate) upcase: Option<UpcaseTable>,
    pub(crate) volume_info: Option<VolumeInfo>,
    pub(crate) attrdef: Option<Vec<u8>>,
    pub(crate) security: Option<AttributeHandle>,
}

// The device box is opaque and the slot contents are large; show the facts
// a failure message needs.
impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("label", &self.label())
            .field("serial", &format_args!("{:#018x}", self.serial()))
            .field("read_only", &self.read_only)
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

impl Volume {
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn serial(&self) -> u64 {
        self.geometry.volume_serial
    }

    pub fn label(&self) -> &str {
        self.volume_info
            .as_ref()
            .map(|info| info.label.as_str())
            .unwrap_or("")
    }

    pub fn upcase(&self) -> Option<&UpcaseTable> {
        self.upcase.as_ref()
    }

    pub fn attrdef(&self) -> Option<&[u8]> {
        self.attrdef.as_deref()
    }

    pub fn has_security_store(&self) -> bool {
        self.security.is_some()
    }

    /// Tear the volume down and hand the device back to the caller.
    pub fn into_device(mut self) -> Result<Box<dyn BlockDevice>, LodestoneError> {
        crate::ntfs::teardown::teardown(&mut self)?;
        Ok(self.device)
    }

    fn mft_data_handle(&self) -> Result<&AttributeHandle, LodestoneError> {
        self.mft_data
            .as_ref()
            .ok_or_else(|| LodestoneError::InvalidInput("volume is torn down".to_string()))
    }

    /// Count free clusters and free MFT record slots from the two bitmaps.
    pub fn free_space(&mut self) -> Result<FreeSpace, LodestoneError> {
        let geometry = self.geometry;
        let cluster_bitmap = self
            .cluster_bitmap
            .clone()
            .ok_or_else(|| LodestoneError::InvalidInput("volume is torn down".to_string()))?;
        let bits = read_stream_all(self.device.as_mut(), &geometry, &cluster_bitmap)?;
        let free_clusters = count_free_bits(&bits, geometry.total_clusters);

        let record_slots = geometry.records_in(self.mft_data_handle()?.data_size);
        let mft_bitmap = self
            .mft_bitmap
            .clone()
            .ok_or_else(|| LodestoneError::InvalidInput("volume is torn down".to_string()))?;
        let record_bits = read_stream_all(self.device.as_mut(), &geometry, &mft_bitmap)?;
        let free_mft_records = count_free_bits(&record_bits, record_slots);

        let space = FreeSpace {
            total_bytes: geometry.total_clusters * geometry.cluster_size,
            free_bytes: free_clusters * geometry.cluster_size,
            total_clusters: geometry.total_clusters,
            free_clusters,
            free_mft_records,
        };
        debug!(
            "free space: {} of {} clusters, {} record slots",
            space.free_clusters, space.total_clusters, space.free_mft_records
        );
        Ok(space)
    }

    /// Write a system record back to the table and, when the record falls
    /// inside the mirrored range, to the mirror as well. The two copies must
    /// never be allowed to diverge.
    fn write_system_record(&mut self, record: &MftRecord) -> Result<(), LodestoneError> {
        let geometry = self.geometry;
        let mft_data = self.mft_data_handle()?.clone();
        write_record(self.device.as_mut(), &geometry, &mft_data, record)?;

        if let Some(mirror) = &self.mirror {
            let byte = record.number * geometry.mft_record_size;
            if byte + geometry.mft_record_size <= mirror.data_size && mirror.resident.is_none() {
                let vcn = byte / geometry.cluster_size;
                let within = byte % geometry.cluster_size;
                let lcn = mirror.runlist.map_vcn(vcn)?.ok_or_else(|| {
                    LodestoneError::Corruption(
                        "mirror stream is sparse over a system record".to_string(),
                    )
                })?;
                write_fixed(
                    self.device.as_mut(),
                    geometry.cluster_offset(lcn) + within,
                    &record.data,
                    geometry.sector_size,
                )?;
            }
        }
        self.device.sync()
    }

    /// Change the volume label in $Volume (both copies).
    pub fn rename_label(&mut self, new_label: &str) -> Result<(), LodestoneError> {
        if self.read_only {
            return Err(LodestoneError::ReadOnly(
                "cannot rename the label of a read-only volume".to_string(),
            ));
        }
        let units: Vec<u16> = new_label.encode_utf16().collect();
        if units.len() > MAX_LABEL_UNITS {
            return Err(LodestoneError::InvalidInput(format!(
                "label of {} UTF-16 units exceeds the maximum of {}",
                units.len(),
                MAX_LABEL_UNITS
            )));
        }
        let value: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();

        let mut record = match &self.volume_info {
            Some(info) => info.record.clone(),
            None => {
                return Err(LodestoneError::InvalidInput("volume is torn down".to_string()))
            }
        };
        record.replace_resident_value(ATTR_TYPE_VOLUME_NAME, &value)?;
        self.write_system_record(&record)?;

        if let Some(info) = self.volume_info.as_mut() {
            info.record = record;
            info.label = new_label.to_string();
            info.label_needs_rewrite = false;
        }
        info!("volume label renamed to '{}'", new_label);
        Ok(())
    }

    /// Rewrite the stored label in its normalized (even-length) form. Called
    /// once at mount time on writable volumes whose name value had a stray
    /// trailing byte.
    pub(crate) fn normalize_label(&mut self) -> Result<(), LodestoneError> {
        let needs = self
            .volume_info
            .as_ref()
            .map(|info| info.label_needs_rewrite)
            .unwrap_or(false);
        if !needs || self.read_only {
            return Ok(());
        }
        let label = self.label().to_string();
        debug!("rewriting odd-length volume name in normalized form");
        self.rename_label(&label)
    }

    /// Clear the dirty bit in the volume information flags (both copies).
    pub(crate) fn clear_dirty_flag(&mut self) -> Result<(), LodestoneError> {
        let mut record = match &self.volume_info {
            Some(info) => info.record.clone(),
            None => {
                return Err(LodestoneError::InvalidInput("volume is torn down".to_string()))
            }
        };
        let attr = record
            .find_attribute(ATTR_TYPE_VOLUME_INFORMATION, None)?
            .ok_or_else(|| {
                LodestoneError::Corruption(
                    "$Volume lacks a volume information attribute".to_string(),
                )
            })?;
        let mut value = record.resident_value(&attr)?.to_vec();
        if value.len() < 12 {
            return Err(LodestoneError::Corruption(
                "volume information value is too short".to_string(),
            ));
        }
        let flags = LittleEndian::read_u16(&value[10..12]) & !VOLUME_IS_DIRTY;
        LittleEndian::write_u16(&mut value[10..12], flags);
        record.replace_resident_value(ATTR_TYPE_VOLUME_INFORMATION, &value)?;
        self.write_system_record(&record)?;

        if let Some(info) = self.volume_info.as_mut() {
            info.record = record;
            info.flags = flags;
        }
        info!("volume dirty flag cleared");
        Ok(())
    }
}
