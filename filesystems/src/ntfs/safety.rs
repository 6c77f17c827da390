// The pre-mount safety gate: journal state and hibernation images.
//
// A volume whose journal has live clients, or whose metadata is cached in a
// hibernation image, cannot be written without destroying data the resuming
// OS still believes in. This module inspects both signals; the mount
// orchestrator decides what the policy allows.

use byteorder::{ByteOrder, LittleEndian};
use lodestone_core::{BlockDevice, LodestoneError};
use log::{debug, info, warn};

use crate::ntfs::boot_sector::Geometry;
use crate::ntfs::mft::{open_inode, read_stream, AttributeHandle};
use crate::ntfs::structures::*;

// ===== JOURNAL =====

/// What the $LogFile restart page says about the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    /// No pending transactions
    Clean,
    /// Live clients: the volume was not unmounted properly
    Dirty,
    /// Restart page version 2+: volume metadata is cached in a hibernation
    /// or fast-startup image, and nothing on disk can be trusted
    CachedMetadata,
}

/// Read the first restart page of $LogFile and classify the journal.
pub fn inspect_journal(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
) -> Result<JournalState, LodestoneError> {
    let inode = open_inode(device, geometry, mft_data, MFT_RECORD_LOGFILE)?;
    let handle = AttributeHandle::open(&inode.record, ATTR_TYPE_DATA, None)?;
    if handle.data_size < 64 {
        debug!("$LogFile of {} bytes, treating as clean", handle.data_size);
        return Ok(JournalState::Clean);
    }

    let page_len = (geometry.sector_size as u64 * 8).min(handle.data_size) as usize;
    let page = read_stream(device, geometry, &handle, 0, page_len)?;
    let magic = &page[0..4];
    if magic.iter().all(|&b| b == 0x00) || magic.iter().all(|&b| b == 0xFF) {
        // Never initialized, or wiped by a previous journal reset
        return Ok(JournalState::Clean);
    }
    if magic != MAGIC_RSTR && magic != MAGIC_CHKD {
        return Err(LodestoneError::Corruption(format!(
            "$LogFile restart page has unknown magic {:?}",
            magic
        )));
    }

    let major_version = LittleEndian::read_u16(&page[28..30]);
    if major_version >= 2 {
        warn!("$LogFile restart page v{}: metadata lives in a hibernation image", major_version);
        return Ok(JournalState::CachedMetadata);
    }

    let area = LittleEndian::read_u16(&page[24..26]) as usize;
    if area < 30 || area + 16 > page.len() {
        return Err(LodestoneError::Corruption(format!(
            "$LogFile restart area offset {} out of bounds",
            area
        )));
    }
    let client_in_use = LittleEndian::read_u16(&page[area + 12..area + 14]);
    let flags = LittleEndian::read_u16(&page[area + 14..area + 16]);
    if client_in_use == LOGFILE_NO_CLIENT || flags & RESTART_VOLUME_IS_CLEAN != 0 {
        Ok(JournalState::Clean)
    } else {
        debug!(
            "$LogFile has live clients (in-use list {:#06x}, flags {:#06x})",
            client_in_use, flags
        );
        Ok(JournalState::Dirty)
    }
}

/// Wipe the journal so that no stale transaction can ever replay: every
/// cluster of $LogFile is filled with 0xFF, which no restart page parser
/// accepts.
pub fn reset_journal(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    mft_data: &AttributeHandle,
) -> Result<(), LodestoneError> {
    let inode = open_inode(device, geometry, mft_data, MFT_RECORD_LOGFILE)?;
    let handle = AttributeHandle::open(&inode.record, ATTR_TYPE_DATA, None)?;
    if handle.resident.is_some() {
        return Err(LodestoneError::Corruption(
            "$LogFile data stream is resident".to_string(),
        ));
    }
    let fill = vec![0xFFu8; geometry.cluster_size as usize];
    for run in handle.runlist.runs() {
        let lcn = match run.lcn {
            Some(lcn) => lcn,
            None => continue,
        };
        for cluster in 0..run.length {
            device.write_at(geometry.cluster_offset(lcn + cluster), &fill)?;
        }
    }
    device.sync()?;
    info!("journal reset: {} bytes filled", handle.allocated_size);
    Ok(())
}

// ===== HIBERNATION =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HibernationState {
    /// No hibernation image found
    None,
    /// An image with a live signature: the OS intends to resume
    Active,
    /// An image whose signature was cleared on wake
    Cleared,
}

/// Classify a hibernation image by the signature in its first bytes.
pub fn classify_hibernation_signature(header: &[u8]) -> HibernationState {
    if header.len() < 4 {
        return HibernationState::None;
    }
    let signature = &header[0..4];
    if HIBERNATE_ACTIVE_SIGNATURES.iter().any(|s| &s[..] == signature) {
        HibernationState::Active
    } else if HIBERNATE_CLEARED_SIGNATURES.iter().any(|s| &s[..] == signature) {
        HibernationState::Cleared
    } else {
        HibernationState::None
    }
}

/// Source of the hibernation verdict. Finding the image file requires a
/// directory lookup, which callers embedding a full name index can provide;
/// the default source reports no image.
pub trait HibernationInspector {
    fn hibernation_state(
        &mut self,
        device: &mut dyn BlockDevice,
        geometry: &Geometry,
        mft_data: &AttributeHandle,
    ) -> Result<HibernationState, LodestoneError>;
}

/// The default inspector: assumes no hibernation image exists.
pub struct NoHibernationImage;

impl HibernationInspector for NoHibernationImage {
    fn hibernation_state(
        &mut self,
        _device: &mut dyn BlockDevice,
        _geometry: &Geometry,
        _mft_data: &AttributeHandle,
    ) -> Result<HibernationState, LodestoneError> {
        Ok(HibernationState::None)
    }
}
