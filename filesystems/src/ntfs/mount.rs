// Mount orchestration: boot sector, MFT bootstrap, mirror validation, the
// table-dependent structures, and the safety gate, in that order. Failures
// carry a closed taxonomy kind so callers can present actionable guidance
// without matching on message strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lodestone_core::{BlockDevice, LodestoneError};
use log::{info, warn};

use crate::ntfs::boot_sector::Geometry;
use crate::ntfs::bootstrap::{bootstrap_mft, open_mirror};
use crate::ntfs::safety::{
    inspect_journal, reset_journal, HibernationInspector, HibernationState, JournalState,
    NoHibernationImage,
};
use crate::ntfs::teardown::teardown;
use crate::ntfs::validation::{
    cross_validate_mirror, load_attrdef, load_cluster_bitmap, load_security, load_upcase,
    load_volume_info,
};
use crate::ntfs::volume::Volume;

/// Why a mount was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountFailureKind {
    /// The device does not hold an NTFS filesystem
    NotFilesystem,
    /// The filesystem is damaged beyond what a mount can tolerate
    Corrupt,
    /// A hibernation image (or hibernation-cached metadata) owns the volume
    Hibernated,
    /// The volume was not unmounted properly and still has journal work
    UncleanUnmount,
    /// Another process holds the device
    Locked,
    /// The device vanished or cannot be reached
    DeviceUnavailable,
    /// The caller lacks the privileges to open the device
    PermissionDenied,
    Unknown,
}

impl MountFailureKind {
    /// A short, actionable hint for whoever sees the failure.
    pub fn guidance(&self) -> &'static str {
        match self {
            MountFailureKind::NotFilesystem => "the device does not contain an NTFS volume",
            MountFailureKind::Corrupt => "repair the volume with chkdsk /f before mounting",
            MountFailureKind::Hibernated => {
                "shut the hibernated OS down fully, or mount read-only for inspection"
            }
            MountFailureKind::UncleanUnmount => {
                "unmount the volume cleanly in its native OS, or allow journal recovery"
            }
            MountFailureKind::Locked => "close the application holding the device and retry",
            MountFailureKind::DeviceUnavailable => "check that the device is attached and readable",
            MountFailureKind::PermissionDenied => "rerun with sufficient privileges",
            MountFailureKind::Unknown => "see the error detail",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct MountError {
    pub kind: MountFailureKind,
    pub message: String,
}

impl MountError {
    fn new(kind: MountFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The stage a failure happened in. Corruption means different things at
/// different stages: an unreadable boot sector is "not NTFS", everything
/// after that is real damage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountPhase {
    BootSector,
    MftBootstrap,
    MirrorValidation,
    StructureLoading,
    SafetyGate,
}

fn classify(phase: MountPhase, err: LodestoneError) -> MountError {
    let kind = match &err {
        LodestoneError::DeviceNotFound(_) => MountFailureKind::DeviceUnavailable,
        LodestoneError::DeviceLocked(_) => MountFailureKind::Locked,
        LodestoneError::InsufficientPrivileges(_) => MountFailureKind::PermissionDenied,
        LodestoneError::IoError(io) => match io.kind() {
            std::io::ErrorKind::PermissionDenied => MountFailureKind::PermissionDenied,
            std::io::ErrorKind::NotFound => MountFailureKind::DeviceUnavailable,
            _ => MountFailureKind::DeviceUnavailable,
        },
        LodestoneError::InvalidInput(_) | LodestoneError::Corruption(_) => match phase {
            MountPhase::BootSector => MountFailureKind::NotFilesystem,
            MountPhase::MftBootstrap
            | MountPhase::MirrorValidation
            | MountPhase::StructureLoading
            | MountPhase::SafetyGate => MountFailureKind::Corrupt,
        },
        _ => MountFailureKind::Unknown,
    };
    MountError::new(kind, err.to_string())
}

/// What a mount is allowed to do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountPolicy {
    pub read_only: bool,
    /// Accept a read-only mount instead of a refusal when a hibernation
    /// image or dirty journal blocks a writable one
    pub fallback_read_only: bool,
    /// Skip the safety gate entirely and mount in the requested mode,
    /// whatever state the journal or hibernation image is in
    pub forensic: bool,
    /// Skip the hibernation-image inspection
    pub ignore_hibernation: bool,
    /// On a writable mount, reset a dirty journal and clear the volume
    /// dirty bit instead of refusing
    pub recover_journal: bool,
}

/// Mount with the default (no hibernation image) inspector.
pub fn mount(device: Box<dyn BlockDevice>, policy: &MountPolicy) -> Result<Volume, MountError> {
    mount_with_inspector(device, policy, &mut NoHibernationImage)
}

pub fn mount_with_inspector(
    mut device: Box<dyn BlockDevice>,
    policy: &MountPolicy,
    inspector: &mut dyn HibernationInspector,
) -> Result<Volume, MountError> {
    // ===== BOOT SECTOR =====
    let boot = device
        .read_at(0, 512)
        .map_err(|e| classify(MountPhase::BootSector, e))?;
    let geometry = Geometry::parse(&boot).map_err(|e| classify(MountPhase::BootSector, e))?;
    // An absurd sector count can overflow the byte total; saturate so the
    // size comparison below refuses it
    let claimed = geometry
        .total_sectors
        .checked_mul(geometry.sector_size as u64)
        .unwrap_or(u64::MAX);
    let actual = device.size();
    if claimed > actual {
        return Err(MountError::new(
            MountFailureKind::NotFilesystem,
            format!("volume claims {} bytes on a {} byte device", claimed, actual),
        ));
    }

    // ===== MFT AND MIRROR =====
    let mft = bootstrap_mft(device.as_mut(), &geometry)
        .map_err(|e| classify(MountPhase::MftBootstrap, e))?;
    let mirror = open_mirror(device.as_mut(), &geometry, &mft.data)
        .map_err(|e| classify(MountPhase::MftBootstrap, e))?;
    cross_validate_mirror(device.as_mut(), &geometry, &mft.data, &mirror)
        .map_err(|e| classify(MountPhase::MirrorValidation, e))?;

    // ===== TABLE-DEPENDENT STRUCTURES =====
    let load = MountPhase::StructureLoading;
    let cluster_bitmap =
        load_cluster_bitmap(device.as_mut(), &geometry, &mft.data).map_err(|e| classify(load, e))?;
    let upcase = load_upcase(device.as_mut(), &geometry, &mft.data).map_err(|e| classify(load, e))?;
    let volume_info =
        load_volume_info(device.as_mut(), &geometry, &mft.data).map_err(|e| classify(load, e))?;
    let attrdef = load_attrdef(device.as_mut(), &geometry, &mft.data).map_err(|e| classify(load, e))?;
    let security = load_security(device.as_mut(), &geometry, &mft.data).map_err(|e| classify(load, e))?;

    // ===== SAFETY GATE =====
    let mut read_only = policy.read_only;
    let mut recover = false;
    if policy.forensic {
        info!("forensic mount: safety gate skipped");
    } else {
        if !policy.ignore_hibernation {
            match inspector
                .hibernation_state(device.as_mut(), &geometry, &mft.data)
                .map_err(|e| classify(MountPhase::SafetyGate, e))?
            {
                HibernationState::Active => {
                    if policy.fallback_read_only {
                        warn!("active hibernation image, falling back to read-only");
                        read_only = true;
                    } else {
                        return Err(MountError::new(
                            MountFailureKind::Hibernated,
                            "the volume holds an active hibernation image".to_string(),
                        ));
                    }
                }
                HibernationState::Cleared | HibernationState::None => {}
            }
        }

        let journal = inspect_journal(device.as_mut(), &geometry, &mft.data)
            .map_err(|e| classify(MountPhase::SafetyGate, e))?;
        if journal == JournalState::CachedMetadata {
            // No policy overrides this: the on-disk metadata is a lie
            return Err(MountError::new(
                MountFailureKind::Hibernated,
                "volume metadata is cached in a hibernation image".to_string(),
            ));
        }
        let unclean = journal == JournalState::Dirty || volume_info.is_dirty();
        if unclean {
            if !read_only && policy.recover_journal {
                reset_journal(device.as_mut(), &geometry, &mft.data)
                    .map_err(|e| classify(MountPhase::SafetyGate, e))?;
                recover = true;
            } else if read_only || policy.fallback_read_only {
                warn!("volume was not unmounted cleanly; continuing read-only");
                read_only = true;
            } else {
                return Err(MountError::new(
                    MountFailureKind::UncleanUnmount,
                    "volume has journal work pending from an unclean unmount".to_string(),
                ));
            }
        }
    }

    let mut volume = Volume {
        device,
        geometry,
        read_only,
        mft_record: Some(mft.record),
        mft_data: Some(mft.data),
        mft_bitmap: Some(mft.bitmap),
        mirror: Some(mirror),
        cluster_bitmap: Some(cluster_bitmap),
        upcase: Some(upcase),
        volume_info: Some(volume_info),
        attrdef: Some(attrdef),
        security,
    };

    // Post-build writable fixups. A failure here unwinds the volume; the
    // original error wins over anything teardown reports.
    let finish = |volume: &mut Volume| -> Result<(), LodestoneError> {
        if recover {
            volume.clear_dirty_flag()?;
        }
        volume.normalize_label()?;
        Ok(())
    };
    if let Err(err) = finish(&mut volume) {
        let first = classify(MountPhase::SafetyGate, err);
        if let Err(td) = teardown(&mut volume) {
            warn!("teardown after failed mount also failed: {}", td);
        }
        return Err(first);
    }

    info!(
        "mounted '{}' ({}, serial {:#018x})",
        volume.label(),
        if volume.is_read_only() { "read-only" } else { "writable" },
        volume.serial()
    );
    Ok(volume)
}

/// Release a mounted volume: flush, then tear the structures down in order.
/// With `force` the teardown error is logged and discarded, for callers that
/// are abandoning the volume regardless.
pub fn unmount(mut volume: Volume, force: bool) -> Result<(), LodestoneError> {
    let label = volume.label().to_string();
    match teardown(&mut volume) {
        Ok(()) => {}
        Err(err) if force => warn!("forced unmount of '{}' despite: {}", label, err),
        Err(err) => return Err(err),
    }
    info!("unmounted '{}'", label);
    Ok(())
}
