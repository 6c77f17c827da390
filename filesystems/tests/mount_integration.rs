// End-to-end mount behavior against synthetic volumes

use std::io::Write;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use lodestone_core::{BlockDevice, FileBlockDevice, LodestoneError, MemoryBlockDevice};
use lodestone_filesystems::ntfs::test_image::{
    build_default_image, build_image, ImageOptions, LogfileState,
};
use lodestone_filesystems::{mount, unmount, MountFailureKind, MountPolicy};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn mount_bytes(
    bytes: Vec<u8>,
    policy: &MountPolicy,
) -> Result<lodestone_filesystems::Volume, lodestone_filesystems::MountError> {
    mount(Box::new(MemoryBlockDevice::new(bytes)), policy)
}

#[test]
fn healthy_volume_mounts_with_label_and_free_space() {
    init_logging();
    let image = build_default_image();
    let expected_free = image.expected_free_clusters;
    let expected_records = image.expected_free_records;
    let cluster_size = image.cluster_size;

    let mut volume = mount_bytes(image.bytes, &MountPolicy::default()).unwrap();
    assert_eq!(volume.label(), "TestVolume");
    assert!(!volume.is_read_only());

    let space = volume.free_space().unwrap();
    assert_eq!(space.free_clusters, expected_free);
    assert_eq!(space.free_bytes, expected_free * cluster_size);
    assert_eq!(space.free_mft_records, expected_records);

    unmount(volume, false).unwrap();
}

#[test]
fn diverged_mirror_is_corrupt() {
    init_logging();
    let image = build_default_image();
    let mut bytes = image.bytes;
    // A payload byte of record 2's mirror copy, clear of the fixup positions
    bytes[(image.mirror_offset + 2 * image.record_size) as usize + 100] ^= 0xFF;
    let err = mount_bytes(bytes, &MountPolicy::default()).unwrap_err();
    assert_eq!(err.kind, MountFailureKind::Corrupt);
}

/// Records every byte range read, so a test can prove a region was never
/// touched.
struct RecordingDevice {
    inner: MemoryBlockDevice,
    reads: Arc<Mutex<Vec<Range<u64>>>>,
}

impl BlockDevice for RecordingDevice {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, LodestoneError> {
        self.reads.lock().unwrap().push(offset..offset + len as u64);
        self.inner.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), LodestoneError> {
        self.inner.write_at(offset, data)
    }

    fn sync(&mut self) -> Result<(), LodestoneError> {
        self.inner.sync()
    }
}

#[test]
fn bad_mirror_runlist_fails_without_reading_mirror_data() {
    init_logging();
    let image = build_image(&ImageOptions {
        mirror_run_lcn: Some(17),
        ..ImageOptions::default()
    });
    let mirror_region = image.mirror_offset..image.mirror_offset + 4 * image.record_size;
    let claimed_region = 17 * image.cluster_size..18 * image.cluster_size;

    let reads = Arc::new(Mutex::new(Vec::new()));
    let device = RecordingDevice {
        inner: MemoryBlockDevice::new(image.bytes),
        reads: Arc::clone(&reads),
    };
    let err = mount(Box::new(device), &MountPolicy::default()).unwrap_err();
    assert_eq!(err.kind, MountFailureKind::Corrupt);

    // The runlist check must reject the mirror before any of its content,
    // at either the real or the claimed location, is read
    let reads = reads.lock().unwrap();
    for range in reads.iter() {
        assert!(
            range.end <= mirror_region.start || range.start >= mirror_region.end,
            "mirror data at {:?} was read",
            range
        );
        assert!(
            range.end <= claimed_region.start || range.start >= claimed_region.end,
            "claimed mirror cluster at {:?} was read",
            range
        );
    }
}

#[test]
fn dirty_journal_policy_matrix() {
    init_logging();
    let build = |state: LogfileState| {
        build_image(&ImageOptions {
            logfile: state,
            ..ImageOptions::default()
        })
    };

    // Refused writable by default
    let err = mount_bytes(build(LogfileState::DirtyRestart).bytes, &MountPolicy::default())
        .unwrap_err();
    assert_eq!(err.kind, MountFailureKind::UncleanUnmount);

    // Allowed read-only when requested outright
    let volume = mount_bytes(
        build(LogfileState::DirtyRestart).bytes,
        &MountPolicy {
            read_only: true,
            ..MountPolicy::default()
        },
    )
    .unwrap();
    assert!(volume.is_read_only());
    unmount(volume, false).unwrap();

    // A writable request with the fallback flag is downgraded, not refused
    let volume = mount_bytes(
        build(LogfileState::DirtyRestart).bytes,
        &MountPolicy {
            fallback_read_only: true,
            ..MountPolicy::default()
        },
    )
    .unwrap();
    assert!(volume.is_read_only());
    unmount(volume, false).unwrap();

    // Recovered writable when the policy allows it
    let volume = mount_bytes(
        build(LogfileState::DirtyRestart).bytes,
        &MountPolicy {
            recover_journal: true,
            ..MountPolicy::default()
        },
    )
    .unwrap();
    assert!(!volume.is_read_only());
    unmount(volume, false).unwrap();
}

#[test]
fn recovery_persists_across_a_remount() {
    init_logging();
    let image = build_image(&ImageOptions {
        logfile: LogfileState::DirtyRestart,
        volume_dirty: true,
        ..ImageOptions::default()
    });
    let device = MemoryBlockDevice::new(image.bytes);
    let volume = mount(
        Box::new(device),
        &MountPolicy {
            recover_journal: true,
            ..MountPolicy::default()
        },
    )
    .unwrap();
    let bytes = bytes_of(volume);

    // After recovery the volume mounts writable under the strict default
    // policy: the journal is wiped and the dirty bit is clear
    let volume = mount_bytes(bytes, &MountPolicy::default()).unwrap();
    assert!(!volume.is_read_only());
    unmount(volume, false).unwrap();
}

#[test]
fn cached_metadata_restart_page_is_always_hibernated() {
    init_logging();
    let image = build_image(&ImageOptions {
        logfile: LogfileState::CachedMetadata,
        ..ImageOptions::default()
    });
    for policy in [
        MountPolicy::default(),
        MountPolicy {
            recover_journal: true,
            ignore_hibernation: true,
            ..MountPolicy::default()
        },
    ] {
        let err = mount_bytes(image.bytes.clone(), &policy).unwrap_err();
        assert_eq!(err.kind, MountFailureKind::Hibernated);
    }
}

#[test]
fn rename_label_survives_a_remount_and_keeps_the_mirror_consistent() {
    init_logging();
    let image = build_default_image();
    let mut volume = mount_bytes(image.bytes, &MountPolicy::default()).unwrap();
    volume.rename_label("Archive").unwrap();
    assert_eq!(volume.label(), "Archive");
    let bytes = bytes_of(volume);

    // A remount re-runs mirror cross-validation, so a table-only write
    // would fail here
    let volume = mount_bytes(bytes, &MountPolicy::default()).unwrap();
    assert_eq!(volume.label(), "Archive");
    unmount(volume, false).unwrap();
}

#[test]
fn rename_label_is_refused_on_a_read_only_mount() {
    init_logging();
    let image = build_default_image();
    let mut volume = mount_bytes(
        image.bytes,
        &MountPolicy {
            read_only: true,
            ..MountPolicy::default()
        },
    )
    .unwrap();
    let err = volume.rename_label("Nope").unwrap_err();
    assert!(matches!(err, LodestoneError::ReadOnly(_)));
    assert_eq!(volume.label(), "TestVolume");
}

#[test]
fn overlong_label_is_rejected() {
    init_logging();
    let image = build_default_image();
    let mut volume = mount_bytes(image.bytes, &MountPolicy::default()).unwrap();
    let too_long = "x".repeat(33);
    assert!(matches!(
        volume.rename_label(&too_long),
        Err(LodestoneError::InvalidInput(_))
    ));
}

#[test]
fn odd_length_label_is_normalized_on_a_writable_mount() {
    init_logging();
    let image = build_image(&ImageOptions {
        odd_label_byte: true,
        ..ImageOptions::default()
    });
    let volume = mount_bytes(image.bytes, &MountPolicy::default()).unwrap();
    assert_eq!(volume.label(), "TestVolume");
    let bytes = bytes_of(volume);

    // The rewrite must have hit both copies, or this remount would trip
    // over the mirror
    let volume = mount_bytes(bytes, &MountPolicy::default()).unwrap();
    assert_eq!(volume.label(), "TestVolume");
    unmount(volume, false).unwrap();
}

#[test]
fn corrupted_case_table_refuses_the_mount() {
    init_logging();
    let image = build_default_image();
    let mut bytes = image.bytes;
    // 'A' no longer maps to itself
    let at = image.upcase_offset as usize + 0x41 * 2;
    bytes[at] = 0x00;
    bytes[at + 1] = 0x30;
    let err = mount_bytes(bytes, &MountPolicy::default()).unwrap_err();
    assert_eq!(err.kind, MountFailureKind::Corrupt);
}

#[test]
fn oversized_attrdef_is_corrupt_not_an_io_failure() {
    init_logging();
    let image = build_image(&ImageOptions {
        attrdef_declared_size: Some(0x0100_0001),
        ..ImageOptions::default()
    });
    let err = mount_bytes(image.bytes, &MountPolicy::default()).unwrap_err();
    assert_eq!(err.kind, MountFailureKind::Corrupt);
}

#[test]
fn unmodified_mount_round_trip_preserves_every_byte() {
    init_logging();
    let image = build_default_image();
    let original = image.bytes.clone();
    let mut volume = mount_bytes(image.bytes, &MountPolicy::default()).unwrap();
    volume.free_space().unwrap();
    let bytes = bytes_of(volume);
    assert_eq!(bytes, original);
}

#[test]
fn torn_record_write_is_corruption() {
    init_logging();
    let image = build_default_image();
    let mut bytes = image.bytes;
    // Clobber the protected tail of record 0's first sector in both copies,
    // simulating a write that only half landed
    for base in [image.mft_offset, image.mirror_offset] {
        bytes[base as usize + 510] ^= 0xFF;
    }
    let err = mount_bytes(bytes, &MountPolicy::default()).unwrap_err();
    assert_eq!(err.kind, MountFailureKind::Corrupt);
}

#[test]
fn truncated_device_is_not_a_filesystem() {
    init_logging();
    let image = build_default_image();
    let mut bytes = image.bytes;
    bytes.truncate(1 << 20);
    let err = mount_bytes(bytes, &MountPolicy::default()).unwrap_err();
    assert_eq!(err.kind, MountFailureKind::NotFilesystem);
}

#[test]
fn mounts_from_a_file_backed_device() {
    init_logging();
    let image = build_default_image();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image.bytes).unwrap();
    file.flush().unwrap();

    let device = FileBlockDevice::open_read_write(file.path()).unwrap();
    let mut volume = mount(Box::new(device), &MountPolicy::default()).unwrap();
    volume.rename_label("OnDisk").unwrap();
    unmount(volume, false).unwrap();

    let device = FileBlockDevice::open_read_only(file.path()).unwrap();
    let volume = mount(
        Box::new(device),
        &MountPolicy {
            read_only: true,
            ..MountPolicy::default()
        },
    )
    .unwrap();
    assert_eq!(volume.label(), "OnDisk");
    unmount(volume, false).unwrap();
}

/// Unmount a memory-backed volume and recover the underlying image bytes.
fn bytes_of(volume: lodestone_filesystems::Volume) -> Vec<u8> {
    let mut device = volume.into_device().unwrap();
    let size = device.size();
    device.read_at(0, size as usize).unwrap()
}
