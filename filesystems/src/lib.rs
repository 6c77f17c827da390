// Filesystem implementations built on the lodestone-core device layer

pub mod detection;
pub mod ntfs;

pub use detection::{detect_filesystem, FilesystemDetector};
pub use ntfs::{
    mount, mount_with_inspector, unmount, FreeSpace, Geometry, MountError, MountFailureKind,
    MountPolicy, NtfsDetector, Volume,
};
