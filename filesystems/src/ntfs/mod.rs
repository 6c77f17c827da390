// NTFS: mount orchestration and consistency verification
//
// The modules layer bottom-up: raw on-disk structures, the fixup codec and
// data runs, the generic record/attribute machinery, then the bootstrap,
// validation, and safety stages the mount orchestrator drives.

pub mod boot_sector;
pub mod bootstrap;
pub mod data_runs;
pub mod detector;
pub mod fixup;
pub mod mft;
pub mod mount;
pub mod safety;
pub mod structures;
pub mod teardown;
pub mod validation;
pub mod volume;

// Synthetic volume builder, shared with the integration tests
pub mod test_image;

pub use boot_sector::Geometry;
pub use detector::NtfsDetector;
pub use mount::{mount, mount_with_inspector, unmount, MountError, MountFailureKind, MountPolicy};
pub use safety::{HibernationInspector, HibernationState, JournalState, NoHibernationImage};
pub use volume::{FreeSpace, Volume};
