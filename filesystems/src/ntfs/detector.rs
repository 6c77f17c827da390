// NTFS detection from the boot sector alone

use crate::detection::FilesystemDetector;

pub struct NtfsDetector;

impl FilesystemDetector for NtfsDetector {
    fn detect(boot_sector: &[u8], _ext_superblock: Option<&[u8]>) -> Option<String> {
        if boot_sector.len() < 512 {
            return None;
        }
        if &boot_sector[3..11] == b"NTFS    " && boot_sector[510..512] == [0x55, 0xAA] {
            Some("ntfs".to_string())
        } else {
            None
        }
    }
}
