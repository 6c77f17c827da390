// Ordered teardown of a mounted volume.
//
// Structures are released strictly in the reverse of acquisition order, so
// no slot is ever dropped while something acquired after it could still
// refer to it. Missing slots are skipped, which makes teardown safe to run
// on a partially constructed volume and to run twice.

use lodestone_core::LodestoneError;
use log::{debug, trace};

use crate::ntfs::volume::Volume;

pub fn teardown(volume: &mut Volume) -> Result<(), LodestoneError> {
    let mut released = 0u32;
    let mut release = |name: &str, present: bool| {
        if present {
            trace!("released {}", name);
            released += 1;
        }
    };

    release("security store", volume.security.take().is_some());
    release("attribute definitions", volume.attrdef.take().is_some());
    release("volume descriptor", volume.volume_info.take().is_some());
    release("case folding table", volume.upcase.take().is_some());
    release("cluster bitmap", volume.cluster_bitmap.take().is_some());
    release("MFT mirror", volume.mirror.take().is_some());
    release("MFT bitmap", volume.mft_bitmap.take().is_some());
    release("MFT data stream", volume.mft_data.take().is_some());
    release("MFT record", volume.mft_record.take().is_some());
    drop(release);

    debug!("teardown released {} structures", released);
    volume.device.sync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::mount::{mount, MountPolicy};
    use crate::ntfs::test_image::build_default_image;
    use lodestone_core::MemoryBlockDevice;

    #[test]
    fn teardown_is_idempotent() {
        let image = build_default_image();
        let device = MemoryBlockDevice::new(image.bytes);
        let mut volume = mount(Box::new(device), &MountPolicy::default()).unwrap();
        assert!(volume.mft_data.is_some());
        teardown(&mut volume).unwrap();
        assert!(volume.mft_data.is_none());
        assert!(volume.volume_info.is_none());
        // A second pass finds nothing left and still succeeds
        teardown(&mut volume).unwrap();
    }

    #[test]
    fn partially_constructed_volume_tears_down_cleanly() {
        use crate::ntfs::boot_sector::Geometry;
        use crate::ntfs::bootstrap::bootstrap_mft;

        // Only the table bootstrap has happened; everything later is None
        let image = build_default_image();
        let geometry = Geometry::parse(&image.bytes[..512]).unwrap();
        let mut device = MemoryBlockDevice::new(image.bytes);
        let mft = bootstrap_mft(&mut device, &geometry).unwrap();
        let mut volume = Volume {
            device: Box::new(device),
            geometry,
            read_only: false,
            mft_record: Some(mft.record),
            mft_data: Some(mft.data),
            mft_bitmap: Some(mft.bitmap),
            mirror: None,
            cluster_bitmap: None,
            upcase: None,
            volume_info: None,
            attrdef: None,
            security: None,
        };
        teardown(&mut volume).unwrap();
        assert!(volume.mft_record.is_none());
        teardown(&mut volume).unwrap();
    }
}
