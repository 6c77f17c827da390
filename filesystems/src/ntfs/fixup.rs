// Multi-sector transfer fixups
// Every metadata record larger than a sector ends each sector with the update
// sequence number; the bytes it displaced live in the update sequence array.
// A mismatch on read means the record was torn mid-write.

use byteorder::{ByteOrder, LittleEndian};
use lodestone_core::{BlockDevice, LodestoneError};

/// Validate and undo the fixups of a single record in place.
///
/// Records with no update sequence array (zeroed, never-initialized slots)
/// are left untouched.
pub fn apply_fixups(record: &mut [u8], sector_size: usize) -> Result<(), LodestoneError> {
    if record.len() < 8 {
        return Err(LodestoneError::Corruption(
            "record too small for an update sequence header".to_string(),
        ));
    }
    let usa_offset = LittleEndian::read_u16(&record[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&record[6..8]) as usize;
    if usa_count == 0 || usa_offset == 0 {
        // Unused slot, nothing protected
        return Ok(());
    }

    // usa_count includes the USN itself plus one entry per sector
    let sectors = usa_count - 1;
    if sectors == 0 || sectors * sector_size != record.len() {
        return Err(LodestoneError::Corruption(format!(
            "update sequence covers {} sectors but record is {} bytes",
            sectors,
            record.len()
        )));
    }
    let usa_end = usa_offset + usa_count * 2;
    if usa_offset < 8 || usa_end > sector_size || usa_end > record.len() {
        return Err(LodestoneError::Corruption(format!(
            "update sequence array out of bounds: offset {}, count {}",
            usa_offset, usa_count
        )));
    }

    let usn = LittleEndian::read_u16(&record[usa_offset..usa_offset + 2]);
    for sector in 0..sectors {
        let end = (sector + 1) * sector_size - 2;
        let tag = LittleEndian::read_u16(&record[end..end + 2]);
        if tag != usn {
            return Err(LodestoneError::Corruption(format!(
                "torn write: sector {} tag {:#06x} does not match USN {:#06x}",
                sector, tag, usn
            )));
        }
        let saved_at = usa_offset + 2 + sector * 2;
        let original = LittleEndian::read_u16(&record[saved_at..saved_at + 2]);
        LittleEndian::write_u16(&mut record[end..end + 2], original);
    }
    Ok(())
}

/// Re-apply fixups before writing a record back, bumping the USN.
pub fn insert_fixups(record: &mut [u8], sector_size: usize) -> Result<(), LodestoneError> {
    if record.len() < 8 {
        return Err(LodestoneError::Corruption(
            "record too small for an update sequence header".to_string(),
        ));
    }
    let usa_offset = LittleEndian::read_u16(&record[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&record[6..8]) as usize;
    if usa_count < 2 || usa_offset == 0 {
        return Err(LodestoneError::Corruption(
            "record has no update sequence array to re-apply".to_string(),
        ));
    }
    let sectors = usa_count - 1;
    if sectors * sector_size != record.len() || usa_offset + usa_count * 2 > sector_size {
        return Err(LodestoneError::Corruption(
            "update sequence array does not match record size".to_string(),
        ));
    }

    let mut usn = LittleEndian::read_u16(&record[usa_offset..usa_offset + 2]).wrapping_add(1);
    if usn == 0 || usn == 0xFFFF {
        usn = 1;
    }
    LittleEndian::write_u16(&mut record[usa_offset..usa_offset + 2], usn);
    for sector in 0..sectors {
        let end = (sector + 1) * sector_size - 2;
        let original = LittleEndian::read_u16(&record[end..end + 2]);
        let saved_at = usa_offset + 2 + sector * 2;
        LittleEndian::write_u16(&mut record[saved_at..saved_at + 2], original);
        LittleEndian::write_u16(&mut record[end..end + 2], usn);
    }
    Ok(())
}

/// Read `count` fixup-protected records of `record_size` bytes starting at a
/// device byte offset, validating and undoing the fixups of each.
pub fn read_fixed(
    device: &mut dyn BlockDevice,
    offset: u64,
    count: u64,
    record_size: u64,
    sector_size: u32,
) -> Result<Vec<u8>, LodestoneError> {
    let total = count
        .checked_mul(record_size)
        .ok_or_else(|| LodestoneError::InvalidInput("record read overflow".to_string()))?;
    let mut buffer = device.read_at(offset, total as usize)?;
    for chunk in buffer.chunks_mut(record_size as usize) {
        apply_fixups(chunk, sector_size as usize)?;
    }
    Ok(buffer)
}

/// Write a single record back with fresh fixups.
pub fn write_fixed(
    device: &mut dyn BlockDevice,
    offset: u64,
    record: &[u8],
    sector_size: u32,
) -> Result<(), LodestoneError> {
    let mut protected = record.to_vec();
    insert_fixups(&mut protected, sector_size as usize)?;
    device.write_at(offset, &protected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protected_record(sector_size: usize, sectors: usize) -> Vec<u8> {
        let mut record = vec![0u8; sector_size * sectors];
        record[0..4].copy_from_slice(b"FILE");
        LittleEndian::write_u16(&mut record[4..6], 48);
        LittleEndian::write_u16(&mut record[6..8], (sectors + 1) as u16);
        // Payload bytes at the protected positions
        for s in 0..sectors {
            let end = (s + 1) * sector_size - 2;
            record[end] = 0xAB;
            record[end + 1] = 0xCD;
        }
        insert_fixups(&mut record, sector_size).unwrap();
        record
    }

    #[test]
    fn round_trip_restores_protected_bytes() {
        let mut record = protected_record(512, 2);
        apply_fixups(&mut record, 512).unwrap();
        for s in 0..2 {
            let end = (s + 1) * 512 - 2;
            assert_eq!(record[end], 0xAB);
            assert_eq!(record[end + 1], 0xCD);
        }
    }

    #[test]
    fn torn_write_is_detected() {
        let mut record = protected_record(512, 2);
        // Second sector carries a stale tag
        let end = 2 * 512 - 2;
        record[end] ^= 0xFF;
        let err = apply_fixups(&mut record, 512).unwrap_err();
        assert!(err.to_string().contains("torn write"));
    }

    #[test]
    fn zeroed_slot_passes_untouched() {
        let mut record = vec![0u8; 1024];
        apply_fixups(&mut record, 512).unwrap();
        assert!(record.iter().all(|&b| b == 0));
    }

    #[test]
    fn bad_usa_bounds_are_corruption() {
        let mut record = vec![0u8; 1024];
        record[0..4].copy_from_slice(b"FILE");
        LittleEndian::write_u16(&mut record[4..6], 600); // past first sector
        LittleEndian::write_u16(&mut record[6..8], 3);
        assert!(apply_fixups(&mut record, 512).is_err());
    }

    #[test]
    fn usn_skips_reserved_values() {
        let mut record = protected_record(512, 2);
        apply_fixups(&mut record, 512).unwrap();
        LittleEndian::write_u16(&mut record[48..50], 0xFFFE);
        insert_fixups(&mut record, 512).unwrap();
        let usn = LittleEndian::read_u16(&record[48..50]);
        assert_eq!(usn, 1); // 0xFFFF is reserved
    }
}
