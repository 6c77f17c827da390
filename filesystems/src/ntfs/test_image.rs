// Synthetic NTFS volume builder
// Produces small, fully self-consistent volume images for the test suites:
// a boot sector, an MFT with the well-known system records, the mirror copy,
// the allocation bitmap, $UpCase, $LogFile and $AttrDef streams.

use byteorder::{ByteOrder, LittleEndian};

use crate::ntfs::fixup::insert_fixups;
use crate::ntfs::structures::*;

// Fixed layout of the synthetic volume (4 KiB clusters, 1 KiB records)
pub const IMG_SECTOR: u32 = 512;
pub const IMG_SECTORS_PER_CLUSTER: u8 = 8;
pub const IMG_CLUSTER: u64 = 4096;
pub const IMG_RECORD: u64 = 1024;
pub const IMG_TOTAL_CLUSTERS: u64 = 2048;
pub const IMG_MFT_LCN: u64 = 4;
pub const IMG_MFT_CLUSTERS: u64 = 8; // 32 records
pub const IMG_MIRROR_LCN: u64 = 16; // 1 cluster = 4 records
pub const IMG_BITMAP_LCN: u64 = 20;
pub const IMG_UPCASE_LCN: u64 = 24; // 32 clusters
pub const IMG_LOGFILE_LCN: u64 = 60; // 2 clusters
pub const IMG_ATTRDEF_LCN: u64 = 64;

/// State of the $LogFile stream in a built image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogfileState {
    /// Never used: all zeros, treated as clean
    Zeroed,
    /// Restart page v1.1 with no live clients and the clean flag set
    CleanRestart,
    /// Restart page v1.1 with a live client and no clean flag
    DirtyRestart,
    /// Restart page v2.0: metadata cached by a fast-restarting OS
    CachedMetadata,
}

/// Knobs for building deliberately unhealthy volumes.
#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub label: String,
    pub volume_dirty: bool,
    pub logfile: LogfileState,
    /// Override the LCN the $MFTMirr runlist claims (the mirror content is
    /// still written at the real location)
    pub mirror_run_lcn: Option<u64>,
    /// Override the declared $AttrDef stream size
    pub attrdef_declared_size: Option<u64>,
    /// Append a stray byte to the volume name value (invalid UTF-16)
    pub odd_label_byte: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            label: "TestVolume".to_string(),
            volume_dirty: false,
            logfile: LogfileState::Zeroed,
            mirror_run_lcn: None,
            attrdef_declared_size: None,
            odd_label_byte: false,
        }
    }
}

/// A built image plus the offsets tests need for targeted mutation.
pub struct SyntheticImage {
    pub bytes: Vec<u8>,
    pub mft_offset: u64,
    pub mirror_offset: u64,
    pub bitmap_offset: u64,
    pub upcase_offset: u64,
    pub logfile_offset: u64,
    pub record_size: u64,
    pub cluster_size: u64,
    pub expected_free_clusters: u64,
    pub expected_free_records: u64,
}

/// Build a 512-byte NTFS boot sector with the given parameters.
pub fn minimal_boot_sector(
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    total_sectors: u64,
    mft_lcn: u64,
    mirror_lcn: u64,
    clusters_per_mft_record: i8,
) -> Vec<u8> {
    let mut boot = vec![0u8; 512];
    boot[0] = 0xEB;
    boot[1] = 0x52;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"NTFS    ");
    LittleEndian::write_u16(&mut boot[0x0B..0x0D], bytes_per_sector);
    boot[0x0D] = sectors_per_cluster;
    boot[0x15] = 0xF8; // media descriptor
    LittleEndian::write_u64(&mut boot[0x28..0x30], total_sectors);
    LittleEndian::write_u64(&mut boot[0x30..0x38], mft_lcn);
    LittleEndian::write_u64(&mut boot[0x38..0x40], mirror_lcn);
    boot[0x40] = clusters_per_mft_record as u8;
    boot[0x44] = 1; // clusters per index record
    LittleEndian::write_u64(&mut boot[0x48..0x50], 0x0123_4567_89AB_CDEF);
    boot[0x1FE] = 0x55;
    boot[0x1FF] = 0xAA;
    boot
}

/// The identity + ASCII upper-case table as on-disk bytes.
pub fn default_upcase_bytes() -> Vec<u8> {
    let mut table = vec![0u8; UPCASE_MAX_BYTES as usize];
    for code in 0u32..65536 {
        let upper = match code {
            0x61..=0x7A => code - 0x20,
            other => other,
        };
        LittleEndian::write_u16(
            &mut table[(code as usize) * 2..(code as usize) * 2 + 2],
            upper as u16,
        );
    }
    table
}

// ===== RECORD BUILDER =====

pub struct RecordBuilder {
    number: u64,
    size: usize,
    flags: u16,
    attrs: Vec<Vec<u8>>,
}

impl RecordBuilder {
    pub fn new(number: u64, size: usize) -> Self {
        Self {
            number,
            size,
            flags: 0,
            attrs: Vec::new(),
        }
    }

    pub fn in_use(mut self) -> Self {
        self.flags |= MFT_RECORD_IN_USE;
        self
    }

    pub fn directory(mut self) -> Self {
        self.flags |= MFT_RECORD_IN_USE | MFT_RECORD_IS_DIRECTORY;
        self
    }

    pub fn resident(self, attr_type: u32, value: &[u8]) -> Self {
        self.resident_named(attr_type, "", value)
    }

    pub fn resident_named(mut self, attr_type: u32, name: &str, value: &[u8]) -> Self {
        let name_units: Vec<u16> = name.encode_utf16().collect();
        let name_bytes = name_units.len() * 2;
        let value_offset = (ATTR_RESIDENT_HEADER_LEN + name_bytes + 7) & !7;
        let total = (value_offset + value.len() + 7) & !7;
        let mut attr = vec![0u8; total];
        LittleEndian::write_u32(&mut attr[0..4], attr_type);
        LittleEndian::write_u32(&mut attr[4..8], total as u32);
        attr[ATTR_OFF_NAME_LENGTH] = name_units.len() as u8;
        LittleEndian::write_u16(
            &mut attr[ATTR_OFF_NAME_OFFSET..ATTR_OFF_NAME_OFFSET + 2],
            ATTR_RESIDENT_HEADER_LEN as u16,
        );
        LittleEndian::write_u16(
            &mut attr[ATTR_OFF_INSTANCE..ATTR_OFF_INSTANCE + 2],
            self.attrs.len() as u16,
        );
        LittleEndian::write_u32(
            &mut attr[ATTR_OFF_VALUE_LENGTH..ATTR_OFF_VALUE_LENGTH + 4],
            value.len() as u32,
        );
        LittleEndian::write_u16(
            &mut attr[ATTR_OFF_VALUE_OFFSET..ATTR_OFF_VALUE_OFFSET + 2],
            value_offset as u16,
        );
        for (i, unit) in name_units.iter().enumerate() {
            LittleEndian::write_u16(
                &mut attr[ATTR_RESIDENT_HEADER_LEN + i * 2..ATTR_RESIDENT_HEADER_LEN + i * 2 + 2],
                *unit,
            );
        }
        attr[value_offset..value_offset + value.len()].copy_from_slice(value);
        self.attrs.push(attr);
        self
    }

    /// Add a non-resident attribute with the given `(lcn, clusters)` runs
    /// and declared data size.
    pub fn non_resident(
        mut self,
        attr_type: u32,
        runs: &[(u64, u64)],
        data_size: u64,
        cluster_size: u64,
    ) -> Self {
        let pairs = encode_mapping_pairs(runs);
        let mapping_offset = ATTR_NON_RESIDENT_HEADER_LEN;
        let total = (mapping_offset + pairs.len() + 7) & !7;
        let total_clusters: u64 = runs.iter().map(|&(_, len)| len).sum();

        let mut attr = vec![0u8; total];
        LittleEndian::write_u32(&mut attr[0..4], attr_type);
        LittleEndian::write_u32(&mut attr[4..8], total as u32);
        attr[ATTR_OFF_NON_RESIDENT] = 1;
        LittleEndian::write_u16(
            &mut attr[ATTR_OFF_INSTANCE..ATTR_OFF_INSTANCE + 2],
            self.attrs.len() as u16,
        );
        LittleEndian::write_u64(&mut attr[ATTR_OFF_LOWEST_VCN..ATTR_OFF_LOWEST_VCN + 8], 0);
        LittleEndian::write_u64(
            &mut attr[ATTR_OFF_HIGHEST_VCN..ATTR_OFF_HIGHEST_VCN + 8],
            total_clusters.saturating_sub(1),
        );
        LittleEndian::write_u16(
            &mut attr[ATTR_OFF_MAPPING_PAIRS..ATTR_OFF_MAPPING_PAIRS + 2],
            mapping_offset as u16,
        );
        LittleEndian::write_u64(
            &mut attr[ATTR_OFF_ALLOCATED_SIZE..ATTR_OFF_ALLOCATED_SIZE + 8],
            total_clusters * cluster_size,
        );
        LittleEndian::write_u64(&mut attr[ATTR_OFF_DATA_SIZE..ATTR_OFF_DATA_SIZE + 8], data_size);
        LittleEndian::write_u64(
            &mut attr[ATTR_OFF_INITIALIZED_SIZE..ATTR_OFF_INITIALIZED_SIZE + 8],
            data_size,
        );
        attr[mapping_offset..mapping_offset + pairs.len()].copy_from_slice(&pairs);
        self.attrs.push(attr);
        self
    }

    /// Assemble the record without applying fixups (for in-memory parsing
    /// tests).
    pub fn build_unprotected(self) -> Vec<u8> {
        let usa_count = (self.size / IMG_SECTOR as usize + 1) as u16;
        let attrs_offset = 56usize; // header 48 + USA (6 bytes for 2 sectors), aligned
        let mut record = vec![0u8; self.size];
        record[0..4].copy_from_slice(MAGIC_FILE);
        LittleEndian::write_u16(&mut record[4..6], 48); // usa_offset
        LittleEndian::write_u16(&mut record[6..8], usa_count);
        LittleEndian::write_u16(&mut record[16..18], 1); // sequence
        LittleEndian::write_u16(&mut record[18..20], 1); // link count
        LittleEndian::write_u16(&mut record[20..22], attrs_offset as u16);
        LittleEndian::write_u16(&mut record[22..24], self.flags);
        LittleEndian::write_u32(&mut record[28..32], self.size as u32); // allocated
        LittleEndian::write_u16(&mut record[40..42], self.attrs.len() as u16 + 1);
        LittleEndian::write_u32(&mut record[44..48], self.number as u32);

        let mut offset = attrs_offset;
        for attr in &self.attrs {
            record[offset..offset + attr.len()].copy_from_slice(attr);
            offset += attr.len();
        }
        LittleEndian::write_u32(&mut record[offset..offset + 4], ATTR_END);
        LittleEndian::write_u32(&mut record[24..28], (offset + 8) as u32); // bytes used
        record
    }

    /// Assemble the record with the update sequence array applied.
    pub fn build(self) -> Vec<u8> {
        let mut record = self.build_unprotected();
        insert_fixups(&mut record, IMG_SECTOR as usize).expect("record builder produced a bad USA");
        record
    }
}

/// Encode `(lcn, clusters)` runs as NTFS mapping pairs.
pub fn encode_mapping_pairs(runs: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = 0i64;
    for &(lcn, length) in runs {
        let delta = lcn as i64 - prev;
        prev = lcn as i64;
        let len_bytes = unsigned_width(length);
        let delta_bytes = signed_width(delta);
        out.push((len_bytes | (delta_bytes << 4)) as u8);
        out.extend_from_slice(&length.to_le_bytes()[..len_bytes]);
        out.extend_from_slice(&delta.to_le_bytes()[..delta_bytes]);
    }
    out.push(0);
    out
}

fn unsigned_width(value: u64) -> usize {
    let mut width = 1;
    while width < 8 && value >> (width * 8) != 0 {
        width += 1;
    }
    width
}

fn signed_width(value: i64) -> usize {
    for width in 1..8usize {
        let shift = 64 - width * 8;
        if (value << shift) >> shift == value {
            return width;
        }
    }
    8
}

// ===== IMAGE ASSEMBLY =====

pub fn build_default_image() -> SyntheticImage {
    build_image(&ImageOptions::default())
}

pub fn build_image(options: &ImageOptions) -> SyntheticImage {
    let mut bytes = vec![0u8; (IMG_TOTAL_CLUSTERS * IMG_CLUSTER) as usize];

    // Boot sector
    let boot = minimal_boot_sector(
        IMG_SECTOR as u16,
        IMG_SECTORS_PER_CLUSTER,
        IMG_TOTAL_CLUSTERS * IMG_SECTORS_PER_CLUSTER as u64,
        IMG_MFT_LCN,
        IMG_MIRROR_LCN,
        -10,
    );
    bytes[..512].copy_from_slice(&boot);

    // System records
    let mft_offset = IMG_MFT_LCN * IMG_CLUSTER;
    let record = |n: u64| RecordBuilder::new(n, IMG_RECORD as usize);

    let mut label_value: Vec<u8> = options
        .label
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();
    if options.odd_label_byte {
        label_value.push(0x41);
    }

    let mut volume_info = vec![0u8; 12];
    volume_info[8] = 3; // major version
    volume_info[9] = 1; // minor version
    let flags = if options.volume_dirty { VOLUME_IS_DIRTY } else { 0 };
    LittleEndian::write_u16(&mut volume_info[10..12], flags);

    // Bitmap over 16 of the MFT's 32 record slots
    let mut mft_bitmap = vec![0u8; 8];
    mft_bitmap[0] = 0xFF;
    mft_bitmap[1] = 0xFF;

    let records: Vec<Vec<u8>> = vec![
        record(MFT_RECORD_MFT)
            .in_use()
            .non_resident(
                ATTR_TYPE_DATA,
                &[(IMG_MFT_LCN, IMG_MFT_CLUSTERS)],
                IMG_MFT_CLUSTERS * IMG_CLUSTER,
                IMG_CLUSTER,
            )
            .resident(ATTR_TYPE_BITMAP, &mft_bitmap)
            .build(),
        record(MFT_RECORD_MFTMIRR)
            .in_use()
            .non_resident(
                ATTR_TYPE_DATA,
                &[(options.mirror_run_lcn.unwrap_or(IMG_MIRROR_LCN), 1)],
                IMG_CLUSTER,
                IMG_CLUSTER,
            )
            .build(),
        record(MFT_RECORD_LOGFILE)
            .in_use()
            .non_resident(ATTR_TYPE_DATA, &[(IMG_LOGFILE_LCN, 2)], 2 * IMG_CLUSTER, IMG_CLUSTER)
            .build(),
        record(MFT_RECORD_VOLUME)
            .in_use()
            .resident(ATTR_TYPE_VOLUME_NAME, &label_value)
            .resident(ATTR_TYPE_VOLUME_INFORMATION, &volume_info)
            .build(),
        record(MFT_RECORD_ATTRDEF)
            .in_use()
            .non_resident(
                ATTR_TYPE_DATA,
                &[(IMG_ATTRDEF_LCN, 1)],
                options.attrdef_declared_size.unwrap_or(2560),
                IMG_CLUSTER,
            )
            .build(),
        record(MFT_RECORD_ROOT).directory().build(),
        record(MFT_RECORD_BITMAP)
            .in_use()
            .non_resident(
                ATTR_TYPE_DATA,
                &[(IMG_BITMAP_LCN, 1)],
                IMG_TOTAL_CLUSTERS / 8,
                IMG_CLUSTER,
            )
            .build(),
        record(MFT_RECORD_BOOT)
            .in_use()
            .non_resident(ATTR_TYPE_DATA, &[(0, 1)], IMG_CLUSTER, IMG_CLUSTER)
            .build(),
        record(8).in_use().build(), // $BadClus
        record(MFT_RECORD_SECURE)
            .in_use()
            .resident_named(ATTR_TYPE_DATA, "$SDS", &[0u8; 64])
            .build(),
        record(MFT_RECORD_UPCASE)
            .in_use()
            .non_resident(ATTR_TYPE_DATA, &[(IMG_UPCASE_LCN, 32)], UPCASE_MAX_BYTES, IMG_CLUSTER)
            .build(),
        record(11).in_use().build(),
        record(12).in_use().build(),
        record(13).in_use().build(),
        record(14).in_use().build(),
        record(15).in_use().build(),
    ];
    for (i, rec) in records.iter().enumerate() {
        let at = (mft_offset + i as u64 * IMG_RECORD) as usize;
        bytes[at..at + rec.len()].copy_from_slice(rec);
    }

    // Mirror: raw copy of the first four records
    let mirror_offset = IMG_MIRROR_LCN * IMG_CLUSTER;
    let mirror_len = (4 * IMG_RECORD) as usize;
    let mirror_src = mft_offset as usize;
    let mirror: Vec<u8> = bytes[mirror_src..mirror_src + mirror_len].to_vec();
    bytes[mirror_offset as usize..mirror_offset as usize + mirror_len].copy_from_slice(&mirror);

    // Allocation bitmap: mark the clusters this layout occupies
    let bitmap_offset = IMG_BITMAP_LCN * IMG_CLUSTER;
    let mut used = vec![0u64];
    used.extend(IMG_MFT_LCN..IMG_MFT_LCN + IMG_MFT_CLUSTERS);
    used.push(IMG_MIRROR_LCN);
    used.push(IMG_BITMAP_LCN);
    used.extend(IMG_UPCASE_LCN..IMG_UPCASE_LCN + 32);
    used.extend(IMG_LOGFILE_LCN..IMG_LOGFILE_LCN + 2);
    used.push(IMG_ATTRDEF_LCN);
    for &lcn in &used {
        bytes[bitmap_offset as usize + (lcn / 8) as usize] |= 1 << (lcn % 8);
    }
    let expected_free_clusters = IMG_TOTAL_CLUSTERS - used.len() as u64;

    // $UpCase
    let upcase_offset = IMG_UPCASE_LCN * IMG_CLUSTER;
    let upcase = default_upcase_bytes();
    bytes[upcase_offset as usize..upcase_offset as usize + upcase.len()].copy_from_slice(&upcase);

    // $LogFile
    let logfile_offset = IMG_LOGFILE_LCN * IMG_CLUSTER;
    match options.logfile {
        LogfileState::Zeroed => {}
        LogfileState::CleanRestart => {
            write_restart_page(&mut bytes[logfile_offset as usize..], 1, 1, LOGFILE_NO_CLIENT,
                RESTART_VOLUME_IS_CLEAN);
        }
        LogfileState::DirtyRestart => {
            write_restart_page(&mut bytes[logfile_offset as usize..], 1, 1, 0, 0);
        }
        LogfileState::CachedMetadata => {
            write_restart_page(&mut bytes[logfile_offset as usize..], 2, 0, 0, 0);
        }
    }

    SyntheticImage {
        bytes,
        mft_offset,
        mirror_offset,
        bitmap_offset,
        upcase_offset,
        logfile_offset,
        record_size: IMG_RECORD,
        cluster_size: IMG_CLUSTER,
        expected_free_clusters,
        expected_free_records: 16, // 32 slots, 16 marked in use
    }
}

fn write_restart_page(page: &mut [u8], major: u16, minor: u16, in_use_list: u16, flags: u16) {
    page[0..4].copy_from_slice(MAGIC_RSTR);
    LittleEndian::write_u16(&mut page[24..26], 48); // restart area offset
    LittleEndian::write_u16(&mut page[26..28], minor);
    LittleEndian::write_u16(&mut page[28..30], major);
    // Restart area
    LittleEndian::write_u16(&mut page[48 + 8..48 + 10], 1); // log clients
    LittleEndian::write_u16(&mut page[48 + 10..48 + 12], LOGFILE_NO_CLIENT); // free list
    LittleEndian::write_u16(&mut page[48 + 12..48 + 14], in_use_list);
    LittleEndian::write_u16(&mut page[48 + 14..48 + 16], flags);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::fixup::apply_fixups;
    use crate::ntfs::mft::MftRecord;

    #[test]
    fn built_records_survive_fixup_decoding() {
        let image = build_default_image();
        for i in 0..16u64 {
            let at = (image.mft_offset + i * IMG_RECORD) as usize;
            let mut rec = image.bytes[at..at + IMG_RECORD as usize].to_vec();
            apply_fixups(&mut rec, IMG_SECTOR as usize).unwrap();
            let parsed = MftRecord::parse(i, rec).unwrap();
            assert!(parsed.is_in_use(), "record {} should be in use", i);
        }
    }

    #[test]
    fn mirror_matches_the_table() {
        let image = build_default_image();
        let table = &image.bytes
            [image.mft_offset as usize..(image.mft_offset + 4 * IMG_RECORD) as usize];
        let mirror = &image.bytes
            [image.mirror_offset as usize..(image.mirror_offset + 4 * IMG_RECORD) as usize];
        assert_eq!(table, mirror);
    }

    #[test]
    fn mapping_pairs_round_trip() {
        use crate::ntfs::data_runs::decode_data_runs;
        let encoded = encode_mapping_pairs(&[(4, 8), (100, 2)]);
        let runs = decode_data_runs(&encoded).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].lcn, Some(4));
        assert_eq!(runs[0].length, 8);
        assert_eq!(runs[1].lcn, Some(100));
        assert_eq!(runs[1].length, 2);
    }

    #[test]
    fn upcase_bytes_fold_ascii() {
        let table = default_upcase_bytes();
        let entry = |c: usize| LittleEndian::read_u16(&table[c * 2..c * 2 + 2]);
        assert_eq!(entry(0x61), 0x41); // 'a' -> 'A'
        assert_eq!(entry(0x41), 0x41);
        assert_eq!(entry(0x2F), 0x2F);
    }
}
