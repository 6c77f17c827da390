// NTFS data run (mapping pairs) decoding and runlist assembly
// The runlist is the logical-to-physical map of a non-resident stream; the
// mount path leans on its first extent to verify where the MFT and its
// mirror actually live.

use lodestone_core::LodestoneError;

/// Data run entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRun {
    pub vcn: u64,                   // Starting virtual cluster number
    pub lcn: Option<u64>,           // Logical cluster number (None for sparse)
    pub length: u64,                // Length in clusters
}

/// Ordered, contiguous-from-zero sequence of data runs.
#[derive(Debug, Clone, Default)]
pub struct Runlist {
    runs: Vec<DataRun>,
}

impl Runlist {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    pub fn runs(&self) -> &[DataRun] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Physical start of the first extent, if it is not sparse.
    pub fn first_lcn(&self) -> Option<u64> {
        self.runs.first().and_then(|run| run.lcn)
    }

    /// Highest VCN covered, or None for an empty runlist.
    pub fn highest_vcn(&self) -> Option<u64> {
        self.runs.last().map(|run| run.vcn + run.length - 1)
    }

    /// Append decoded runs starting at `base_vcn`, enforcing that logical
    /// coverage stays contiguous from zero.
    pub fn append(&mut self, base_vcn: u64, decoded: &[DataRun]) -> Result<(), LodestoneError> {
        let expected = match self.highest_vcn() {
            Some(high) => high + 1,
            None => 0,
        };
        if base_vcn != expected {
            return Err(LodestoneError::Corruption(format!(
                "runlist extent starts at VCN {} but {} clusters are mapped",
                base_vcn, expected
            )));
        }
        let mut vcn = base_vcn;
        for run in decoded {
            self.runs.push(DataRun {
                vcn,
                lcn: run.lcn,
                length: run.length,
            });
            vcn += run.length;
        }
        Ok(())
    }

    /// Map a VCN to its physical cluster. Sparse clusters map to `Ok(None)`.
    pub fn map_vcn(&self, vcn: u64) -> Result<Option<u64>, LodestoneError> {
        for run in &self.runs {
            if vcn >= run.vcn && vcn < run.vcn + run.length {
                return Ok(run.lcn.map(|lcn| lcn + (vcn - run.vcn)));
            }
        }
        Err(LodestoneError::Corruption(format!(
            "VCN {} is not mapped by any extent",
            vcn
        )))
    }
}

/// Decode NTFS data runs from raw mapping-pairs bytes.
///
/// Returned runs carry VCNs relative to the start of the decoded extent;
/// `Runlist::append` rebases them.
pub fn decode_data_runs(data: &[u8]) -> Result<Vec<DataRun>, LodestoneError> {
    let mut runs = Vec::new();
    let mut pos = 0;
    let mut prev_lcn = 0i64;
    let mut vcn = 0u64;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break; // End marker
        }

        let length_size = (header & 0x0F) as usize;
        let offset_size = ((header >> 4) & 0x0F) as usize;
        pos += 1;

        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(LodestoneError::Corruption(format!(
                "invalid data run header byte {:#04x}",
                header
            )));
        }
        if pos + length_size + offset_size > data.len() {
            return Err(LodestoneError::Corruption(
                "data run extends beyond buffer".to_string(),
            ));
        }

        // Read run length (in clusters)
        let length = read_le_bytes(&data[pos..pos + length_size]);
        pos += length_size;
        if length == 0 {
            return Err(LodestoneError::Corruption(
                "zero-length data run".to_string(),
            ));
        }

        if offset_size == 0 {
            // Sparse run (hole in sparse file)
            runs.push(DataRun {
                vcn,
                lcn: None,
                length,
            });
        } else {
            // Read offset (signed, relative to previous)
            let offset = read_le_bytes_signed(&data[pos..pos + offset_size]);
            pos += offset_size;

            let lcn = prev_lcn + offset;
            prev_lcn = lcn;

            if lcn < 0 {
                return Err(LodestoneError::Corruption(format!("invalid LCN: {}", lcn)));
            }

            runs.push(DataRun {
                vcn,
                lcn: Some(lcn as u64),
                length,
            });
        }
        vcn += length;
    }

    Ok(runs)
}

/// Read little-endian bytes as unsigned integer
fn read_le_bytes(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= (byte as u64) << (i * 8);
    }
    value
}

/// Read little-endian bytes as signed integer
fn read_le_bytes_signed(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }

    let mut value = 0i64;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= (byte as i64) << (i * 8);
    }

    // Sign extend if negative
    let bits = bytes.len() * 8;
    if bits < 64 && (value & (1 << (bits - 1))) != 0 {
        value |= !((1i64 << bits) - 1);
    }

    value
}
