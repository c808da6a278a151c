//! SCSI command helpers
//!
//! Opcodes, sense data and response builders for the small command set a
//! bus-attached disk answers.

/// SCSI opcodes
pub mod opcodes {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0a;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1a;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
}

/// Status bytes
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
}

/// Sense keys
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x0;
    pub const MEDIUM_ERROR: u8 = 0x3;
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    pub const DATA_PROTECT: u8 = 0x7;
}

/// Additional sense codes
pub mod asc {
    pub const WRITE_FAULT: u8 = 0x03;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_OPCODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const WRITE_PROTECTED: u8 = 0x27;
}

/// Vendor identification reported by INQUIRY (8 bytes)
pub const VENDOR_ID: &[u8; 8] = b"PERIPH  ";

/// Product revision reported by INQUIRY (4 bytes)
pub const REVISION: &[u8; 4] = b"1.0 ";

/// Peripheral device type for direct-access disks
pub const TYPE_DISK: u8 = 0x00;

/// Peripheral device type for CD-ROM drives
pub const TYPE_CDROM: u8 = 0x05;

/// Sense data kept by a target after a failed command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const NONE: Sense = Sense::new(sense_key::NO_SENSE, 0, 0);

    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    pub const fn illegal(asc: u8) -> Self {
        Self::new(sense_key::ILLEGAL_REQUEST, asc, 0)
    }

    /// Fixed-format sense data (18 bytes)
    pub fn to_fixed(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        data[0] = 0x70; // Current error, fixed format
        data[2] = self.key & 0x0f;
        data[7] = 10; // Additional sense length
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }
}

/// Cut a response down to the initiator's allocation length
pub fn truncate(mut response: Vec<u8>, alloc_len: usize) -> Vec<u8> {
    response.truncate(alloc_len);
    response
}

/// Generate a standard INQUIRY response (36 bytes)
pub fn handle_inquiry(model: &str, device_type: u8) -> Vec<u8> {
    let removable = if device_type == TYPE_CDROM { 0x80 } else { 0x00 };
    let mut response = vec![
        device_type,
        removable,
        0x02, // Version: SCSI-2
        0x02, // Response data format: 2
        31,   // Additional length
        0x00,
        0x00,
        0x00,
    ];

    response.extend_from_slice(VENDOR_ID);

    // Product identification (16 bytes, space padded)
    let mut product = [b' '; 16];
    for (dst, src) in product.iter_mut().zip(model.bytes()) {
        *dst = if src.is_ascii_graphic() || src == b' ' { src } else { b'?' };
    }
    response.extend_from_slice(&product);

    response.extend_from_slice(REVISION);
    response
}

/// Generate a READ CAPACITY (10) response
pub fn handle_read_capacity_10(total_blocks: u64, block_size: u32) -> Vec<u8> {
    let max_lba = match total_blocks {
        0 => 0,
        n if n > 0xffff_ffff => 0xffff_ffff_u32,
        n => (n - 1) as u32,
    };

    let mut response = Vec::with_capacity(8);
    response.extend_from_slice(&max_lba.to_be_bytes());
    response.extend_from_slice(&block_size.to_be_bytes());
    response
}

/// Generate a MODE SENSE (6) response with one block descriptor
pub fn handle_mode_sense(read_only: bool, total_blocks: u64, block_size: u32) -> Vec<u8> {
    let blocks = total_blocks.min(0x00ff_ffff) as u32;
    let mut response = vec![
        11,                                 // Mode data length
        0x00,                               // Medium type
        if read_only { 0x80 } else { 0x00 }, // Device-specific: WP
        8,                                  // Block descriptor length
    ];
    response.push(0x00); // Density code
    response.extend_from_slice(&blocks.to_be_bytes()[1..]);
    response.push(0x00);
    response.extend_from_slice(&block_size.to_be_bytes()[1..]);
    response
}

/// Parse a READ/WRITE CDB into (LBA, block count)
pub fn parse_read_write_cdb(cdb: &[u8]) -> Result<(u64, u32), Sense> {
    let Some(&opcode) = cdb.first() else {
        return Err(Sense::illegal(asc::INVALID_OPCODE));
    };

    match opcode {
        opcodes::READ_6 | opcodes::WRITE_6 => {
            if cdb.len() < 6 {
                return Err(Sense::illegal(asc::INVALID_FIELD_IN_CDB));
            }
            let lba = u32::from_be_bytes([0, cdb[1] & 0x1f, cdb[2], cdb[3]]) as u64;
            // A zero length means 256 blocks in the 6-byte form
            let count = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
            Ok((lba, count))
        }
        opcodes::READ_10 | opcodes::WRITE_10 => {
            if cdb.len() < 10 {
                return Err(Sense::illegal(asc::INVALID_FIELD_IN_CDB));
            }
            let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64;
            let count = u16::from_be_bytes([cdb[7], cdb[8]]) as u32;
            Ok((lba, count))
        }
        _ => Err(Sense::illegal(asc::INVALID_OPCODE)),
    }
}

/// Allocation length of a 6-byte CDB (byte 4)
pub fn alloc_len_6(cdb: &[u8]) -> Result<usize, Sense> {
    if cdb.len() < 6 {
        return Err(Sense::illegal(asc::INVALID_FIELD_IN_CDB));
    }
    Ok(cdb[4] as usize)
}
