//! Synthetic redo log files for tests.
//!
//! This crate is intentionally not "just tests": the scenario suites of
//! several crates build byte-exact log files from it — valid block 0/1
//! headers, checksummed payload blocks, and the sentinel fields an archived
//! or still-open online log would carry on disk.

use std::path::Path;

use redotail_reader::block::{
    calc_checksum, marker_for_block_size, B0_BLOCK_SIZE, B0_ENDIAN, B1_ACTIVATION, B1_COMPAT_VSN,
    B1_DBID, B1_FIRST_SCN, B1_FIRST_TIME, B1_MISC_FLAGS, B1_NEXT_SCN, B1_NEXT_TIME, B1_NUM_BLOCKS,
    B1_RESETLOGS, B1_SEQUENCE, B1_SID, BLK_CHECKSUM, BLK_NUMBER, BLK_SEQUENCE,
};

/// Compat version most fixtures use (19.18).
pub const DEFAULT_COMPAT_VSN: u32 = 0x1312_0000;

/// Everything needed to materialize one log file.
#[derive(Debug, Clone)]
pub struct LogSpec {
    pub block_size: u32,
    pub sequence: u32,
    pub first_scn: u64,
    /// `None` renders the on-disk "absent" sentinel of an unfinished log.
    pub next_scn: Option<u64>,
    pub resetlogs: u32,
    pub activation: u32,
    pub dbid: u32,
    pub sid: &'static str,
    pub compat_vsn: u32,
    /// Payload blocks following the two header blocks.
    pub payload_blocks: u32,
    /// The declared-length field; `None` renders the "unknown" sentinel.
    pub declared_blocks: Option<u32>,
    pub big_endian: bool,
}

impl Default for LogSpec {
    fn default() -> Self {
        Self {
            block_size: 512,
            sequence: 1,
            first_scn: 1000,
            next_scn: Some(2000),
            resetlogs: 1,
            activation: 42,
            dbid: 0x0BAD_CAFE,
            sid: "ORCLCDB1",
            compat_vsn: DEFAULT_COMPAT_VSN,
            payload_blocks: 8,
            declared_blocks: None,
            big_endian: false,
        }
    }
}

impl LogSpec {
    /// A finished archived log: payload plus a matching declared length and
    /// a known next SCN.
    #[must_use]
    pub fn archived(sequence: u32, first_scn: u64, next_scn: u64, payload_blocks: u32) -> Self {
        Self {
            sequence,
            first_scn,
            next_scn: Some(next_scn),
            payload_blocks,
            declared_blocks: Some(2 + payload_blocks),
            ..Self::default()
        }
    }

    /// An online log still being written: no next SCN, unknown length.
    #[must_use]
    pub fn online(sequence: u32, first_scn: u64, payload_blocks: u32) -> Self {
        Self {
            sequence,
            first_scn,
            next_scn: None,
            payload_blocks,
            declared_blocks: None,
            ..Self::default()
        }
    }

    /// Total on-disk size this spec materializes to.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        u64::from(self.block_size) * u64::from(2 + self.payload_blocks)
    }
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    buf[offset..offset + 4].copy_from_slice(&bytes);
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    buf[offset..offset + 8].copy_from_slice(&bytes);
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    buf[offset..offset + 2].copy_from_slice(&bytes);
}

/// Deterministic payload byte for position `index` of block `blk` in
/// sequence `sequence`. Tests compare published bytes against this.
#[must_use]
pub fn payload_byte(sequence: u32, blk: u32, index: usize) -> u8 {
    (sequence
        .wrapping_mul(31)
        .wrapping_add(blk.wrapping_mul(7))
        .wrapping_add(index as u32)
        & 0xFF) as u8
}

/// Build one payload block: typed header, sequence, checksum, pattern body.
#[must_use]
pub fn build_payload_block(spec: &LogSpec, blk: u32) -> Vec<u8> {
    let size = spec.block_size as usize;
    let mut block = vec![0u8; size];
    block[0] = 0x01;
    block[1] = marker_for_block_size(spec.block_size).expect("supported block size");
    write_u32(&mut block, BLK_NUMBER, blk, spec.big_endian);
    write_u32(&mut block, BLK_SEQUENCE, spec.sequence, spec.big_endian);
    for index in 16..size {
        block[index] = payload_byte(spec.sequence, blk, index);
    }
    seal_checksum(&mut block, spec.big_endian);
    block
}

/// Compute and store the block checksum.
pub fn seal_checksum(block: &mut [u8], big_endian: bool) {
    write_u16(block, BLK_CHECKSUM, 0, big_endian);
    let sum = calc_checksum(block, big_endian);
    write_u16(block, BLK_CHECKSUM, sum, big_endian);
}

/// Materialize the whole log file in memory.
#[must_use]
pub fn build_log(spec: &LogSpec) -> Vec<u8> {
    let size = spec.block_size as usize;
    let mut file = Vec::with_capacity(size * (2 + spec.payload_blocks as usize));

    // Block 0: magic, marker, block size, byte-order signature.
    let mut block0 = vec![0u8; size];
    block0[1] = marker_for_block_size(spec.block_size).expect("supported block size");
    write_u32(&mut block0, B0_BLOCK_SIZE, spec.block_size, spec.big_endian);
    let signature: [u8; 4] = if spec.big_endian {
        [0x7A, 0x7B, 0x7C, 0x7D]
    } else {
        [0x7D, 0x7C, 0x7B, 0x7A]
    };
    block0[B0_ENDIAN..B0_ENDIAN + 4].copy_from_slice(&signature);
    file.extend_from_slice(&block0);

    // Block 1: redo header fields plus the common block header.
    let mut block1 = vec![0u8; size];
    block1[0] = 0x01;
    block1[1] = block0[1];
    write_u32(&mut block1, BLK_NUMBER, 1, spec.big_endian);
    write_u32(&mut block1, B1_SEQUENCE, spec.sequence, spec.big_endian);
    write_u32(&mut block1, B1_COMPAT_VSN, spec.compat_vsn, spec.big_endian);
    write_u32(&mut block1, B1_DBID, spec.dbid, spec.big_endian);
    let sid = spec.sid.as_bytes();
    block1[B1_SID..B1_SID + sid.len().min(8)].copy_from_slice(&sid[..sid.len().min(8)]);
    write_u32(&mut block1, B1_ACTIVATION, spec.activation, spec.big_endian);
    write_u32(
        &mut block1,
        B1_NUM_BLOCKS,
        spec.declared_blocks.unwrap_or(u32::MAX),
        spec.big_endian,
    );
    write_u32(&mut block1, B1_RESETLOGS, spec.resetlogs, spec.big_endian);
    write_u64(&mut block1, B1_FIRST_SCN, spec.first_scn, spec.big_endian);
    write_u32(&mut block1, B1_FIRST_TIME, 0x5000_0000, spec.big_endian);
    write_u64(
        &mut block1,
        B1_NEXT_SCN,
        spec.next_scn.unwrap_or(u64::MAX),
        spec.big_endian,
    );
    write_u32(&mut block1, B1_NEXT_TIME, 0x5000_1000, spec.big_endian);
    write_u32(&mut block1, B1_MISC_FLAGS, 0, spec.big_endian);
    seal_checksum(&mut block1, spec.big_endian);
    file.extend_from_slice(&block1);

    for blk in 2..2 + spec.payload_blocks {
        file.extend_from_slice(&build_payload_block(spec, blk));
    }
    file
}

/// Write the log file to disk.
pub fn write_log(path: &Path, spec: &LogSpec) -> std::io::Result<()> {
    std::fs::write(path, build_log(spec))
}

fn write_block_at(path: &Path, offset: u64, block: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.write_all_at(block, offset)
}

/// Flip a payload byte of one block in an on-disk log so its checksum fails.
/// The write is positional so a concurrently reading thread never observes a
/// truncated file.
pub fn corrupt_block(path: &Path, spec: &LogSpec, blk: u32) -> std::io::Result<()> {
    let mut block = build_payload_block(spec, blk);
    block[100] ^= 0xFF;
    write_block_at(path, u64::from(blk) * u64::from(spec.block_size), &block)
}

/// Restore one block of an on-disk log to its pristine content.
pub fn restore_block(path: &Path, spec: &LogSpec, blk: u32) -> std::io::Result<()> {
    let block = build_payload_block(spec, blk);
    write_block_at(path, u64::from(blk) * u64::from(spec.block_size), &block)
}

/// Overwrite payload blocks starting at `from_blk` with blocks belonging to
/// a newer sequence, the way a wrapped online log looks on disk.
pub fn overwrite_with_sequence(
    path: &Path,
    spec: &LogSpec,
    from_blk: u32,
    new_sequence: u32,
) -> std::io::Result<()> {
    let newer = LogSpec {
        sequence: new_sequence,
        ..spec.clone()
    };
    for blk in from_blk..2 + spec.payload_blocks {
        let block = build_payload_block(&newer, blk);
        write_block_at(path, u64::from(blk) * u64::from(spec.block_size), &block)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use redotail_reader::block::{version_supported, BLK_CHECKSUM};

    #[test]
    fn built_log_has_expected_shape() {
        let spec = LogSpec::archived(100, 1000, 2000, 4);
        let bytes = build_log(&spec);
        assert_eq!(bytes.len() as u64, spec.file_size());
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 0x22);
        // Little-endian signature.
        assert_eq!(&bytes[B0_ENDIAN..B0_ENDIAN + 4], &[0x7D, 0x7C, 0x7B, 0x7A]);
        assert!(version_supported(DEFAULT_COMPAT_VSN));
    }

    #[test]
    fn payload_blocks_checksum_cleanly() {
        let spec = LogSpec::default();
        for blk in 2..2 + spec.payload_blocks {
            let block = build_payload_block(&spec, blk);
            let stored = u16::from_le_bytes(
                block[BLK_CHECKSUM..BLK_CHECKSUM + 2]
                    .try_into()
                    .expect("checksum bytes"),
            );
            assert_eq!(stored, calc_checksum(&block, false), "block {blk}");
        }
    }

    #[test]
    fn big_endian_log_carries_be_signature() {
        let spec = LogSpec {
            big_endian: true,
            ..LogSpec::default()
        };
        let bytes = build_log(&spec);
        assert_eq!(&bytes[B0_ENDIAN..B0_ENDIAN + 4], &[0x7A, 0x7B, 0x7C, 0x7D]);
    }

    #[test]
    fn corruption_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("corrupt.arc");
        let spec = LogSpec::archived(7, 10, 20, 3);
        write_log(&path, &spec).expect("write log");
        let pristine = std::fs::read(&path).expect("read back");

        corrupt_block(&path, &spec, 2).expect("corrupt");
        assert_ne!(std::fs::read(&path).expect("read corrupt"), pristine);

        restore_block(&path, &spec, 2).expect("restore");
        assert_eq!(std::fs::read(&path).expect("read restored"), pristine);
    }
}
