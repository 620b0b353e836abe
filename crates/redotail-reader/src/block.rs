//! On-disk layout of redo log blocks and their validation.
//!
//! A log file is a sequence of fixed-size blocks (512, 1024 or 4096 bytes).
//! Block 0 is the file header, block 1 the redo header, everything after
//! carries payload. The layout is:
//!
//! ```text
//! Block 0:   [0]    = 0x00
//!            [1]    = 0x22 (512/1024-byte blocks) or 0x82 (4096)
//!            [20..] = u32 block size
//!            [28..] = byte-order signature 7A 7B 7C 7D (BE) / 7D 7C 7B 7A (LE)
//! Block 1:   [8..]   u32 sequence        [20..]  u32 compat version
//!            [24..]  u32 dbid            [28..36] ASCII SID
//!            [52..]  u32 activation      [156..] u32 block count
//!            [160..] u32 resetlogs       [180..] u64 first SCN
//!            [188..] u32 first time      [192..] u64 next SCN
//!            [200..] u32 next time       [236..] u32 misc flags
//! Block k≥1: [4..]   u32 block number    [8..]   u32 sequence
//!            [14..]  u16 checksum (XOR of the block as 8-byte words,
//!                    folded to 32 then 16 bits)
//! ```

use std::path::Path;

use redotail_types::ctx::RunCtx;
use redotail_types::{Activation, Blk, RedoCode, Resetlogs, Scn, Seq};
use tracing::{error, warn};

/// Byte 1 marker for 512- and 1024-byte blocks.
pub const MARKER_SMALL: u8 = 0x22;
/// Byte 1 marker for 4096-byte blocks.
pub const MARKER_LARGE: u8 = 0x82;

/// Offset of the block-size field in block 0.
pub const B0_BLOCK_SIZE: usize = 20;
/// Offset of the byte-order signature in block 0.
pub const B0_ENDIAN: usize = 28;

pub const B1_SEQUENCE: usize = 8;
pub const B1_COMPAT_VSN: usize = 20;
pub const B1_DBID: usize = 24;
pub const B1_SID: usize = 28;
pub const B1_ACTIVATION: usize = 52;
pub const B1_NUM_BLOCKS: usize = 156;
pub const B1_RESETLOGS: usize = 160;
pub const B1_FIRST_SCN: usize = 180;
pub const B1_FIRST_TIME: usize = 188;
pub const B1_NEXT_SCN: usize = 192;
pub const B1_NEXT_TIME: usize = 200;
pub const B1_MISC_FLAGS: usize = 236;

/// Offset of the block number in every block after block 0.
pub const BLK_NUMBER: usize = 4;
/// Offset of the sequence in every block after block 0.
pub const BLK_SEQUENCE: usize = 8;
/// Offset of the 16-bit checksum in every block after block 0.
pub const BLK_CHECKSUM: usize = 14;

/// Marker byte expected for a given block size, or `None` if the size is not
/// one of the supported three.
#[must_use]
pub const fn marker_for_block_size(block_size: u32) -> Option<u8> {
    match block_size {
        512 | 1024 => Some(MARKER_SMALL),
        4096 => Some(MARKER_LARGE),
        _ => None,
    }
}

/// The checksum a block should carry: XOR over the block as 8-byte words,
/// folded to 32 then to 16 bits, with the stored checksum field backed out.
#[must_use]
pub fn calc_checksum(block: &[u8], big_endian: bool) -> u16 {
    let stored_bytes: [u8; 2] = block[BLK_CHECKSUM..BLK_CHECKSUM + 2]
        .try_into()
        .expect("2-byte checksum");
    let stored = if big_endian {
        u16::from_be_bytes(stored_bytes)
    } else {
        u16::from_le_bytes(stored_bytes)
    };
    let mut sum: u64 = 0;
    for word in block.chunks_exact(8) {
        sum ^= u64::from_le_bytes(word.try_into().expect("8-byte word"));
    }
    sum ^= sum >> 32;
    sum ^= sum >> 16;
    sum ^= u64::from(stored);
    (sum & 0xFFFF) as u16
}

/// Whether a compat version falls inside a supported release range.
#[must_use]
pub const fn version_supported(compat_vsn: u32) -> bool {
    matches!(compat_vsn,
        0x0B20_0000..=0x0B20_0400     // 11.2
        | 0x0C10_0000..=0x0C10_0200   // 12.1
        | 0x0C20_0000..=0x0C20_0100   // 12.2
        | 0x1200_0000..=0x120E_0000   // 18
        | 0x1300_0000..=0x1312_0000   // 19
        | 0x1500_0000..=0x1508_0000   // 21
        | 0x1700_0000..=0x1703_0000   // 23
    )
}

/// Dotted rendering of a compat version. The field packs its components
/// differently before and after release 18.
#[must_use]
pub fn version_string(compat_vsn: u32) -> String {
    if compat_vsn < 0x1200_0000 {
        format!(
            "{}.{}.{}.{}",
            compat_vsn >> 24,
            (compat_vsn >> 20) & 0xF,
            (compat_vsn >> 16) & 0xF,
            (compat_vsn >> 8) & 0xFF
        )
    } else {
        format!(
            "{}.{}.{}",
            compat_vsn >> 24,
            (compat_vsn >> 16) & 0xFF,
            (compat_vsn >> 8) & 0xFF
        )
    }
}

/// Fields extracted from block 1 of a log file.
#[derive(Debug, Clone, Default)]
pub struct RedoHeader {
    pub sequence: Seq,
    pub compat_vsn: u32,
    pub dbid: u32,
    pub sid: String,
    pub activation: Activation,
    pub num_blocks: Blk,
    pub resetlogs: Resetlogs,
    pub first_scn: Scn,
    pub first_time: u32,
    pub next_scn: Scn,
    pub next_time: u32,
    pub misc_flags: u32,
}

impl RedoHeader {
    /// Extract the block-1 fields. The caller has already validated block 0
    /// and knows the block size; `block1` is that one block.
    #[must_use]
    pub fn parse(ctx: &RunCtx, block1: &[u8]) -> Self {
        let sid_bytes = &block1[B1_SID..B1_SID + 8];
        let sid = sid_bytes
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| char::from(*b))
            .collect();
        Self {
            sequence: Seq(ctx.read_u32(&block1[B1_SEQUENCE..])),
            compat_vsn: ctx.read_u32(&block1[B1_COMPAT_VSN..]),
            dbid: ctx.read_u32(&block1[B1_DBID..]),
            sid,
            activation: Activation(ctx.read_u32(&block1[B1_ACTIVATION..])),
            num_blocks: ctx.read_blk(&block1[B1_NUM_BLOCKS..]),
            resetlogs: Resetlogs(ctx.read_u32(&block1[B1_RESETLOGS..])),
            first_scn: ctx.read_scn(&block1[B1_FIRST_SCN..]),
            first_time: ctx.read_u32(&block1[B1_FIRST_TIME..]),
            next_scn: ctx.read_scn(&block1[B1_NEXT_SCN..]),
            next_time: ctx.read_u32(&block1[B1_NEXT_TIME..]),
            misc_flags: ctx.read_u32(&block1[B1_MISC_FLAGS..]),
        }
    }
}

/// Validates payload block headers against the expectations of one file.
///
/// Carries the adopt-on-first-block rule: the first block seen for a file
/// (or any block while the reader is in `UPDATE`) donates its sequence; every
/// later block must agree with it, where "agree" depends on whether the file
/// is archived (group 0, exact match) or online (greater sequence means the
/// log wrapped over us).
#[derive(Debug)]
pub struct BlockValidator<'a> {
    pub ctx: &'a RunCtx,
    pub path: &'a Path,
    pub block_size: u32,
    pub group: u32,
    /// Adopt the next block's sequence instead of comparing.
    pub adopt_sequence: bool,
    pub sequence: Seq,
    pub configured_block_sum: bool,
    hint_displayed: bool,
}

impl<'a> BlockValidator<'a> {
    #[must_use]
    pub fn new(
        ctx: &'a RunCtx,
        path: &'a Path,
        block_size: u32,
        group: u32,
        adopt_sequence: bool,
        sequence: Seq,
        configured_block_sum: bool,
    ) -> Self {
        Self {
            ctx,
            path,
            block_size,
            group,
            adopt_sequence,
            sequence,
            configured_block_sum,
            hint_displayed: false,
        }
    }

    /// Check one block against its expected block number.
    pub fn check(&mut self, block: &[u8], expected: Blk, show_hint: bool) -> RedoCode {
        if block[0] == 0 && block[1] == 0 {
            return RedoCode::Empty;
        }

        match marker_for_block_size(self.block_size) {
            Some(marker) if block[1] == marker => {}
            _ => {
                error!(
                    path = %self.path.display(),
                    block = expected.value(),
                    block_size = self.block_size,
                    marker = block[1],
                    "invalid block size marker"
                );
                return RedoCode::ErrorBadData;
            }
        }

        let number_header = self.ctx.read_blk(&block[BLK_NUMBER..]);
        let sequence_header = Seq(self.ctx.read_u32(&block[BLK_SEQUENCE..]));

        if self.sequence.is_zero() || self.adopt_sequence {
            self.sequence = sequence_header;
            self.adopt_sequence = false;
        } else if self.group == 0 {
            // Archived file: every block belongs to exactly one sequence.
            if self.sequence != sequence_header {
                warn!(
                    path = %self.path.display(),
                    found = %sequence_header,
                    expected = %self.sequence,
                    "invalid header sequence"
                );
                return RedoCode::ErrorSequence;
            }
        } else {
            // Online member: a smaller sequence is an unwritten block, a
            // larger one means the log wrapped past our position.
            if self.sequence > sequence_header {
                return RedoCode::Empty;
            }
            if self.sequence < sequence_header {
                return RedoCode::Overwritten;
            }
        }

        if number_header != expected {
            error!(
                path = %self.path.display(),
                found = number_header.value(),
                expected = expected.value(),
                "invalid header block number"
            );
            return RedoCode::ErrorBlock;
        }

        if !self
            .ctx
            .is_check_disabled(redotail_types::ctx::DISABLE_CHECKS_BLOCK_SUM)
        {
            let stored = self.ctx.read_u16(&block[BLK_CHECKSUM..]);
            let calculated = calc_checksum(block, self.ctx.is_big_endian());
            if stored != calculated {
                if show_hint {
                    warn!(
                        path = %self.path.display(),
                        block = expected.value(),
                        stored,
                        calculated,
                        "invalid block checksum"
                    );
                    if !self.hint_displayed {
                        if !self.configured_block_sum {
                            warn!(
                                "set DB_BLOCK_CHECKSUM = TYPICAL on the database or disable \
                                 consistency checking with disable-checks bit 0"
                            );
                        }
                        self.hint_displayed = true;
                    }
                }
                return RedoCode::ErrorCrc;
            }
        }

        RedoCode::Ok
    }
}
