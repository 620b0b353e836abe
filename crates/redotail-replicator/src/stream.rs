//! The record-stream boundary: drive one reader through one file.
//!
//! The real opcode parser lives outside this core; what the replicator needs
//! from it is only the consumption protocol — position the window, read the
//! bytes as they are published, confirm the prefix so the ring can recycle
//! chunks, persist the confirmed offset, and report the reader's terminal
//! code. [`RecordStream`] implements exactly that protocol.

use std::sync::Arc;

use redotail_reader::Reader;
use redotail_types::ctx::RunCtx;
use redotail_types::{FileOffset, RedoCode};
use tracing::trace;

use crate::metadata::Metadata;

/// Drives one reader through the current file on behalf of the (external)
/// record parser.
pub struct RecordStream<'a> {
    ctx: &'a Arc<RunCtx>,
    metadata: &'a Metadata,
    scratch: Vec<u8>,
}

impl<'a> RecordStream<'a> {
    #[must_use]
    pub fn new(ctx: &'a Arc<RunCtx>, metadata: &'a Metadata) -> Self {
        Self {
            ctx,
            metadata,
            scratch: Vec::new(),
        }
    }

    /// Consume `reader`'s current file from the checkpointed offset to its
    /// terminal status. Returns the reader's final code; the confirmed
    /// offset lands in the metadata as it advances.
    pub fn process(&mut self, reader: &Reader) -> RedoCode {
        let block_size = u64::from(reader.block_size());
        let header_end = FileOffset::new(block_size * 2);
        let mut confirmed = self.metadata.file_offset().max(header_end);
        reader.set_buffer_start_end(confirmed, confirmed);
        reader.set_status_read();
        trace!(offset = confirmed.value(), "record stream positioned");

        loop {
            if self.ctx.is_soft_shutdown() {
                return RedoCode::Shutdown;
            }
            let end = reader.buffer_end();
            if confirmed < end {
                let span = (end.value() - confirmed.value()) as usize;
                self.scratch.resize(span, 0);
                let copied = reader.read_published(confirmed, &mut self.scratch[..span]);
                // The real parser decodes records here; this boundary only
                // accounts the bytes and moves the confirmation forward.
                confirmed = FileOffset::new(confirmed.value() + copied as u64);
                reader.confirm_read_data(confirmed);
                self.metadata.set_file_offset(confirmed);
            } else if reader.check_finished(confirmed) {
                let ret = reader.ret();
                trace!(ret = %ret, offset = confirmed.value(), "record stream done");
                return ret;
            }
        }
    }
}
