//! Chunked read ring.
//!
//! The ring maps absolute file offsets onto a fixed set of chunk slots:
//! offset `o` lives in slot `(o / M) % C` at position `o % M`, where `M` is
//! [`MEMORY_CHUNK_SIZE`] and `C` the configured slot count. The valid bytes
//! form the contiguous range `[start, end)`; `scan` may run ahead of `end`
//! while verify-delay holds freshly read online blocks back. Slots are
//! allocated lazily against the shared chunk budget in [`RunCtx`] and
//! returned to it as the consumer confirms data past them.

use redotail_types::ctx::{RunCtx, MEMORY_CHUNK_SIZE};

pub(crate) struct Ring {
    slots: Vec<Option<Box<[u8]>>>,
    /// First unconfirmed byte; advanced by the consumer only.
    pub start: u64,
    /// End of published bytes; advanced by the producer only.
    pub end: u64,
    /// End of scanned bytes; `scan > end` while blocks are held for verify.
    pub scan: u64,
}

impl Ring {
    pub fn new(slot_count: usize) -> Self {
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, || None);
        Self {
            slots,
            start: 0,
            end: 0,
            scan: 0,
        }
    }

    fn slot_of(&self, offset: u64) -> usize {
        ((offset / MEMORY_CHUNK_SIZE) % self.slots.len() as u64) as usize
    }

    fn pos_in_chunk(offset: u64) -> usize {
        (offset % MEMORY_CHUNK_SIZE) as usize
    }

    /// Reposition the ring; all three cursors collapse onto `offset`.
    pub fn reset(&mut self, offset: u64) {
        self.start = offset;
        self.end = offset;
        self.scan = offset;
    }

    /// Make sure the slot holding `offset` is backed by memory.
    ///
    /// Returns `false` when the shared budget is dry; the caller waits for
    /// the consumer to confirm data and free slots.
    pub fn ensure_chunk(&mut self, ctx: &RunCtx, offset: u64) -> bool {
        let slot = self.slot_of(offset);
        if self.slots[slot].is_some() {
            return true;
        }
        if !ctx.try_reserve_chunk() {
            return false;
        }
        self.slots[slot] = Some(vec![0u8; MEMORY_CHUNK_SIZE as usize].into_boxed_slice());
        true
    }

    /// Copy `data` into the ring at `offset`. The caller has clipped the
    /// write to one chunk and ensured the slot is allocated.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let pos = Self::pos_in_chunk(offset);
        debug_assert!(pos + data.len() <= MEMORY_CHUNK_SIZE as usize);
        let slot = self.slot_of(offset);
        let chunk = self.slots[slot].as_mut().expect("chunk allocated");
        chunk[pos..pos + data.len()].copy_from_slice(data);
    }

    /// Copy published bytes out of the ring, clamped to `[start, end)`.
    /// May span chunk boundaries. Returns the number of bytes copied.
    pub fn read_published(&self, offset: u64, buf: &mut [u8]) -> usize {
        if offset < self.start || offset >= self.end {
            return 0;
        }
        let mut copied = 0;
        while copied < buf.len() {
            let at = offset + copied as u64;
            if at >= self.end {
                break;
            }
            let pos = Self::pos_in_chunk(at);
            let in_chunk = (MEMORY_CHUNK_SIZE as usize - pos)
                .min(buf.len() - copied)
                .min((self.end - at) as usize);
            let slot = self.slot_of(at);
            let Some(chunk) = self.slots[slot].as_ref() else {
                break;
            };
            buf[copied..copied + in_chunk].copy_from_slice(&chunk[pos..pos + in_chunk]);
            copied += in_chunk;
        }
        copied
    }

    /// Read the verify-delay stamp a held block carries in its first 8 bytes.
    pub fn read_stamp(&self, offset: u64) -> u64 {
        let pos = Self::pos_in_chunk(offset);
        let slot = self.slot_of(offset);
        let chunk = self.slots[slot].as_ref().expect("chunk allocated");
        u64::from_le_bytes(chunk[pos..pos + 8].try_into().expect("8-byte stamp"))
    }

    /// Stamp a held block with the time it was first read.
    pub fn write_stamp(&mut self, offset: u64, stamp: u64) {
        self.write(offset, &stamp.to_le_bytes());
    }

    /// Release every slot back to the shared budget.
    pub fn free_all(&mut self, ctx: &RunCtx) {
        for slot in &mut self.slots {
            if slot.take().is_some() {
                ctx.release_chunk();
            }
        }
    }

    /// Release slots no longer covered by `[start, max(end, scan))`.
    pub fn free_dead(&mut self, ctx: &RunCtx) {
        let count = self.slots.len() as u64;
        let lo_chunk = self.start / MEMORY_CHUNK_SIZE;
        let hi_off = self.end.max(self.scan);
        let hi_chunk = if hi_off > self.start {
            (hi_off - 1) / MEMORY_CHUNK_SIZE
        } else {
            lo_chunk
        };
        let span = hi_chunk - lo_chunk + 1;
        if span >= count {
            return; // every slot is live
        }
        let lo_slot = lo_chunk % count;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let distance = (index as u64 + count - lo_slot) % count;
            if distance >= span && slot.take().is_some() {
                ctx.release_chunk();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redotail_types::ctx::RunCtxConfig;

    fn ctx(chunks: u64) -> RunCtx {
        RunCtx::new(RunCtxConfig {
            memory_chunks_max: chunks,
            buffer_size_max: chunks * MEMORY_CHUNK_SIZE,
            ..RunCtxConfig::default()
        })
    }

    #[test]
    fn write_then_read_round_trip() {
        let ctx = ctx(4);
        let mut ring = Ring::new(4);
        ring.reset(1024);
        assert!(ring.ensure_chunk(&ctx, 1024));
        ring.write(1024, b"hello blocks");
        ring.end = 1024 + 12;

        let mut buf = [0u8; 12];
        assert_eq!(ring.read_published(1024, &mut buf), 12);
        assert_eq!(&buf, b"hello blocks");
    }

    #[test]
    fn read_outside_window_returns_zero() {
        let ctx = ctx(4);
        let mut ring = Ring::new(4);
        ring.reset(1024);
        assert!(ring.ensure_chunk(&ctx, 1024));
        ring.write(1024, b"abcd");
        ring.end = 1028;

        let mut buf = [0u8; 4];
        assert_eq!(ring.read_published(0, &mut buf), 0);
        assert_eq!(ring.read_published(1028, &mut buf), 0);
        // Clamped tail read.
        assert_eq!(ring.read_published(1026, &mut buf), 2);
        assert_eq!(&buf[..2], b"cd");
    }

    #[test]
    fn read_spans_chunk_boundary() {
        let ctx = ctx(4);
        let mut ring = Ring::new(4);
        let boundary = MEMORY_CHUNK_SIZE;
        ring.reset(boundary - 4);
        assert!(ring.ensure_chunk(&ctx, boundary - 4));
        assert!(ring.ensure_chunk(&ctx, boundary));
        ring.write(boundary - 4, b"tail");
        ring.write(boundary, b"head");
        ring.end = boundary + 4;

        let mut buf = [0u8; 8];
        assert_eq!(ring.read_published(boundary - 4, &mut buf), 8);
        assert_eq!(&buf, b"tailhead");
    }

    #[test]
    fn budget_exhaustion_blocks_allocation() {
        let ctx = ctx(1);
        let mut ring = Ring::new(2);
        assert!(ring.ensure_chunk(&ctx, 0));
        assert!(!ring.ensure_chunk(&ctx, MEMORY_CHUNK_SIZE));
        ring.free_all(&ctx);
        assert!(ring.ensure_chunk(&ctx, MEMORY_CHUNK_SIZE));
    }

    #[test]
    fn free_dead_releases_confirmed_slots() {
        let ctx = ctx(4);
        let mut ring = Ring::new(4);
        ring.reset(0);
        for chunk in 0..3u64 {
            assert!(ring.ensure_chunk(&ctx, chunk * MEMORY_CHUNK_SIZE));
        }
        ring.end = 3 * MEMORY_CHUNK_SIZE;
        ring.scan = ring.end;
        assert_eq!(ctx.chunks_free(), 1);

        // Consumer confirmed everything up into the third chunk.
        ring.start = 2 * MEMORY_CHUNK_SIZE + 512;
        ring.free_dead(&ctx);
        assert_eq!(ctx.chunks_free(), 3);

        // The live slot survived.
        let mut buf = [0u8; 8];
        assert_eq!(ring.read_published(ring.start, &mut buf), 8);
    }

    #[test]
    fn stamps_round_trip() {
        let ctx = ctx(2);
        let mut ring = Ring::new(2);
        ring.reset(512);
        assert!(ring.ensure_chunk(&ctx, 512));
        ring.write_stamp(512, 0xDEAD_BEEF_0042);
        assert_eq!(ring.read_stamp(512), 0xDEAD_BEEF_0042);
    }
}
