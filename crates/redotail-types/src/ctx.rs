//! Shared run context for one replication pipeline.
//!
//! [`RunCtx`] carries the process-wide pieces every thread needs: the two
//! shutdown flags, the byte order and database version discovered from the
//! first log header (set once, then locked), the reader tunables, and the
//! chunk budget for the read rings. Everything here is either immutable after
//! boot or guarded by an atomic/mutex, so readers and the replicator share it
//! behind an `Arc` without further coordination.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::info;

use crate::{Blk, Scn};

/// Size of one ring chunk. Reads never cross a chunk boundary.
pub const MEMORY_CHUNK_SIZE: u64 = 1024 * 1024;

/// Smallest block size any supported log file uses.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest block size any supported log file uses.
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// How many times a failing block-1 checksum is retried before giving up.
pub const BAD_CDC_MAX_CNT: u32 = 20;

/// Bit in `disable_checks` that turns off block checksum verification.
pub const DISABLE_CHECKS_BLOCK_SUM: u64 = 1 << 0;

/// `source.flags` bit: only process archived logs, never open online members.
pub const FLAG_ARCH_ONLY: u64 = 1 << 0;

/// `source.flags` bit: run without a schema snapshot.
pub const FLAG_SCHEMALESS: u64 = 1 << 1;

const ENDIAN_UNSET: u8 = 0;
const ENDIAN_LITTLE: u8 = 1;
const ENDIAN_BIG: u8 = 2;

/// Reader/replicator timing knobs, all in microseconds except `arch_read_tries`.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Backoff after an empty read on an online log.
    pub redo_read_sleep_us: u64,
    /// Backoff between attempts to open an archived log.
    pub arch_read_sleep_us: u64,
    /// How many CHECK/UPDATE attempts an archived log gets before failing.
    pub arch_read_tries: u32,
    /// Grace period before a freshly written online block is trusted.
    pub redo_verify_delay_us: u64,
    /// How often the online log set is re-enumerated.
    pub refresh_interval_us: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            redo_read_sleep_us: 50_000,
            arch_read_sleep_us: 10_000_000,
            arch_read_tries: 10,
            redo_verify_delay_us: 0,
            refresh_interval_us: 10_000_000,
        }
    }
}

/// Database facts locked in when the first log header parses successfully.
#[derive(Debug, Clone)]
pub struct DbSignature {
    /// Raw compat version from block 1.
    pub compat_vsn: u32,
    /// Dotted rendering of `compat_vsn`.
    pub version: String,
    /// Eight-character database SID.
    pub sid: String,
}

/// Boot-time inputs for [`RunCtx`].
#[derive(Debug, Clone, Default)]
pub struct RunCtxConfig {
    pub tunables: Tunables,
    /// Bitmask of disabled consistency checks.
    pub disable_checks: u64,
    /// Bitmask of source flags (`FLAG_ARCH_ONLY`, `FLAG_SCHEMALESS`).
    pub flags: u64,
    /// Optional directory that every read block is teed into.
    pub redo_copy_path: Option<PathBuf>,
    /// Ring budget in whole chunks, shared by all readers of the source.
    pub memory_chunks_max: u64,
    /// Upper bound on `buffer_end - buffer_start` for one reader.
    pub buffer_size_max: u64,
    /// Soft-shutdown after this many log switches; zero means unlimited.
    pub stop_log_switches: u64,
}

/// Process-wide shared state for one source database.
pub struct RunCtx {
    pub tunables: Tunables,
    pub disable_checks: u64,
    pub flags: u64,
    pub redo_copy_path: Option<PathBuf>,
    pub buffer_size_max: u64,
    pub memory_chunks_max: u64,

    soft_shutdown: AtomicBool,
    hard_shutdown: AtomicBool,
    endian: AtomicU8,
    signature: OnceLock<DbSignature>,
    chunks_free: Mutex<u64>,
    stop_log_switches: AtomicU64,
    wakers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl std::fmt::Debug for RunCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCtx")
            .field("tunables", &self.tunables)
            .field("flags", &self.flags)
            .field("soft_shutdown", &self.is_soft_shutdown())
            .field("hard_shutdown", &self.is_hard_shutdown())
            .finish_non_exhaustive()
    }
}

impl RunCtx {
    #[must_use]
    pub fn new(config: RunCtxConfig) -> Self {
        Self {
            tunables: config.tunables,
            disable_checks: config.disable_checks,
            flags: config.flags,
            redo_copy_path: config.redo_copy_path,
            buffer_size_max: config.buffer_size_max,
            memory_chunks_max: config.memory_chunks_max,
            soft_shutdown: AtomicBool::new(false),
            hard_shutdown: AtomicBool::new(false),
            endian: AtomicU8::new(ENDIAN_UNSET),
            signature: OnceLock::new(),
            chunks_free: Mutex::new(config.memory_chunks_max),
            stop_log_switches: AtomicU64::new(config.stop_log_switches),
            wakers: Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Request a cooperative stop: loops drain and exit at the next check.
    pub fn stop_soft(&self) {
        if !self.soft_shutdown.swap(true, Ordering::SeqCst) {
            info!("soft shutdown requested");
        }
        self.wake_all();
    }

    /// Request an immediate stop after a fatal error. Implies soft shutdown.
    pub fn stop_hard(&self) {
        self.hard_shutdown.store(true, Ordering::SeqCst);
        self.stop_soft();
    }

    #[must_use]
    pub fn is_soft_shutdown(&self) -> bool {
        self.soft_shutdown.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_hard_shutdown(&self) -> bool {
        self.hard_shutdown.load(Ordering::SeqCst)
    }

    /// Register a callback that kicks a blocked thread out of its wait.
    /// Invoked from [`RunCtx::stop_soft`] and [`RunCtx::stop_hard`].
    pub fn register_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        self.wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(waker);
    }

    /// Wake every registered waiter so shutdown is observed promptly.
    pub fn wake_all(&self) {
        let wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        for waker in wakers.iter() {
            waker();
        }
    }

    // ------------------------------------------------------------------
    // Byte order and database signature (set once at boot)
    // ------------------------------------------------------------------

    /// Record the byte order found in a file header.
    ///
    /// Returns `false` if a different order was locked in earlier; the caller
    /// treats that as corrupt data.
    pub fn try_set_endian(&self, big: bool) -> bool {
        let wanted = if big { ENDIAN_BIG } else { ENDIAN_LITTLE };
        match self
            .endian
            .compare_exchange(ENDIAN_UNSET, wanted, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == wanted,
        }
    }

    #[must_use]
    pub fn is_big_endian(&self) -> bool {
        self.endian.load(Ordering::SeqCst) == ENDIAN_BIG
    }

    /// Lock in the database signature on the first successful header parse.
    ///
    /// Later calls are ignored; the first one wins and is logged.
    pub fn set_signature(&self, signature: DbSignature) {
        let mut fresh = false;
        let stored = self.signature.get_or_init(|| {
            fresh = true;
            signature
        });
        if fresh {
            info!(
                version = %stored.version,
                sid = %stored.sid,
                endian = if self.is_big_endian() { "BIG" } else { "LITTLE" },
                "found redo log signature"
            );
        }
    }

    #[must_use]
    pub fn signature(&self) -> Option<&DbSignature> {
        self.signature.get()
    }

    // ------------------------------------------------------------------
    // Header field access in the discovered byte order
    // ------------------------------------------------------------------

    #[must_use]
    pub fn read_u16(&self, buf: &[u8]) -> u16 {
        let bytes: [u8; 2] = buf[..2].try_into().expect("slice of 2");
        if self.is_big_endian() {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        }
    }

    #[must_use]
    pub fn read_u32(&self, buf: &[u8]) -> u32 {
        let bytes: [u8; 4] = buf[..4].try_into().expect("slice of 4");
        if self.is_big_endian() {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    }

    #[must_use]
    pub fn read_u64(&self, buf: &[u8]) -> u64 {
        let bytes: [u8; 8] = buf[..8].try_into().expect("slice of 8");
        if self.is_big_endian() {
            u64::from_be_bytes(bytes)
        } else {
            u64::from_le_bytes(bytes)
        }
    }

    /// An on-disk SCN of all-ones is the absent sentinel, so the raw read
    /// already yields [`Scn::NONE`] for it.
    #[must_use]
    pub fn read_scn(&self, buf: &[u8]) -> Scn {
        Scn(self.read_u64(buf))
    }

    #[must_use]
    pub fn read_blk(&self, buf: &[u8]) -> Blk {
        Blk(self.read_u32(buf))
    }

    // ------------------------------------------------------------------
    // Ring chunk budget
    // ------------------------------------------------------------------

    /// Take one chunk from the shared budget. `false` means the pool is dry
    /// and the reader must wait for the consumer to confirm data.
    pub fn try_reserve_chunk(&self) -> bool {
        let mut free = self
            .chunks_free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *free == 0 {
            return false;
        }
        *free -= 1;
        true
    }

    /// Return one chunk to the shared budget.
    pub fn release_chunk(&self) {
        let mut free = self
            .chunks_free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *free += 1;
        debug_assert!(*free <= self.memory_chunks_max);
    }

    #[must_use]
    pub fn chunks_free(&self) -> u64 {
        *self
            .chunks_free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Stop after N log switches
    // ------------------------------------------------------------------

    /// Account one finished log file. Returns `true` when the configured
    /// switch budget has just been exhausted and the caller should stop.
    pub fn consume_log_switch(&self) -> bool {
        loop {
            let current = self.stop_log_switches.load(Ordering::SeqCst);
            if current == 0 {
                return false; // unlimited
            }
            if self
                .stop_log_switches
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return current == 1;
            }
        }
    }

    /// Sleep for `micros`, waking early if a soft shutdown arrives.
    pub fn interruptible_sleep(&self, micros: u64) {
        const SLICE_US: u64 = 100_000;
        let mut remaining = micros;
        while remaining > 0 && !self.is_soft_shutdown() {
            let slice = remaining.min(SLICE_US);
            std::thread::sleep(std::time::Duration::from_micros(slice));
            remaining -= slice;
        }
    }

    #[must_use]
    pub fn is_flag_set(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }

    #[must_use]
    pub fn is_check_disabled(&self, check: u64) -> bool {
        self.disable_checks & check != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunCtx {
        RunCtx::new(RunCtxConfig {
            memory_chunks_max: 2,
            buffer_size_max: 2 * MEMORY_CHUNK_SIZE,
            ..RunCtxConfig::default()
        })
    }

    #[test]
    fn endian_set_once() {
        let ctx = ctx();
        assert!(!ctx.is_big_endian());
        assert!(ctx.try_set_endian(false));
        assert!(ctx.try_set_endian(false));
        assert!(!ctx.try_set_endian(true));
        assert!(!ctx.is_big_endian());
    }

    #[test]
    fn endian_big_locks() {
        let ctx = ctx();
        assert!(ctx.try_set_endian(true));
        assert!(ctx.is_big_endian());
        assert!(!ctx.try_set_endian(false));
    }

    #[test]
    fn reads_follow_endianness() {
        let ctx = ctx();
        assert!(ctx.try_set_endian(false));
        assert_eq!(ctx.read_u32(&[0x01, 0x02, 0x03, 0x04]), 0x0403_0201);
        assert_eq!(ctx.read_u16(&[0x22, 0x11]), 0x1122);

        let big = RunCtx::new(RunCtxConfig::default());
        assert!(big.try_set_endian(true));
        assert_eq!(big.read_u32(&[0x01, 0x02, 0x03, 0x04]), 0x0102_0304);
    }

    #[test]
    fn scn_none_round_trips_through_read() {
        let ctx = ctx();
        assert!(ctx.read_scn(&u64::MAX.to_le_bytes()).is_none());
        assert_eq!(ctx.read_scn(&42u64.to_le_bytes()), Scn::new(42));
    }

    #[test]
    fn chunk_budget_is_bounded() {
        let ctx = ctx();
        assert!(ctx.try_reserve_chunk());
        assert!(ctx.try_reserve_chunk());
        assert!(!ctx.try_reserve_chunk());
        ctx.release_chunk();
        assert!(ctx.try_reserve_chunk());
    }

    #[test]
    fn shutdown_levels() {
        let ctx = ctx();
        assert!(!ctx.is_soft_shutdown());
        ctx.stop_soft();
        assert!(ctx.is_soft_shutdown());
        assert!(!ctx.is_hard_shutdown());
        ctx.stop_hard();
        assert!(ctx.is_hard_shutdown());
    }

    #[test]
    fn log_switch_budget() {
        let ctx = RunCtx::new(RunCtxConfig {
            stop_log_switches: 2,
            ..RunCtxConfig::default()
        });
        assert!(!ctx.consume_log_switch());
        assert!(ctx.consume_log_switch());
        assert!(!ctx.consume_log_switch()); // exhausted, stays at zero

        let unlimited = RunCtx::new(RunCtxConfig::default());
        assert!(!unlimited.consume_log_switch());
    }

    #[test]
    fn wakers_fire_on_shutdown() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let ctx = ctx();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);
        ctx.register_waker(Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        ctx.stop_soft();
        assert!(hits.load(Ordering::SeqCst) >= 1);
    }
}
