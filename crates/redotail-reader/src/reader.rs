//! The reader state machine.
//!
//! One reader owns one log file and the ring its verified blocks flow
//! through. The thread sits in `SLEEPING` until the replicator side requests
//! a transition:
//!
//! ```text
//!  SLEEPING ──check_redo_log──▶ CHECK  ── open + parse header ──▶ SLEEPING (ret)
//!  SLEEPING ──update_redo_log─▶ UPDATE ── reparse, reset ring ──▶ SLEEPING (ret)
//!  SLEEPING ──set_status_read─▶ READ   ── fill + verify passes ─▶ SLEEPING (ret ≠ OK)
//!  any      ──shutdown────────▶ SLEEPING, ret = SHUTDOWN
//! ```
//!
//! While in `READ` the thread alternates a fill pass (`read1`) that grows the
//! scanned range with validated blocks, and a verify pass (`read2`) that
//! graduates blocks held back by the online verify delay. Every cursor move
//! happens under the reader mutex; `buffer_start`/`buffer_end` are mirrored
//! in atomics so the consumer can sample the window without taking it.

use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use redotail_io::BlockIo;
use redotail_types::ctx::{
    RunCtx, BAD_CDC_MAX_CNT, MAX_BLOCK_SIZE, MEMORY_CHUNK_SIZE, MIN_BLOCK_SIZE,
};
use redotail_types::{Activation, Blk, FileOffset, RedoCode, Resetlogs, Scn, Seq};
use tracing::{debug, error, info, trace, warn};

use crate::block::{self, BlockValidator, RedoHeader};
use crate::metrics::GLOBAL_READER_METRICS;
use crate::ring::Ring;

/// How long a blocked wait sleeps before re-checking the shutdown flag.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// State of the reader thread as driven by the replicator side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    Sleeping,
    Check,
    Update,
    Read,
}

struct Inner {
    status: ReaderStatus,
    ret: RedoCode,
    file_name: PathBuf,
    paths: Vec<PathBuf>,
    file_size: u64,
    block_size: u32,
    sequence: Seq,
    num_blocks_header: Blk,
    first_scn: Scn,
    first_scn_header: Scn,
    next_scn: Scn,
    next_scn_header: Scn,
    next_time: u32,
    resetlogs: Resetlogs,
    activation: Activation,
    compat_vsn: u32,
    ring: Ring,
}

struct Shared {
    ctx: Arc<RunCtx>,
    database: String,
    group: u32,
    configured_block_sum: bool,
    inner: Mutex<Inner>,
    cond_buffer_full: Condvar,
    cond_reader_sleeping: Condvar,
    cond_parser_sleeping: Condvar,
    buffer_start: AtomicU64,
    buffer_end: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Broadcast all three condvars so no waiter outlives a shutdown.
    fn wake_up(&self) {
        drop(self.lock());
        self.cond_buffer_full.notify_all();
        self.cond_reader_sleeping.notify_all();
        self.cond_parser_sleeping.notify_all();
    }
}

/// Handle to one reader thread.
///
/// The replicator and the downstream consumer drive the state machine through
/// this handle; the thread itself never initiates a transition.
pub struct Reader {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Reader {
    /// Create the reader and start its thread. `group` 0 is the archived
    /// reader, anything else an online group.
    pub fn spawn(
        ctx: Arc<RunCtx>,
        database: &str,
        group: u32,
        configured_block_sum: bool,
        io: Box<dyn BlockIo>,
    ) -> Self {
        let slot_count = ctx.memory_chunks_max.max(1) as usize;
        let shared = Arc::new(Shared {
            ctx: Arc::clone(&ctx),
            database: database.to_owned(),
            group,
            configured_block_sum,
            inner: Mutex::new(Inner {
                status: ReaderStatus::Sleeping,
                ret: RedoCode::Ok,
                file_name: PathBuf::new(),
                paths: Vec::new(),
                file_size: 0,
                block_size: 0,
                sequence: Seq::ZERO,
                num_blocks_header: Blk::UNKNOWN,
                first_scn: Scn::NONE,
                first_scn_header: Scn::NONE,
                next_scn: Scn::NONE,
                next_scn_header: Scn::NONE,
                next_time: 0,
                resetlogs: Resetlogs(0),
                activation: Activation(0),
                compat_vsn: 0,
                ring: Ring::new(slot_count),
            }),
            cond_buffer_full: Condvar::new(),
            cond_reader_sleeping: Condvar::new(),
            cond_parser_sleeping: Condvar::new(),
            buffer_start: AtomicU64::new(0),
            buffer_end: AtomicU64::new(0),
        });

        let waker: Weak<Shared> = Arc::downgrade(&shared);
        ctx.register_waker(Box::new(move || {
            if let Some(shared) = waker.upgrade() {
                shared.wake_up();
            }
        }));

        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("reader-{database}-{group}"))
            .spawn(move || Worker::new(worker_shared, io).run())
            .expect("spawn reader thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    #[must_use]
    pub fn group(&self) -> u32 {
        self.shared.group
    }

    pub fn set_file_name(&self, path: &Path) {
        self.shared.lock().file_name = path.to_path_buf();
    }

    #[must_use]
    pub fn file_name(&self) -> PathBuf {
        self.shared.lock().file_name.clone()
    }

    pub fn set_paths(&self, paths: Vec<PathBuf>) {
        self.shared.lock().paths = paths;
    }

    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.shared.lock().paths.clone()
    }

    // ------------------------------------------------------------------
    // State machine requests (replicator / consumer side)
    // ------------------------------------------------------------------

    /// Open the current file and parse its header. Blocks until the reader
    /// is sleeping again; true iff the file checked out.
    pub fn check_redo_log(&self) -> bool {
        let mut inner = self.shared.lock();
        inner.status = ReaderStatus::Check;
        inner.sequence = Seq::ZERO;
        inner.first_scn = Scn::NONE;
        inner.next_scn = Scn::NONE;
        self.shared.cond_buffer_full.notify_all();
        self.shared.cond_reader_sleeping.notify_all();

        while inner.status == ReaderStatus::Check && !self.shared.ctx.is_soft_shutdown() {
            let (guard, _) = self
                .shared
                .cond_parser_sleeping
                .wait_timeout(inner, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
        inner.ret == RedoCode::Ok
    }

    /// Reparse the header of the already-open file and reset the ring.
    ///
    /// An `EMPTY` result means the online log has not grown into block 1
    /// yet; this retries internally with the configured backoff.
    pub fn update_redo_log(&self) -> bool {
        loop {
            let mut inner = self.shared.lock();
            inner.status = ReaderStatus::Update;
            self.shared.cond_buffer_full.notify_all();
            self.shared.cond_reader_sleeping.notify_all();

            while inner.status == ReaderStatus::Update && !self.shared.ctx.is_soft_shutdown() {
                let (guard, _) = self
                    .shared
                    .cond_parser_sleeping
                    .wait_timeout(inner, WAIT_SLICE)
                    .unwrap_or_else(PoisonError::into_inner);
                inner = guard;
            }

            if inner.ret == RedoCode::Empty && !self.shared.ctx.is_soft_shutdown() {
                let backoff =
                    Duration::from_micros(self.shared.ctx.tunables.redo_read_sleep_us.max(1));
                let (guard, _) = self
                    .shared
                    .cond_parser_sleeping
                    .wait_timeout(inner, backoff)
                    .unwrap_or_else(PoisonError::into_inner);
                drop(guard);
                continue;
            }

            return inner.ret == RedoCode::Ok;
        }
    }

    /// Enter the producer loop.
    pub fn set_status_read(&self) {
        let mut inner = self.shared.lock();
        inner.status = ReaderStatus::Read;
        self.shared.cond_buffer_full.notify_all();
        self.shared.cond_reader_sleeping.notify_all();
    }

    // ------------------------------------------------------------------
    // Record-stream interface (consumer side)
    // ------------------------------------------------------------------

    #[must_use]
    pub fn buffer_start(&self) -> FileOffset {
        FileOffset(self.shared.buffer_start.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn buffer_end(&self) -> FileOffset {
        FileOffset(self.shared.buffer_end.load(Ordering::Acquire))
    }

    /// Position the window, e.g. at a checkpointed file offset before READ.
    pub fn set_buffer_start_end(&self, start: FileOffset, end: FileOffset) {
        let mut inner = self.shared.lock();
        inner.ring.start = start.value();
        inner.ring.end = end.value();
        inner.ring.scan = end.value();
        self.shared
            .buffer_start
            .store(start.value(), Ordering::Release);
        self.shared.buffer_end.store(end.value(), Ordering::Release);
    }

    /// The consumer is done with everything before `offset`; free the prefix
    /// and wake the producer if it was blocked on a full ring.
    pub fn confirm_read_data(&self, offset: FileOffset) {
        let mut inner = self.shared.lock();
        if offset.value() > inner.ring.start {
            inner.ring.start = offset.value();
            self.shared
                .buffer_start
                .store(offset.value(), Ordering::Release);
            let ctx = Arc::clone(&self.shared.ctx);
            inner.ring.free_dead(&ctx);
        }
        if inner.status == ReaderStatus::Read {
            self.shared.cond_buffer_full.notify_all();
        }
    }

    /// True once the file is fully consumed: `offset` has caught up with the
    /// published end and the reader is terminal (or back asleep). Otherwise
    /// parks until the producer publishes more or goes terminal.
    pub fn check_finished(&self, offset: FileOffset) -> bool {
        let mut inner = self.shared.lock();
        if inner.ring.start < offset.value() {
            inner.ring.start = offset.value();
            self.shared
                .buffer_start
                .store(offset.value(), Ordering::Release);
            let ctx = Arc::clone(&self.shared.ctx);
            inner.ring.free_dead(&ctx);
            self.shared.cond_buffer_full.notify_all();
        }

        if offset.value() == inner.ring.end {
            if matches!(
                inner.ret,
                RedoCode::Stopped | RedoCode::Overwritten | RedoCode::Finished
            ) || inner.status == ReaderStatus::Sleeping
            {
                return true;
            }
            let (guard, _) = self
                .shared
                .cond_parser_sleeping
                .wait_timeout(inner, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner);
            drop(guard);
        }
        false
    }

    /// Copy published bytes out of the ring; clamped to the current window.
    pub fn read_published(&self, offset: FileOffset, buf: &mut [u8]) -> usize {
        self.shared.lock().ring.read_published(offset.value(), buf)
    }

    // ------------------------------------------------------------------
    // Samples of per-file state
    // ------------------------------------------------------------------

    #[must_use]
    pub fn ret(&self) -> RedoCode {
        self.shared.lock().ret
    }

    #[must_use]
    pub fn sequence(&self) -> Seq {
        self.shared.lock().sequence
    }

    #[must_use]
    pub fn first_scn(&self) -> Scn {
        self.shared.lock().first_scn
    }

    #[must_use]
    pub fn first_scn_header(&self) -> Scn {
        self.shared.lock().first_scn_header
    }

    #[must_use]
    pub fn next_scn(&self) -> Scn {
        self.shared.lock().next_scn
    }

    #[must_use]
    pub fn next_time(&self) -> u32 {
        self.shared.lock().next_time
    }

    #[must_use]
    pub fn num_blocks(&self) -> Blk {
        self.shared.lock().num_blocks_header
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.shared.lock().block_size
    }

    #[must_use]
    pub fn resetlogs(&self) -> Resetlogs {
        self.shared.lock().resetlogs
    }

    #[must_use]
    pub fn activation(&self) -> Activation {
        self.shared.lock().activation
    }

    /// Kick the thread out of whatever it is waiting on.
    pub fn wake_up(&self) {
        self.shared.wake_up();
    }

    /// Join the thread. The caller has already requested shutdown.
    pub fn shutdown_join(&mut self) {
        self.shared.wake_up();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(
                    database = %self.shared.database,
                    group = self.shared.group,
                    "reader thread panicked"
                );
            }
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if self.thread.is_some() && self.shared.ctx.is_soft_shutdown() {
            self.shutdown_join();
        }
        // Without a shutdown request the thread keeps running detached; the
        // pipeline owns the shutdown ordering.
    }
}

// ----------------------------------------------------------------------
// Producer thread
// ----------------------------------------------------------------------

struct Worker {
    shared: Arc<Shared>,
    io: Box<dyn BlockIo>,
    scratch: Vec<u8>,
    header_buf: Vec<u8>,
    epoch: Instant,
    copy_file: Option<std::fs::File>,
    copy_sequence: Seq,
    copy_name: PathBuf,
    last_read: u32,
    last_read_time: u64,
    read_time: u64,
    loop_time: u64,
    read_blocks: bool,
    reached_zero: bool,
}

impl Worker {
    fn new(shared: Arc<Shared>, io: Box<dyn BlockIo>) -> Self {
        Self {
            shared,
            io,
            scratch: vec![0u8; MEMORY_CHUNK_SIZE as usize],
            header_buf: vec![0u8; 2 * MAX_BLOCK_SIZE as usize],
            epoch: Instant::now(),
            copy_file: None,
            copy_sequence: Seq::ZERO,
            copy_name: PathBuf::new(),
            last_read: 0,
            last_read_time: 0,
            read_time: 0,
            loop_time: 0,
            read_blocks: false,
            reached_zero: false,
        }
    }

    fn ctx(&self) -> &RunCtx {
        &self.shared.ctx
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.lock()
    }

    fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn run(mut self) {
        trace!(database = %self.shared.database, group = self.shared.group, "reader start");

        loop {
            {
                let mut inner = self.lock();
                self.shared.cond_parser_sleeping.notify_all();
                while inner.status == ReaderStatus::Sleeping && !self.ctx().is_soft_shutdown() {
                    let (guard, _) = self
                        .shared
                        .cond_reader_sleeping
                        .wait_timeout(inner, WAIT_SLICE)
                        .unwrap_or_else(PoisonError::into_inner);
                    inner = guard;
                }
            }
            if self.ctx().is_soft_shutdown() {
                break;
            }

            let status = self.lock().status;
            match status {
                ReaderStatus::Check => self.handle_check(),
                ReaderStatus::Update => self.handle_update(),
                ReaderStatus::Read => self.read_loop(),
                ReaderStatus::Sleeping => {}
            }
        }

        {
            let mut inner = self.lock();
            inner.ret = RedoCode::Shutdown;
            inner.status = ReaderStatus::Sleeping;
        }
        self.shared.cond_buffer_full.notify_all();
        self.shared.cond_reader_sleeping.notify_all();
        self.shared.cond_parser_sleeping.notify_all();

        self.io.close();
        self.copy_file = None;
        trace!(database = %self.shared.database, group = self.shared.group, "reader stop");
    }

    fn go_sleeping(&self, ret: RedoCode) {
        let mut inner = self.lock();
        inner.ret = ret;
        inner.status = ReaderStatus::Sleeping;
        self.shared.cond_parser_sleeping.notify_all();
    }

    fn set_ret(&self, ret: RedoCode) {
        self.lock().ret = ret;
    }

    // --------------------------------------------------------------
    // CHECK / UPDATE
    // --------------------------------------------------------------

    fn handle_check(&mut self) {
        let path = self.lock().file_name.clone();
        trace!(path = %path.display(), "trying to open");
        self.io.close();
        let ret = match self.io.open(&path) {
            Ok(size) => {
                self.lock().file_size = size;
                self.reload_header()
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "open failed");
                RedoCode::ErrorRead
            }
        };
        self.go_sleeping(ret);
    }

    fn handle_update(&mut self) {
        self.copy_file = None;
        let ret = self.reload_header();
        if ret == RedoCode::Ok {
            let mut inner = self.lock();
            let base = u64::from(inner.block_size) * 2;
            inner.ring.reset(base);
            self.shared.buffer_start.store(base, Ordering::Release);
            self.shared.buffer_end.store(base, Ordering::Release);
            let ctx = Arc::clone(&self.shared.ctx);
            inner.ring.free_all(&ctx);
        }
        self.go_sleeping(ret);
    }

    // --------------------------------------------------------------
    // Header parsing
    // --------------------------------------------------------------

    /// Read the two header blocks and refresh every header-derived field.
    fn reload_header(&mut self) -> RedoCode {
        let ctx = Arc::clone(&self.shared.ctx);
        if ctx.is_soft_shutdown() {
            return RedoCode::Error;
        }

        let (path, known_block_size, status, sequence, first_scn, next_scn) = {
            let inner = self.lock();
            (
                inner.file_name.clone(),
                inner.block_size,
                inner.status,
                inner.sequence,
                inner.first_scn,
                inner.next_scn,
            )
        };

        let want = if known_block_size > 0 {
            2 * known_block_size as usize
        } else {
            2 * MAX_BLOCK_SIZE as usize
        };

        let mut crc_retries = 0u32;
        loop {
            let actual = match self.io.read_at(&mut self.header_buf[..want], 0) {
                Ok(n) => n,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "header read failed");
                    return RedoCode::ErrorRead;
                }
            };
            if actual < MIN_BLOCK_SIZE as usize {
                error!(path = %path.display(), actual, "header shorter than one block");
                return RedoCode::ErrorRead;
            }
            GLOBAL_READER_METRICS.record_bytes_read(actual as u64);

            // Block 0: magic, byte order, block size.
            if self.header_buf[0] != 0 {
                error!(
                    path = %path.display(),
                    byte0 = self.header_buf[0],
                    "invalid header magic"
                );
                return RedoCode::ErrorBadData;
            }
            let endian = &self.header_buf[block::B0_ENDIAN..block::B0_ENDIAN + 4];
            let big = match endian {
                [0x7A, 0x7B, 0x7C, 0x7D] => true,
                [0x7D, 0x7C, 0x7B, 0x7A] => false,
                _ => {
                    error!(path = %path.display(), signature = ?endian, "invalid byte-order signature");
                    return RedoCode::ErrorBadData;
                }
            };
            if !ctx.try_set_endian(big) {
                error!(
                    path = %path.display(),
                    "byte order differs from the one locked in at startup"
                );
                return RedoCode::ErrorBadData;
            }

            let block_size = ctx.read_u32(&self.header_buf[block::B0_BLOCK_SIZE..]);
            match block::marker_for_block_size(block_size) {
                Some(marker) if marker == self.header_buf[1] => {}
                _ => {
                    error!(
                        path = %path.display(),
                        block_size,
                        marker = self.header_buf[1],
                        "invalid block size"
                    );
                    return RedoCode::ErrorBadData;
                }
            }
            let two_blocks = 2 * block_size as usize;
            if actual < two_blocks {
                error!(path = %path.display(), actual, block_size, "header truncated");
                return RedoCode::ErrorRead;
            }

            if ctx.redo_copy_path.is_some() {
                let header_copy = self.header_buf[..two_blocks].to_vec();
                if let Err(code) = self.copy_header(&header_copy, block_size) {
                    return code;
                }
            }

            let block1 = &self.header_buf[block_size as usize..two_blocks];
            let parsed = RedoHeader::parse(&ctx, block1);
            if parsed.compat_vsn == 0 {
                return RedoCode::Empty;
            }
            if !block::version_supported(parsed.compat_vsn) {
                error!(
                    path = %path.display(),
                    compat_vsn = format_args!("{:#010x}", parsed.compat_vsn),
                    "invalid database version"
                );
                return RedoCode::ErrorBadData;
            }

            if ctx.signature().is_none() {
                ctx.set_signature(redotail_types::ctx::DbSignature {
                    compat_vsn: parsed.compat_vsn,
                    version: block::version_string(parsed.compat_vsn),
                    sid: parsed.sid.clone(),
                });
                debug!(
                    path = %path.display(),
                    compat_vsn = format_args!("{:#010x}", parsed.compat_vsn),
                    dbid = parsed.dbid,
                    sid = %parsed.sid,
                    activation = %parsed.activation,
                    resetlogs = %parsed.resetlogs,
                    first_scn = %parsed.first_scn,
                    next_scn = %parsed.next_scn,
                    num_blocks = %parsed.num_blocks,
                    misc_flags = format_args!("{:#010x}", parsed.misc_flags),
                    "redo header"
                );
            }
            if let Some(signature) = ctx.signature() {
                if signature.compat_vsn != parsed.compat_vsn {
                    error!(
                        path = %path.display(),
                        found = format_args!("{:#010x}", parsed.compat_vsn),
                        expected = format_args!("{:#010x}", signature.compat_vsn),
                        "database version changed between files"
                    );
                    return RedoCode::ErrorBadData;
                }
            }

            // Validate block 1 itself; a checksum failure on a live header
            // is retried after a fresh read.
            let mut validator = BlockValidator::new(
                &ctx,
                &path,
                block_size,
                self.shared.group,
                status == ReaderStatus::Update,
                sequence,
                self.shared.configured_block_sum,
            );
            let check = validator.check(block1, Blk::new(1), false);
            if check == RedoCode::ErrorCrc {
                crc_retries += 1;
                GLOBAL_READER_METRICS.record_crc_retry();
                if crc_retries == BAD_CDC_MAX_CNT {
                    return RedoCode::ErrorBadData;
                }
                ctx.interruptible_sleep(ctx.tunables.redo_read_sleep_us);
                if ctx.is_soft_shutdown() {
                    return RedoCode::Error;
                }
                continue;
            }
            if check != RedoCode::Ok {
                return check;
            }

            // Commit the parsed fields.
            let mut inner = self.lock();
            inner.block_size = block_size;
            inner.compat_vsn = parsed.compat_vsn;
            inner.activation = parsed.activation;
            inner.num_blocks_header = parsed.num_blocks;
            inner.resetlogs = parsed.resetlogs;
            inner.first_scn_header = parsed.first_scn;
            inner.next_scn_header = parsed.next_scn;
            inner.next_time = parsed.next_time;
            inner.sequence = validator.sequence;

            // Archived files can carry trailing garbage past the declared
            // length; trust the header.
            if self.shared.group == 0
                && !parsed.num_blocks.is_unknown()
                && inner.file_size > u64::from(parsed.num_blocks.value()) * u64::from(block_size)
            {
                inner.file_size = u64::from(parsed.num_blocks.value()) * u64::from(block_size);
                info!(
                    path = %path.display(),
                    file_size = inner.file_size,
                    "updating redo log size from header"
                );
            }

            if first_scn.is_none() || status == ReaderStatus::Update {
                inner.first_scn = parsed.first_scn;
                inner.next_scn = parsed.next_scn;
            } else {
                if parsed.first_scn != first_scn {
                    error!(
                        path = %path.display(),
                        found = %parsed.first_scn,
                        expected = %first_scn,
                        "invalid first scn value"
                    );
                    return RedoCode::ErrorBadData;
                }
                if next_scn.is_none() && !parsed.next_scn.is_none() {
                    trace!(path = %path.display(), next_scn = %parsed.next_scn, "next scn learned");
                    inner.next_scn = parsed.next_scn;
                } else if !next_scn.is_none()
                    && !parsed.next_scn.is_none()
                    && next_scn != parsed.next_scn
                {
                    error!(
                        path = %path.display(),
                        found = %parsed.next_scn,
                        expected = %next_scn,
                        "invalid next scn value"
                    );
                    return RedoCode::ErrorBadData;
                }
            }

            return RedoCode::Ok;
        }
    }

    // --------------------------------------------------------------
    // Redo-copy tee
    // --------------------------------------------------------------

    fn copy_header(&mut self, header: &[u8], block_size: u32) -> Result<(), RedoCode> {
        let ctx = Arc::clone(&self.shared.ctx);
        let Some(dir) = ctx.redo_copy_path.as_ref() else {
            return Ok(());
        };
        let sequence_header = Seq(ctx.read_u32(&header[block_size as usize + block::B1_SEQUENCE..]));
        if self.copy_sequence != sequence_header {
            self.copy_file = None;
        }
        if self.copy_file.is_none() {
            let name = dir.join(format!("{}_{}.arc", self.shared.database, sequence_header));
            match std::fs::File::create(&name) {
                Ok(file) => {
                    info!(path = %name.display(), "writing redo log copy");
                    self.copy_file = Some(file);
                    self.copy_sequence = sequence_header;
                    self.copy_name = name;
                }
                Err(err) => {
                    error!(path = %name.display(), error = %err, "redo copy open failed");
                    return Err(RedoCode::ErrorWrite);
                }
            }
        }
        self.copy_write(0, header)
            .then_some(())
            .ok_or(RedoCode::ErrorWrite)
    }

    fn copy_write(&mut self, offset: u64, data: &[u8]) -> bool {
        let Some(file) = self.copy_file.as_ref() else {
            return true;
        };
        match file.write_at(data, offset) {
            Ok(written) if written == data.len() => true,
            Ok(written) => {
                error!(
                    path = %self.copy_name.display(),
                    written,
                    expected = data.len(),
                    "short redo copy write"
                );
                false
            }
            Err(err) => {
                error!(path = %self.copy_name.display(), error = %err, "redo copy write failed");
                false
            }
        }
    }

    // --------------------------------------------------------------
    // READ: the producer loop
    // --------------------------------------------------------------

    fn finish_or_stop(&self, inner: &mut Inner) {
        if !inner.next_scn_header.is_none() {
            inner.ret = RedoCode::Finished;
            inner.next_scn = inner.next_scn_header;
            GLOBAL_READER_METRICS.record_file_finished();
        } else {
            warn!(
                path = %inner.file_name.display(),
                position = inner.ring.scan,
                "unexpected end of file"
            );
            inner.ret = RedoCode::Stopped;
        }
    }

    fn read_loop(&mut self) {
        let block_size = {
            let mut inner = self.lock();
            inner.ring.scan = inner.ring.end;
            trace!(
                path = %inner.file_name.display(),
                start = inner.ring.start,
                end = inner.ring.end,
                file_size = inner.file_size,
                "read loop entered"
            );
            inner.block_size
        };
        if block_size == 0 {
            self.go_sleeping(RedoCode::Error);
            return;
        }
        self.last_read = block_size;
        self.last_read_time = 0;
        self.read_time = 0;
        self.reached_zero = false;

        let ctx = Arc::clone(&self.shared.ctx);
        while !ctx.is_soft_shutdown() {
            self.loop_time = self.now_us();
            self.read_blocks = false;
            self.read_time = 0;

            // End of file, ring-full wait, and a snapshot for the passes.
            let (scan, end, file_size, num_blocks) = {
                let mut inner = self.lock();
                if inner.status != ReaderStatus::Read {
                    break;
                }
                if inner.ring.end == inner.file_size {
                    self.finish_or_stop(&mut inner);
                    break;
                }
                if inner.ring.start + ctx.buffer_size_max == inner.ring.end {
                    if !ctx.is_soft_shutdown() {
                        let (guard, _) = self
                            .shared
                            .cond_buffer_full
                            .wait_timeout(inner, WAIT_SLICE)
                            .unwrap_or_else(PoisonError::into_inner);
                        drop(guard);
                    }
                    continue;
                }
                (
                    inner.ring.scan,
                    inner.ring.end,
                    inner.file_size,
                    inner.num_blocks_header,
                )
            };

            // Verify pass over held blocks.
            if end < scan && !self.read2(block_size) {
                break;
            }

            // Fill pass.
            let scan = self.lock().ring.scan;
            let room = scan % MEMORY_CHUNK_SIZE > 0 || ctx.chunks_free() > 0;
            let poll_due = !self.reached_zero
                || self.last_read_time + ctx.tunables.redo_read_sleep_us < self.loop_time;
            if scan < file_size && room && poll_due && !self.read1(block_size) {
                break;
            }

            // Declared length reached.
            if !num_blocks.is_unknown() {
                let declared = u64::from(num_blocks.value()) * u64::from(block_size);
                let mut inner = self.lock();
                if inner.ring.end == declared {
                    self.finish_or_stop(&mut inner);
                    break;
                }
            }

            if !self.read_blocks {
                if self.read_time == 0 {
                    ctx.interruptible_sleep(ctx.tunables.redo_read_sleep_us);
                } else {
                    let now = self.now_us();
                    if self.read_time > now {
                        let wait = (self.read_time - now).min(ctx.tunables.redo_read_sleep_us);
                        ctx.interruptible_sleep(wait);
                    }
                }
            }
        }

        let mut inner = self.lock();
        inner.status = ReaderStatus::Sleeping;
        self.shared.cond_parser_sleeping.notify_all();
    }

    fn read_size(&self, prev: u32, block_size: u32) -> u32 {
        if prev < block_size {
            block_size
        } else {
            (prev * 2).min(MEMORY_CHUNK_SIZE as u32)
        }
    }

    /// Fill pass: read ahead of the scan cursor, validate, then publish
    /// directly or hold under the verify delay.
    fn read1(&mut self, block_size: u32) -> bool {
        let ctx = Arc::clone(&self.shared.ctx);
        let verify_delay = ctx.tunables.redo_verify_delay_us;
        let group = self.shared.group;

        let (scan, start, end, file_size, sequence, path) = {
            let inner = self.lock();
            (
                inner.ring.scan,
                inner.ring.start,
                inner.ring.end,
                inner.file_size,
                inner.sequence,
                inner.file_name.clone(),
            )
        };

        let mut to_read = u64::from(self.read_size(self.last_read, block_size));
        if scan + to_read > file_size {
            to_read = file_size - scan;
        }
        let pos_in_chunk = scan % MEMORY_CHUNK_SIZE;
        if pos_in_chunk + to_read > MEMORY_CHUNK_SIZE {
            to_read = MEMORY_CHUNK_SIZE - pos_in_chunk;
        }
        if to_read == 0 {
            error!(
                path = %path.display(),
                start, end, scan,
                "zero to read"
            );
            self.set_ret(RedoCode::Error);
            return false;
        }

        {
            let mut inner = self.lock();
            if !inner.ring.ensure_chunk(&ctx, scan) {
                return true; // budget dry; wait for the consumer
            }
        }

        trace!(path = %path.display(), start, end, scan, bytes = to_read, "fill pass read");
        let actual = match self.io.read_at(&mut self.scratch[..to_read as usize], scan) {
            Ok(n) => n,
            Err(err) => {
                error!(path = %path.display(), error = %err, "read failed");
                self.set_ret(RedoCode::ErrorRead);
                return false;
            }
        };
        GLOBAL_READER_METRICS.record_bytes_read(actual as u64);

        if actual > 0 && self.copy_file.is_some() && (verify_delay == 0 || group == 0) {
            let data = self.scratch[..actual].to_vec();
            if !self.copy_write(scan, &data) {
                self.set_ret(RedoCode::ErrorWrite);
                return false;
            }
        }

        let max_blocks = actual as u32 / block_size;
        let scan_block = (scan / u64::from(block_size)) as u32;
        let mut validator = BlockValidator::new(
            &ctx,
            &path,
            block_size,
            group,
            false,
            sequence,
            self.shared.configured_block_sum,
        );
        let mut good_blocks = 0u32;
        let mut current = RedoCode::Ok;
        for index in 0..max_blocks {
            let offset = (index * block_size) as usize;
            current = validator.check(
                &self.scratch[offset..offset + block_size as usize],
                Blk::new(scan_block + index),
                verify_delay == 0 || group == 0,
            );
            if current != RedoCode::Ok {
                break;
            }
            good_blocks += 1;
        }
        let adopted = validator.sequence;
        self.lock().sequence = adopted;

        // An archived file that produced nothing here has simply ended.
        if good_blocks == 0 && group == 0 {
            let mut inner = self.lock();
            self.finish_or_stop(&mut inner);
            return false;
        }

        // A failing checksum on a block the database is still writing looks
        // like corruption but is just an incomplete write; the verify pass
        // will re-read it.
        if current == RedoCode::ErrorCrc && verify_delay > 0 && group != 0 {
            current = RedoCode::Empty;
        }

        if good_blocks == 0 && current != RedoCode::Ok && current != RedoCode::Empty {
            if current == RedoCode::Overwritten {
                GLOBAL_READER_METRICS.record_overwrite();
            }
            self.set_ret(current);
            return false;
        }

        if good_blocks == 0 && current == RedoCode::Empty {
            // A log switch may have rewritten block 0 under us.
            let reload = self.reload_header();
            if reload != RedoCode::Ok {
                self.set_ret(reload);
                return false;
            }
            self.reached_zero = true;
        } else {
            self.read_blocks = true;
            self.reached_zero = false;
        }

        self.last_read = good_blocks * block_size;
        self.last_read_time = self.now_us();

        if good_blocks > 0 {
            let bytes = (good_blocks * block_size) as usize;
            let mut inner = self.lock();
            inner.ring.write(scan, &self.scratch[..bytes]);
            if verify_delay > 0 && group != 0 {
                // Hold: stamp each block with its read time and let the
                // verify pass publish it later.
                inner.ring.scan += bytes as u64;
                for index in 0..good_blocks {
                    let offset = scan + u64::from(index) * u64::from(block_size);
                    inner.ring.write_stamp(offset, self.last_read_time);
                }
            } else {
                inner.ring.end += bytes as u64;
                inner.ring.scan = inner.ring.end;
                self.shared
                    .buffer_end
                    .store(inner.ring.end, Ordering::Release);
                GLOBAL_READER_METRICS.record_blocks_published(u64::from(good_blocks));
                self.shared.cond_parser_sleeping.notify_all();
            }
        }

        if current == RedoCode::ErrorSequence && group == 0 {
            let mut inner = self.lock();
            self.finish_or_stop(&mut inner);
            return false;
        }

        true
    }

    /// Verify pass: graduate held blocks whose delay expired, re-reading
    /// them in place to catch mid-flight mutation.
    fn read2(&mut self, block_size: u32) -> bool {
        let ctx = Arc::clone(&self.shared.ctx);
        let verify_delay = ctx.tunables.redo_verify_delay_us;
        let group = self.shared.group;

        let (end, scan, start, sequence, path) = {
            let inner = self.lock();
            (
                inner.ring.end,
                inner.ring.scan,
                inner.ring.start,
                inner.sequence,
                inner.file_name.clone(),
            )
        };

        let held_blocks = ((scan - end) / u64::from(block_size)) as u32;
        let held_blocks = held_blocks.min((MEMORY_CHUNK_SIZE / u64::from(block_size)) as u32);
        let mut expired = 0u32;
        let mut next_due = None;
        {
            let inner = self.lock();
            for index in 0..held_blocks {
                let offset = end + u64::from(index) * u64::from(block_size);
                let stamp = inner.ring.read_stamp(offset);
                if stamp + verify_delay < self.loop_time {
                    expired += 1;
                } else {
                    next_due = Some(stamp + verify_delay);
                    break;
                }
            }
        }
        if let Some(due) = next_due {
            self.read_time = due;
        }
        if expired == 0 {
            return true;
        }

        let held_bytes = expired * block_size;
        let mut to_read = u64::from(self.read_size(held_bytes, block_size).min(held_bytes));
        let pos_in_chunk = end % MEMORY_CHUNK_SIZE;
        if pos_in_chunk + to_read > MEMORY_CHUNK_SIZE {
            to_read = MEMORY_CHUNK_SIZE - pos_in_chunk;
        }
        if to_read == 0 {
            error!(path = %path.display(), start, end, scan, "zero to read");
            self.set_ret(RedoCode::Error);
            return false;
        }

        trace!(path = %path.display(), start, end, scan, bytes = to_read, "verify pass read");
        let actual = match self.io.read_at(&mut self.scratch[..to_read as usize], end) {
            Ok(n) => n,
            Err(err) => {
                error!(path = %path.display(), error = %err, "read failed");
                self.set_ret(RedoCode::ErrorRead);
                return false;
            }
        };
        GLOBAL_READER_METRICS.record_bytes_read(actual as u64);

        if actual > 0 && self.copy_file.is_some() {
            let data = self.scratch[..actual].to_vec();
            if !self.copy_write(end, &data) {
                self.set_ret(RedoCode::ErrorWrite);
                return false;
            }
        }

        self.read_blocks = true;
        let verified_blocks = actual as u32 / block_size;
        let end_block = (end / u64::from(block_size)) as u32;
        let mut validator = BlockValidator::new(
            &ctx,
            &path,
            block_size,
            group,
            false,
            sequence,
            self.shared.configured_block_sum,
        );
        let mut current = RedoCode::Ok;
        for index in 0..verified_blocks {
            let offset = (index * block_size) as usize;
            current = validator.check(
                &self.scratch[offset..offset + block_size as usize],
                Blk::new(end_block + index),
                true,
            );
            if current != RedoCode::Ok {
                break;
            }
        }

        // The running log's header advances while we read; keep next-scn and
        // the declared length current. Archived files are immutable, so the
        // reload is online-only.
        if current == RedoCode::Ok && group > 0 {
            current = self.reload_header();
        }

        if current != RedoCode::Ok {
            if current == RedoCode::Overwritten {
                GLOBAL_READER_METRICS.record_overwrite();
            }
            self.set_ret(current);
            return false;
        }

        let publish = (verified_blocks * block_size) as usize;
        let mut inner = self.lock();
        inner.ring.write(end, &self.scratch[..publish]);
        inner.ring.end += publish as u64;
        self.shared
            .buffer_end
            .store(inner.ring.end, Ordering::Release);
        GLOBAL_READER_METRICS.record_blocks_published(u64::from(verified_blocks));
        self.shared.cond_parser_sleeping.notify_all();

        true
    }
}
