//! The replication control loop.
//!
//! One replicator drives the reader fleet for one source database. Its run
//! loop alternates between draining archived logs in ascending sequence and
//! following the online groups, advancing the checkpointed sequence exactly
//! once per finished file, falling back from online to archived when a log
//! is overwritten, and following resetlogs branches through the incarnation
//! forest.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use redotail_error::{RedotailError, Result};
use redotail_io::{create_backend, BackendSpec, FileBlockIo};
use redotail_reader::Reader;
use redotail_types::ctx::{RunCtx, FLAG_ARCH_ONLY, FLAG_SCHEMALESS};
use redotail_types::{FileOffset, RedoCode, Seq};
use tracing::{debug, info, trace, warn};

use crate::archive::{ArchiveDiscovery, ArchiveQueue, DiscoveryMode, PathMapping};
use crate::config::{ReaderType, SourceConfig};
use crate::metadata::{Metadata, MetadataStatus};
use crate::stream::RecordStream;

/// Control loop for one source database.
pub struct Replicator {
    ctx: Arc<RunCtx>,
    metadata: Arc<Metadata>,
    database: String,
    backend: BackendSpec,
    reader_type: ReaderType,
    configured_block_sum: bool,
    boot_failsafe: bool,
    start_sequence: Option<Seq>,
    mapping: PathMapping,
    discovery: ArchiveDiscovery,
    queue: ArchiveQueue,
    online_groups: Vec<(u32, Vec<PathBuf>)>,
    arch_reader: Option<Reader>,
    online_readers: Vec<Reader>,
}

impl Replicator {
    #[must_use]
    pub fn new(ctx: Arc<RunCtx>, metadata: Arc<Metadata>, source: &SourceConfig) -> Self {
        let mapping = PathMapping::new(source.mapping_rules());
        let mode = match source.reader.reader_type {
            ReaderType::Batch => DiscoveryMode::Batch(source.redo_log_batch.clone()),
            ReaderType::Online => DiscoveryMode::RecoveryDest,
        };
        let discovery = ArchiveDiscovery::new(
            mode,
            metadata.facts.log_archive_format.clone(),
            mapping.clone(),
            PathBuf::from(&metadata.facts.db_recovery_file_dest),
            metadata.facts.db_context.clone(),
        );
        let checksum_setting = metadata.facts.db_block_checksum.to_uppercase();
        let configured_block_sum = checksum_setting != "OFF" && checksum_setting != "FALSE";

        Self {
            ctx,
            metadata,
            database: source.name.clone(),
            backend: source.backend_spec(),
            reader_type: source.reader.reader_type,
            configured_block_sum,
            boot_failsafe: source.boot_failsafe,
            start_sequence: source.start_sequence.map(Seq::new),
            mapping,
            discovery,
            queue: ArchiveQueue::new(),
            online_groups: source
                .online_redo_logs
                .iter()
                .map(|group| (group.group, group.paths.clone()))
                .collect(),
            arch_reader: None,
            online_readers: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Hooks kept for the standby / role-switch variants
    // ------------------------------------------------------------------

    fn continue_with_online(&self) -> bool {
        true
    }

    fn go_standby(&mut self) {}

    // ------------------------------------------------------------------
    // Boot
    // ------------------------------------------------------------------

    fn load_database_metadata(&mut self) {
        if self.arch_reader.is_none() {
            let io = create_backend(&self.backend, Arc::clone(&self.ctx));
            self.arch_reader = Some(Reader::spawn(
                Arc::clone(&self.ctx),
                &self.database,
                0,
                self.configured_block_sum,
                io,
            ));
        }
    }

    fn position_reader(&self) {
        if let Some(start) = self.start_sequence {
            self.metadata.set_seq_file_offset(start, FileOffset::ZERO);
        } else if self.reader_type == ReaderType::Batch {
            // Batch sources adopt the oldest discovered file.
            self.metadata.set_seq_file_offset(Seq::ZERO, FileOffset::ZERO);
        }
        // An online source with no hint and no checkpoint stays
        // unpositioned: resolving "NOW" to a sequence is the job of the
        // metadata bootstrap outside this core.
    }

    fn print_start_msg(&self) {
        let starting = match self.start_sequence {
            Some(sequence) => format!("seq: {sequence}"),
            None => "NOW".to_owned(),
        };
        info!(
            database = %self.database,
            flags = self.ctx.flags,
            starting = %starting,
            "replicator is starting"
        );
    }

    fn boot(&mut self) -> Result<()> {
        self.print_start_msg();
        if self.metadata.resetlogs().0 != 0 {
            info!(resetlogs = %self.metadata.resetlogs(), "current resetlogs");
        }

        if !self.metadata.is_positioned() {
            self.position_reader();
        }

        if self.ctx.is_flag_set(FLAG_SCHEMALESS) {
            self.metadata.allow_checkpoints();
        } else {
            return Err(RedotailError::SchemaMissing);
        }

        if !self.metadata.is_positioned() {
            return Err(RedotailError::StartSequenceUnknown);
        }

        info!(
            sequence = %self.metadata.sequence(),
            offset = %self.metadata.file_offset(),
            "starting position"
        );

        if !self.configured_block_sum
            && !self
                .ctx
                .is_check_disabled(redotail_types::ctx::DISABLE_CHECKS_BLOCK_SUM)
        {
            warn!(
                "DB_BLOCK_CHECKSUM is off on the database; set it to TYPICAL or disable \
                 consistency checking with disable-checks bit 0"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Online reader fleet
    // ------------------------------------------------------------------

    fn ensure_online_reader(&mut self, group: u32) -> usize {
        if let Some(index) = self
            .online_readers
            .iter()
            .position(|reader| reader.group() == group)
        {
            return index;
        }
        // Online members must observe growth, so they always use the local
        // file backend; append-closed mirrors are archived-only.
        self.online_readers.push(Reader::spawn(
            Arc::clone(&self.ctx),
            &self.database,
            group,
            self.configured_block_sum,
            Box::new(FileBlockIo::new()),
        ));
        self.online_readers.len() - 1
    }

    /// Re-enumerate the online groups and re-probe their members.
    fn update_online_redo_log_data(&mut self) -> Result<()> {
        let groups = self.online_groups.clone();
        for (group, paths) in groups {
            let mapped: Vec<PathBuf> = paths.iter().map(|path| self.mapping.apply(path)).collect();
            let index = self.ensure_online_reader(group);
            self.online_readers[index].set_paths(mapped);
        }
        self.check_online_redo_logs()
    }

    /// Try each member of every group until one opens; a group with no
    /// readable member is fatal.
    fn check_online_redo_logs(&mut self) -> Result<()> {
        for reader in &self.online_readers {
            let mut found = false;
            for path in reader.paths() {
                reader.set_file_name(&path);
                if reader.check_redo_log() {
                    info!(path = %path.display(), group = reader.group(), "online redo log");
                    found = true;
                    break;
                }
                if self.ctx.is_soft_shutdown() {
                    return Ok(());
                }
            }
            if !found {
                for path in reader.paths() {
                    warn!(
                        path = %path.display(),
                        group = reader.group(),
                        "can't read online log member"
                    );
                }
                return Err(RedotailError::GroupUnreadable {
                    group: reader.group(),
                });
            }
        }
        Ok(())
    }

    /// Refresh every online reader's view of its (possibly switched) file.
    fn update_online_logs(&mut self) -> Result<()> {
        for reader in &self.online_readers {
            if self.ctx.is_soft_shutdown() {
                return Ok(());
            }
            if !reader.update_redo_log() {
                return Err(RedotailError::OnlineUpdateFailed {
                    path: reader.file_name(),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Archived drain
    // ------------------------------------------------------------------

    /// Drain the archive queue in ascending sequence. Returns whether any
    /// file was handed to the record stream.
    pub fn process_archived_redo_logs(&mut self) -> Result<bool> {
        let mut logs_processed = false;

        while !self.ctx.is_soft_shutdown() {
            trace!(sequence = %self.metadata.sequence(), "checking archived redo logs");
            self.metadata.update_resetlogs()?;
            self.discovery
                .discover(self.metadata.sequence(), &mut self.queue)?;

            if self.queue.is_empty() {
                if self.ctx.is_flag_set(FLAG_ARCH_ONLY) {
                    trace!(
                        sequence = %self.metadata.sequence(),
                        "archived redo log missing, sleeping"
                    );
                    self.ctx
                        .interruptible_sleep(self.ctx.tunables.arch_read_sleep_us);
                } else {
                    break;
                }
            }

            while !self.ctx.is_soft_shutdown() {
                let Some((head_sequence, head_path)) = self
                    .queue
                    .peek()
                    .map(|candidate| (candidate.sequence, candidate.path.clone()))
                else {
                    break;
                };
                trace!(path = %head_path.display(), sequence = %head_sequence, "queue head");

                // No position yet: the oldest discovered file sets it.
                if self.metadata.sequence().is_zero() {
                    self.metadata
                        .set_seq_file_offset(head_sequence, FileOffset::ZERO);
                }

                if head_sequence < self.metadata.sequence() {
                    self.queue.pop();
                    continue;
                }

                if head_sequence > self.metadata.sequence() {
                    warn!(
                        wanted = %self.metadata.sequence(),
                        found = %head_sequence,
                        sleep_us = self.ctx.tunables.arch_read_sleep_us,
                        "couldn't find archive log for sequence"
                    );
                    self.ctx
                        .interruptible_sleep(self.ctx.tunables.arch_read_sleep_us);
                    if self.ctx.is_soft_shutdown() {
                        break;
                    }
                    self.queue.clear();
                    self.discovery
                        .discover(self.metadata.sequence(), &mut self.queue)?;
                    continue;
                }

                let candidate = self.queue.pop().expect("head just peeked");
                logs_processed = true;

                let reader = self.arch_reader.as_ref().expect("archive reader exists");
                reader.set_file_name(&candidate.path);

                // The archiver may still be closing the file; give it a
                // bounded number of chances.
                let mut retry = self.ctx.tunables.arch_read_tries;
                loop {
                    if reader.check_redo_log() && reader.update_redo_log() {
                        break;
                    }
                    if self.ctx.is_soft_shutdown() {
                        return Ok(logs_processed);
                    }
                    if retry == 0 {
                        return Err(RedotailError::ArchiveOpenExhausted {
                            path: candidate.path.clone(),
                            tries: self.ctx.tunables.arch_read_tries,
                        });
                    }
                    info!(
                        path = %candidate.path.display(),
                        sleep_us = self.ctx.tunables.arch_read_sleep_us,
                        "archived redo log is not ready for read, sleeping"
                    );
                    self.ctx
                        .interruptible_sleep(self.ctx.tunables.arch_read_sleep_us);
                    retry -= 1;
                }

                let ret = RecordStream::new(&self.ctx, &self.metadata).process(reader);
                self.metadata
                    .set_first_next_scn(reader.first_scn(), reader.next_scn());

                if self.ctx.is_soft_shutdown() {
                    break;
                }

                match ret {
                    RedoCode::Finished => {
                        self.metadata.set_next_sequence();
                        if self.ctx.consume_log_switch() {
                            info!("shutdown started - exhausted number of log switches");
                            self.ctx.stop_soft();
                        }
                    }
                    RedoCode::Stopped => break,
                    code => return Err(RedotailError::ArchiveProcessing { code }),
                }
            }

            if !logs_processed {
                break;
            }
        }

        Ok(logs_processed)
    }

    // ------------------------------------------------------------------
    // Online follow
    // ------------------------------------------------------------------

    /// Follow the online groups while one of them carries the current
    /// sequence. Returns whether any file was handed to the record stream.
    pub fn process_online_redo_logs(&mut self) -> Result<bool> {
        let mut logs_processed = false;

        trace!(sequence = %self.metadata.sequence(), "checking online redo logs");
        self.metadata.update_resetlogs()?;
        self.update_online_logs()?;

        while !self.ctx.is_soft_shutdown() {
            let begin = Instant::now();
            let mut chosen: Option<usize> = None;

            // Selection: the reader holding the current sequence with room
            // left to read. A reader already past it means the switch
            // happened and the tail is only in the archive.
            loop {
                if self.ctx.is_soft_shutdown() {
                    break;
                }
                let mut higher = false;
                for (index, reader) in self.online_readers.iter().enumerate() {
                    let sequence = reader.sequence();
                    if sequence > self.metadata.sequence() {
                        higher = true;
                    }
                    if sequence == self.metadata.sequence() {
                        let num_blocks = reader.num_blocks();
                        let within = num_blocks.is_unknown()
                            || self.metadata.file_offset()
                                < FileOffset::from_blocks(num_blocks, reader.block_size());
                        if within {
                            chosen = Some(index);
                        }
                    }
                    debug!(
                        path = %reader.file_name().display(),
                        sequence = %reader.sequence(),
                        blocks = %reader.num_blocks(),
                        "online candidate"
                    );
                }

                if chosen.is_some() || higher {
                    break;
                }

                self.ctx
                    .interruptible_sleep(self.ctx.tunables.redo_read_sleep_us);
                if self.ctx.is_soft_shutdown() {
                    break;
                }

                if begin.elapsed().as_micros() as u64 >= self.ctx.tunables.refresh_interval_us {
                    trace!("refresh interval reached, checking online redo logs again");
                    self.update_online_redo_log_data()?;
                    self.update_online_logs()?;
                    self.go_standby();
                    return Ok(logs_processed);
                }

                self.update_online_logs()?;
            }

            let Some(index) = chosen else {
                break;
            };
            if self.ctx.is_soft_shutdown() {
                break;
            }
            logs_processed = true;

            let reader = &self.online_readers[index];
            let ret = RecordStream::new(&self.ctx, &self.metadata).process(reader);
            self.metadata
                .set_first_next_scn(reader.first_scn(), reader.next_scn());

            if self.ctx.is_soft_shutdown() {
                break;
            }

            match ret {
                RedoCode::Finished => {
                    self.metadata.set_next_sequence();
                    if self.ctx.consume_log_switch() {
                        info!("shutdown initiated by number of log switches");
                        self.ctx.stop_soft();
                    }
                }
                RedoCode::Stopped | RedoCode::Ok => {
                    trace!(
                        sequence = %self.metadata.sequence(),
                        "online log still being written, refreshing"
                    );
                    self.update_online_redo_log_data()?;
                    self.update_online_logs()?;
                }
                RedoCode::Overwritten => {
                    info!(
                        "online redo log has been overwritten, continuing from archived redo log"
                    );
                    break;
                }
                code => {
                    let group = self.online_readers[index].group();
                    if group == 0 {
                        return Err(RedotailError::ArchiveProcessing { code });
                    }
                    return Err(RedotailError::OnlineProcessing { group, code });
                }
            }
        }

        Ok(logs_processed)
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Run the replicator to completion (soft shutdown) or to a fatal error.
    pub fn run(&mut self) -> Result<()> {
        trace!(database = %self.database, "replicator start");

        self.metadata.wait_for_writer(&self.ctx);
        self.load_database_metadata();
        if !self.ctx.is_flag_set(FLAG_ARCH_ONLY) {
            self.update_online_redo_log_data()?;
        }

        // Boot until the writer rendezvous settles into replication.
        loop {
            if self.ctx.is_soft_shutdown() {
                return Ok(());
            }
            self.metadata.wait_for_writer(&self.ctx);
            if self.metadata.status() == MetadataStatus::Ready {
                continue;
            }
            if self.ctx.is_soft_shutdown() {
                return Ok(());
            }

            match self.boot() {
                Ok(()) => {
                    info!("resume writer");
                    self.metadata.set_status_replicate();
                }
                Err(err) if err.is_boot() && self.boot_failsafe => {
                    tracing::error!(error = %err, "replication startup failed");
                    info!("waiting for further commands");
                    self.metadata.set_status_ready();
                    continue;
                }
                Err(err) => return Err(err),
            }

            if self.metadata.status() == MetadataStatus::Replicate {
                break;
            }
        }

        while !self.ctx.is_soft_shutdown() {
            let mut logs_processed = false;

            logs_processed |= self.process_archived_redo_logs()?;
            if self.ctx.is_soft_shutdown() {
                break;
            }

            if !self.continue_with_online() {
                break;
            }

            if !self.ctx.is_flag_set(FLAG_ARCH_ONLY) {
                logs_processed |= self.process_online_redo_logs()?;
            }
            if self.ctx.is_soft_shutdown() {
                break;
            }

            if !logs_processed {
                info!("no redo logs to process, waiting for new redo logs");
                self.ctx
                    .interruptible_sleep(self.ctx.tunables.refresh_interval_us);
            }
        }

        info!(database = %self.database, "replicator is shutting down");
        self.shutdown_readers();
        Ok(())
    }

    /// Stop and join every reader thread of this source.
    pub fn shutdown_readers(&mut self) {
        if let Some(reader) = self.arch_reader.as_mut() {
            reader.shutdown_join();
        }
        for reader in &mut self.online_readers {
            reader.shutdown_join();
        }
    }
}
