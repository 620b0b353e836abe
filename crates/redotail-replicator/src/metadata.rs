//! Checkpoint metadata for one source database.
//!
//! [`Metadata`] is the boundary to the external checkpoint store: it owns the
//! replication position (sequence, in-file offset, first/next SCN of the last
//! processed file), the resetlogs id and incarnation forest, the start hints,
//! and the writer rendezvous the replicator parks on until downstream is
//! ready. Every cross-thread write goes through the checkpoint mutex; the
//! sequence never decreases except when a resetlogs branch resets it to zero
//! under that same mutex.

use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use redotail_error::{RedotailError, Result};
use redotail_types::ctx::RunCtx;
use redotail_types::{Activation, FileOffset, Resetlogs, Scn, Seq};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One database incarnation: a node of the resetlogs forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Incarnation {
    pub incarnation: u32,
    pub resetlogs: u32,
    pub resetlogs_scn: u64,
    pub prior_incarnation: u32,
}

/// Rendezvous state between the replicator and the downstream writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataStatus {
    /// Waiting for the writer to ask for replication.
    Ready,
    /// The writer asked; the replicator is booting.
    Start,
    /// Replication is running.
    Replicate,
}

/// Durable replication position, serialized as the checkpoint snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Checkpoint {
    /// Sequence currently being (or next to be) processed; `None` before the
    /// start position has been computed.
    pub sequence: Option<u32>,
    /// Confirmed byte offset within that sequence's file.
    pub file_offset: u64,
    pub first_scn: Option<u64>,
    pub next_scn: Option<u64>,
    pub resetlogs: u32,
    pub activation: u32,
}

struct MetaState {
    status: MetadataStatus,
    checkpoint: Checkpoint,
    incarnations: Vec<Incarnation>,
    current_incarnation: Option<u32>,
    checkpoints_allowed: bool,
}

/// Start hints and per-source database facts, fixed at boot.
#[derive(Debug, Clone, Default)]
pub struct SourceFacts {
    pub start_sequence: Option<Seq>,
    pub start_scn: Option<Scn>,
    pub db_recovery_file_dest: String,
    pub db_context: String,
    pub log_archive_format: String,
    pub db_block_checksum: String,
}

/// Checkpoint store boundary for one source.
pub struct Metadata {
    state: Mutex<MetaState>,
    cond: Condvar,
    pub facts: SourceFacts,
}

impl Metadata {
    #[must_use]
    pub fn new(facts: SourceFacts) -> Self {
        Self {
            state: Mutex::new(MetaState {
                status: MetadataStatus::Ready,
                checkpoint: Checkpoint::default(),
                incarnations: Vec::new(),
                current_incarnation: None,
                checkpoints_allowed: false,
            }),
            cond: Condvar::new(),
            facts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Writer rendezvous
    // ------------------------------------------------------------------

    /// Park until the writer requests replication (or shutdown).
    pub fn wait_for_writer(&self, ctx: &RunCtx) {
        let mut state = self.lock();
        while state.status == MetadataStatus::Ready && !ctx.is_soft_shutdown() {
            let (guard, _) = self
                .cond
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Writer-side: ask the replicator to start.
    pub fn request_replication(&self) {
        self.lock().status = MetadataStatus::Start;
        self.cond.notify_all();
    }

    pub fn set_status_ready(&self) {
        self.lock().status = MetadataStatus::Ready;
        self.cond.notify_all();
    }

    pub fn set_status_replicate(&self) {
        self.lock().status = MetadataStatus::Replicate;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn status(&self) -> MetadataStatus {
        self.lock().status
    }

    /// Checkpoint writes become legal once the schema decision is made.
    pub fn allow_checkpoints(&self) {
        self.lock().checkpoints_allowed = true;
    }

    #[must_use]
    pub fn checkpoints_allowed(&self) -> bool {
        self.lock().checkpoints_allowed
    }

    // ------------------------------------------------------------------
    // Replication position
    // ------------------------------------------------------------------

    /// Current sequence; `Seq::ZERO` means "adopt from the first file".
    #[must_use]
    pub fn sequence(&self) -> Seq {
        Seq(self.lock().checkpoint.sequence.unwrap_or(0))
    }

    /// Whether a start position has been computed at all.
    #[must_use]
    pub fn is_positioned(&self) -> bool {
        self.lock().checkpoint.sequence.is_some()
    }

    #[must_use]
    pub fn file_offset(&self) -> FileOffset {
        FileOffset(self.lock().checkpoint.file_offset)
    }

    pub fn set_seq_file_offset(&self, sequence: Seq, offset: FileOffset) {
        let mut state = self.lock();
        state.checkpoint.sequence = Some(sequence.value());
        state.checkpoint.file_offset = offset.value();
    }

    pub fn set_file_offset(&self, offset: FileOffset) {
        self.lock().checkpoint.file_offset = offset.value();
    }

    /// Commit one finished file: the sequence advances by exactly one and
    /// the in-file position resets.
    pub fn set_next_sequence(&self) {
        let mut state = self.lock();
        let current = state.checkpoint.sequence.unwrap_or(0);
        state.checkpoint.sequence = Some(current + 1);
        state.checkpoint.file_offset = 0;
        debug!(sequence = current + 1, "sequence advanced");
    }

    pub fn set_first_next_scn(&self, first_scn: Scn, next_scn: Scn) {
        let mut state = self.lock();
        state.checkpoint.first_scn = (!first_scn.is_none()).then_some(first_scn.value());
        state.checkpoint.next_scn = (!next_scn.is_none()).then_some(next_scn.value());
    }

    #[must_use]
    pub fn first_scn(&self) -> Scn {
        self.lock()
            .checkpoint
            .first_scn
            .map_or(Scn::NONE, Scn::new)
    }

    #[must_use]
    pub fn next_scn(&self) -> Scn {
        self.lock().checkpoint.next_scn.map_or(Scn::NONE, Scn::new)
    }

    #[must_use]
    pub fn resetlogs(&self) -> Resetlogs {
        Resetlogs(self.lock().checkpoint.resetlogs)
    }

    pub fn set_resetlogs(&self, resetlogs: Resetlogs) {
        self.lock().checkpoint.resetlogs = resetlogs.0;
    }

    #[must_use]
    pub fn activation(&self) -> Activation {
        Activation(self.lock().checkpoint.activation)
    }

    pub fn set_activation(&self, activation: Activation) {
        self.lock().checkpoint.activation = activation.0;
    }

    // ------------------------------------------------------------------
    // Incarnations
    // ------------------------------------------------------------------

    pub fn set_incarnations(&self, incarnations: Vec<Incarnation>) {
        self.lock().incarnations = incarnations;
    }

    /// Follow the incarnation forest after a file has been processed.
    ///
    /// Locates the incarnation matching the checkpointed resetlogs id, then
    /// looks for a branch forking off it exactly at the last observed next
    /// SCN. A detected branch resets the position to the start of the new
    /// sequence space.
    pub fn update_resetlogs(&self) -> Result<()> {
        let mut state = self.lock();

        let checkpointed = state.checkpoint.resetlogs;
        let current = state
            .incarnations
            .iter()
            .find(|incarnation| incarnation.resetlogs == checkpointed)
            .map(|incarnation| incarnation.incarnation);
        if current.is_some() {
            state.current_incarnation = current;
        }

        if let (Some(current), Some(next_scn)) =
            (state.current_incarnation, state.checkpoint.next_scn)
        {
            let branch = state
                .incarnations
                .iter()
                .find(|incarnation| {
                    incarnation.resetlogs_scn == next_scn
                        && incarnation.prior_incarnation == current
                })
                .cloned();
            if let Some(branch) = branch {
                info!(resetlogs = branch.resetlogs, "new resetlogs detected");
                state.checkpoint.resetlogs = branch.resetlogs;
                state.checkpoint.sequence = Some(0);
                state.checkpoint.file_offset = 0;
                state.current_incarnation = Some(branch.incarnation);
                return Ok(());
            }
        }

        if state.incarnations.is_empty() {
            return Ok(()); // bootstrap: nothing known yet
        }
        if state.current_incarnation.is_none() {
            return Err(RedotailError::ResetlogsNotFound {
                resetlogs: Resetlogs(state.checkpoint.resetlogs),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot persistence
    // ------------------------------------------------------------------

    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        self.lock().checkpoint.clone()
    }

    pub fn restore(&self, checkpoint: Checkpoint) {
        self.lock().checkpoint = checkpoint;
    }

    /// Persist the position as a JSON snapshot.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let snapshot = self.checkpoint();
        let rendered = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| RedotailError::internal(format!("checkpoint encode: {err}")))?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    /// Load a previously saved position, if one exists.
    pub fn load_checkpoint(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let raw = std::fs::read_to_string(path)?;
        let snapshot: Checkpoint = serde_json::from_str(&raw).map_err(|err| {
            RedotailError::config(format!("checkpoint '{}': {err}", path.display()))
        })?;
        self.restore(snapshot);
        Ok(true)
    }
}
