//! redotail: a change-data-capture core for Oracle-style redo logs.
//!
//! The crate re-exports the workspace pieces and adds [`Pipeline`], the
//! process-level manager that spawns one replicator thread per configured
//! source, wires up shutdown fan-out, and persists checkpoints on a clean
//! stop.

mod pipeline;

pub use pipeline::Pipeline;
pub use redotail_error::{RedotailError, Result, Severity};
pub use redotail_io::{BackendSpec, BlockIo, FileBlockIo, PipeBlockIo};
pub use redotail_reader::Reader;
pub use redotail_replicator::{Config, Replicator, SourceConfig};
pub use redotail_types::ctx::{RunCtx, RunCtxConfig};
pub use redotail_types::{Activation, Blk, FileOffset, RedoCode, Resetlogs, Scn, Seq};
