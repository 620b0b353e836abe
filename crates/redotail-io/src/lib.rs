//! Block-level I/O backends for redo log files.
//!
//! The reader never touches the filesystem directly; it goes through
//! [`BlockIo`], a three-method capability trait. Backends:
//!
//! - [`FileBlockIo`]: positional reads against a local file. Reading past the
//!   current end returns 0 bytes without error, which is the expected shape
//!   of an online log that is still being written.
//! - [`PipeBlockIo`]: runs a configured shell command and mirrors its stdout
//!   into memory, then serves reads from the mirror. This covers both the
//!   ASM case (a command that pipes the ASM file out of the database host)
//!   and the remote-shell case (`ssh <host> cat {path}`). The mirror is
//!   append-closed: once `open` returns, no bytes are ever added, so these
//!   backends are only suitable for archived logs.

mod file;
mod pipe;

use std::path::Path;
use std::sync::Arc;

pub use file::FileBlockIo;
pub use pipe::PipeBlockIo;

use redotail_error::Result;
use redotail_types::ctx::RunCtx;

/// One open log file, addressable by absolute byte offset.
///
/// All three methods may block on the operating system. Implementations are
/// owned by exactly one reader thread, so no internal locking is required.
pub trait BlockIo: Send {
    /// Open the log at `path` and return its current size in bytes.
    fn open(&mut self, path: &Path) -> Result<u64>;

    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns 0 only at (or past) end-of-file; returns fewer bytes than
    /// requested only if the file is short there.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Release the underlying handle. Idempotent.
    fn close(&mut self);

    /// Whether the backend snapshots the file at open time.
    ///
    /// Append-closed backends never observe growth, so they must not be used
    /// for online logs.
    fn is_append_closed(&self) -> bool {
        false
    }
}

/// Which backend a source is configured to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    /// Local filesystem access.
    File,
    /// ASM log pulled through a shell command; `{path}` is substituted.
    AsmShell { command: String },
    /// Remote host access through a shell tunnel; `{path}` is substituted.
    RemoteShell { command: String },
}

/// Build the backend a spec describes.
#[must_use]
pub fn create_backend(spec: &BackendSpec, ctx: Arc<RunCtx>) -> Box<dyn BlockIo> {
    match spec {
        BackendSpec::File => Box::new(FileBlockIo::new()),
        BackendSpec::AsmShell { command } | BackendSpec::RemoteShell { command } => {
            Box::new(PipeBlockIo::new(command.clone(), ctx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redotail_types::ctx::RunCtxConfig;

    #[test]
    fn backend_creation_matches_spec() {
        let ctx = Arc::new(RunCtx::new(RunCtxConfig::default()));
        let file = create_backend(&BackendSpec::File, Arc::clone(&ctx));
        assert!(!file.is_append_closed());

        let asm = create_backend(
            &BackendSpec::AsmShell {
                command: "cat {path}".to_owned(),
            },
            ctx,
        );
        assert!(asm.is_append_closed());
    }
}
