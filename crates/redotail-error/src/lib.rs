//! Primary error type for redotail operations.
//!
//! One structured enum covers the whole pipeline. Each variant carries enough
//! context to print a useful single-line diagnosis, and [`Severity`] encodes
//! the boot/runtime/data split as data rather than as distinct exception
//! types: boot errors can degrade to "wait for further commands" when the
//! failsafe is on, runtime and data errors stop the source.

use std::path::PathBuf;

use redotail_types::{RedoCode, Resetlogs, Scn};
use thiserror::Error;

/// What a failure means for the lifecycle of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Startup could not complete; recoverable when `boot-failsafe` is set.
    Boot,
    /// The process hit an operational fault (I/O, threading, configuration
    /// drift) while replicating.
    Runtime,
    /// The redo stream itself is inconsistent with what was already read.
    Data,
}

/// Primary error type for redotail operations.
#[derive(Error, Debug)]
pub enum RedotailError {
    // === Configuration / boot ===
    /// Configuration file could not be read or parsed.
    #[error("configuration error: {detail}")]
    Config { detail: String },

    /// The start position cannot be determined.
    #[error("starting sequence is unknown")]
    StartSequenceUnknown,

    /// No schema snapshot and the source is not running schemaless.
    #[error("schema file missing")]
    SchemaMissing,

    /// Offline discovery needs `log_archive_format` and it is missing.
    #[error("missing location of archived redo logs for offline mode")]
    MissingArchiveFormat,

    // === I/O ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A directory listing failed.
    #[error("directory: '{path}' - can't read")]
    DirectoryUnreadable { path: PathBuf },

    /// Too few bytes where a full header or block was required.
    #[error("file: '{path}' - short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    /// The redo-copy tee could not keep up with the reader.
    #[error("file: '{path}' - {written} bytes written instead of {expected}")]
    CopyWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    /// The mirror command of a piped backend failed.
    #[error("command '{command}' exited with status {status}")]
    CommandFailed { command: String, status: i32 },

    /// A piped backend produced no bytes at all.
    #[error("file: '{path}' - transferred data is empty")]
    EmptyTransfer { path: PathBuf },

    // === Log file structure ===
    /// Block 0 does not look like a redo log header.
    #[error("file: '{path}' - invalid header: {detail}")]
    BadHeader { path: PathBuf, detail: String },

    /// The declared block size and the type marker disagree.
    #[error("file: '{path}' - invalid block size: {block_size}, header marker: {marker:#04x}")]
    BadBlockSize {
        path: PathBuf,
        block_size: u32,
        marker: u8,
    },

    /// Compat version outside the supported ranges.
    #[error("file: '{path}' - invalid database version: {compat_vsn:#010x}")]
    UnsupportedVersion { path: PathBuf, compat_vsn: u32 },

    /// A later file claims a different database version than the first one.
    #[error("file: '{path}' - database version {found:#010x}, expected {expected:#010x}")]
    VersionChanged {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// A later header contradicts the first/next SCN already recorded.
    #[error("file: '{path}' - invalid {field} scn value: {found}, expected: {expected}")]
    ScnChanged {
        path: PathBuf,
        field: &'static str,
        found: Scn,
        expected: Scn,
    },

    // === Replication control ===
    /// An archived log would not open within the retry budget.
    #[error("file: '{path}' - failed to open after {tries} tries")]
    ArchiveOpenExhausted { path: PathBuf, tries: u32 },

    /// Archived processing ended with a code that has no recovery.
    #[error("archive log processing returned: {}", code.message())]
    ArchiveProcessing { code: RedoCode },

    /// Online processing ended with a code that has no recovery.
    #[error("online redo log processing for group {group} returned: {}", code.message())]
    OnlineProcessing { group: u32, code: RedoCode },

    /// Re-checking an online log member failed outright.
    #[error("updating of online redo logs failed for '{path}'")]
    OnlineUpdateFailed { path: PathBuf },

    /// No member of an online group could be opened.
    #[error("can't read any member of group {group}")]
    GroupUnreadable { group: u32 },

    /// The checkpointed resetlogs id is not in the incarnation list.
    #[error("resetlogs ({resetlogs}) not found in incarnation list")]
    ResetlogsNotFound { resetlogs: Resetlogs },

    /// A producer loop found itself with nothing it could legally read.
    #[error("file: '{path}' - zero to read, start: {start}, end: {end}, scan: {scan}")]
    ZeroRead {
        path: PathBuf,
        start: u64,
        end: u64,
        scan: u64,
    },

    /// A worker thread died without reporting a status.
    #[error("thread '{name}' terminated abnormally")]
    ThreadLost { name: String },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl RedotailError {
    /// Classify the failure for the boot/runtime/data policy split.
    ///
    /// Only an unknown start position is a boot failure the failsafe may
    /// absorb; a bad config file, a missing archive format or a missing
    /// schema snapshot stop the source no matter what.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::StartSequenceUnknown => Severity::Boot,
            Self::Config { .. } | Self::SchemaMissing | Self::MissingArchiveFormat => {
                Severity::Runtime
            }
            Self::BadHeader { .. }
            | Self::BadBlockSize { .. }
            | Self::UnsupportedVersion { .. }
            | Self::VersionChanged { .. }
            | Self::ScnChanged { .. }
            | Self::ArchiveProcessing { .. }
            | Self::OnlineProcessing { .. }
            | Self::ResetlogsNotFound { .. } => Severity::Data,
            _ => Severity::Runtime,
        }
    }

    /// Whether the failsafe "wait for further commands" path may absorb this.
    #[must_use]
    pub const fn is_boot(&self) -> bool {
        matches!(self.severity(), Severity::Boot)
    }

    /// Process exit code: every fatal error maps to 1.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        1
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `RedotailError`.
pub type Result<T> = std::result::Result<T, RedotailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = RedotailError::BadBlockSize {
            path: PathBuf::from("/logs/redo01.log"),
            block_size: 777,
            marker: 0x22,
        };
        assert_eq!(
            err.to_string(),
            "file: '/logs/redo01.log' - invalid block size: 777, header marker: 0x22"
        );

        let err = RedotailError::ArchiveProcessing {
            code: RedoCode::ErrorCrc,
        };
        assert_eq!(err.to_string(), "archive log processing returned: CRC ERROR");
    }

    #[test]
    fn severity_split() {
        assert_eq!(
            RedotailError::StartSequenceUnknown.severity(),
            Severity::Boot
        );
        assert!(RedotailError::StartSequenceUnknown.is_boot());
        assert_eq!(
            RedotailError::ResetlogsNotFound {
                resetlogs: Resetlogs(7)
            }
            .severity(),
            Severity::Data
        );
        let io: RedotailError = std::io::Error::other("disk gone").into();
        assert_eq!(io.severity(), Severity::Runtime);
        assert!(!io.is_boot());
    }

    /// Only the unknown start position is failsafe-retriable; the other
    /// startup-adjacent failures are always fatal.
    #[test]
    fn boot_failsafe_covers_only_start_position() {
        assert_eq!(RedotailError::SchemaMissing.severity(), Severity::Runtime);
        assert!(!RedotailError::SchemaMissing.is_boot());
        assert_eq!(
            RedotailError::config("bad json").severity(),
            Severity::Runtime
        );
        assert!(!RedotailError::config("bad json").is_boot());
        assert_eq!(
            RedotailError::MissingArchiveFormat.severity(),
            Severity::Runtime
        );
        assert!(!RedotailError::MissingArchiveFormat.is_boot());
    }

    #[test]
    fn exit_code_is_one() {
        assert_eq!(RedotailError::internal("x").exit_code(), 1);
    }

    #[test]
    fn scn_changed_uses_scn_display() {
        let err = RedotailError::ScnChanged {
            path: PathBuf::from("a"),
            field: "next",
            found: Scn::new(10),
            expected: Scn::NONE,
        };
        assert_eq!(
            err.to_string(),
            "file: 'a' - invalid next scn value: 10, expected: <none>"
        );
    }
}
