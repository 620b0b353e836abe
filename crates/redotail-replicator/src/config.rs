//! Source configuration.
//!
//! The pipeline is configured from one JSON document with a `sources` array.
//! Key names follow the dashed convention of the reference deployments, e.g.:
//!
//! ```json
//! {
//!   "sources": [{
//!     "alias": "main",
//!     "name": "ORCLCDB1",
//!     "reader": {
//!       "type": "batch",
//!       "backend": "file",
//!       "redo-read-sleep-us": 50000,
//!       "redo-verify-delay-us": 250000
//!     },
//!     "memory": { "min-mb": 32, "max-mb": 64 },
//!     "flags": 3,
//!     "log-archive-format": "o1_mf_%t_%s_%h_.arc",
//!     "redo-log-batch": ["/opt/archive"]
//!   }]
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use redotail_error::{RedotailError, Result};
use redotail_io::BackendSpec;
use redotail_types::ctx::{RunCtx, RunCtxConfig, Tunables, MEMORY_CHUNK_SIZE};
use redotail_types::{Scn, Seq};
use serde::Deserialize;

use crate::metadata::{Incarnation, SourceFacts};

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Parse a configuration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(raw).map_err(|err| RedotailError::config(err.to_string()))?;
        for source in &config.sources {
            source.validate()?;
        }
        Ok(config)
    }

    /// Load a configuration file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            RedotailError::config(format!("config '{}': {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }
}

/// How candidate files for a source are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReaderType {
    /// Live discovery against the archiver's directory layout plus the
    /// configured online log groups.
    Online,
    /// A fixed list of files and directories, processed once.
    Batch,
}

/// Which block I/O backend opens the archived files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    File,
    AsmShell,
    RemoteShell,
}

fn default_redo_read_sleep_us() -> u64 {
    50_000
}
fn default_arch_read_sleep_us() -> u64 {
    10_000_000
}
fn default_arch_read_tries() -> u32 {
    10
}
fn default_refresh_interval_us() -> u64 {
    10_000_000
}
fn default_memory_mb() -> u64 {
    32
}

/// The `reader` section of one source.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReaderConfig {
    #[serde(rename = "type")]
    pub reader_type: ReaderType,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Shell command mirroring a log into memory; `{path}` is substituted.
    /// Required for the `asm-shell` and `remote-shell` backends.
    #[serde(default)]
    pub backend_command: Option<String>,
    #[serde(default)]
    pub redo_copy_path: Option<PathBuf>,
    /// Bitmask; bit 0 disables block checksum verification.
    #[serde(default)]
    pub disable_checks: u64,
    #[serde(default = "default_redo_read_sleep_us")]
    pub redo_read_sleep_us: u64,
    #[serde(default)]
    pub redo_verify_delay_us: u64,
    #[serde(default = "default_arch_read_sleep_us")]
    pub arch_read_sleep_us: u64,
    #[serde(default = "default_arch_read_tries")]
    pub arch_read_tries: u32,
    #[serde(default = "default_refresh_interval_us")]
    pub refresh_interval_us: u64,
}

fn default_backend() -> BackendKind {
    BackendKind::File
}

/// The `memory` section: ring bounds in whole megabytes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_mb")]
    pub min_mb: u64,
    #[serde(default = "default_memory_mb")]
    pub max_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_mb: default_memory_mb(),
            max_mb: default_memory_mb(),
        }
    }
}

/// One online redo log group and its mirrored member paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct OnlineLogGroup {
    pub group: u32,
    pub paths: Vec<PathBuf>,
}

/// One replicated source database.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SourceConfig {
    pub alias: String,
    /// Database name; used in log lines and redo-copy file names.
    pub name: String,
    pub reader: ReaderConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Bitmask: bit 0 archived-only, bit 1 schemaless.
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub db_recovery_file_dest: Option<PathBuf>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub log_archive_format: Option<String>,
    #[serde(default)]
    pub db_block_checksum: Option<String>,
    /// Flat `[source, target, source, target, …]` prefix rewrites.
    #[serde(default)]
    pub path_mapping: Vec<String>,
    #[serde(default)]
    pub redo_log_batch: Vec<PathBuf>,
    #[serde(default)]
    pub online_redo_logs: Vec<OnlineLogGroup>,
    #[serde(default)]
    pub start_sequence: Option<u32>,
    #[serde(default)]
    pub start_scn: Option<u64>,
    /// Known incarnation forest, for offline resetlogs handling.
    #[serde(default)]
    pub incarnations: Vec<Incarnation>,
    #[serde(default)]
    pub boot_failsafe: bool,
    #[serde(default)]
    pub stop_log_switches: u64,
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

impl SourceConfig {
    fn validate(&self) -> Result<()> {
        if self.alias.is_empty() || self.name.is_empty() {
            return Err(RedotailError::config("source alias and name are required"));
        }
        if self.memory.max_mb == 0 {
            return Err(RedotailError::config("memory.max-mb must be positive"));
        }
        if self.memory.min_mb > self.memory.max_mb {
            return Err(RedotailError::config(
                "memory.min-mb must not exceed memory.max-mb",
            ));
        }
        if self.path_mapping.len() % 2 != 0 {
            return Err(RedotailError::config(
                "path-mapping needs source/target pairs",
            ));
        }
        match self.reader.backend {
            BackendKind::File => {}
            BackendKind::AsmShell | BackendKind::RemoteShell => {
                if self.reader.backend_command.is_none() {
                    return Err(RedotailError::config(
                        "backend-command is required for shell backends",
                    ));
                }
            }
        }
        if self.reader.reader_type == ReaderType::Batch && self.redo_log_batch.is_empty() {
            return Err(RedotailError::config(
                "batch reader needs redo-log-batch entries",
            ));
        }
        Ok(())
    }

    /// The backend spec archived logs are opened with.
    #[must_use]
    pub fn backend_spec(&self) -> BackendSpec {
        match self.reader.backend {
            BackendKind::File => BackendSpec::File,
            BackendKind::AsmShell => BackendSpec::AsmShell {
                command: self.reader.backend_command.clone().unwrap_or_default(),
            },
            BackendKind::RemoteShell => BackendSpec::RemoteShell {
                command: self.reader.backend_command.clone().unwrap_or_default(),
            },
        }
    }

    /// Path-mapping rules in `(source, target)` pairs.
    #[must_use]
    pub fn mapping_rules(&self) -> Vec<(String, String)> {
        self.path_mapping
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }

    /// The per-source database facts the metadata store carries.
    #[must_use]
    pub fn facts(&self) -> SourceFacts {
        SourceFacts {
            start_sequence: self.start_sequence.map(Seq::new),
            start_scn: self.start_scn.map(Scn::new),
            db_recovery_file_dest: self
                .db_recovery_file_dest
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            db_context: self.context.clone().unwrap_or_default(),
            log_archive_format: self.log_archive_format.clone().unwrap_or_default(),
            db_block_checksum: self
                .db_block_checksum
                .clone()
                .unwrap_or_else(|| "TYPICAL".to_owned()),
        }
    }

    /// Build the shared run context this source's threads live under.
    #[must_use]
    pub fn build_ctx(&self) -> Arc<RunCtx> {
        let chunks = (self.memory.max_mb * 1024 * 1024) / MEMORY_CHUNK_SIZE;
        Arc::new(RunCtx::new(RunCtxConfig {
            tunables: Tunables {
                redo_read_sleep_us: self.reader.redo_read_sleep_us,
                arch_read_sleep_us: self.reader.arch_read_sleep_us,
                arch_read_tries: self.reader.arch_read_tries,
                redo_verify_delay_us: self.reader.redo_verify_delay_us,
                refresh_interval_us: self.reader.refresh_interval_us,
            },
            disable_checks: self.reader.disable_checks,
            flags: self.flags,
            redo_copy_path: self.reader.redo_copy_path.clone(),
            memory_chunks_max: chunks.max(1),
            buffer_size_max: chunks.max(1) * MEMORY_CHUNK_SIZE,
            stop_log_switches: self.stop_log_switches,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redotail_types::ctx::{FLAG_ARCH_ONLY, FLAG_SCHEMALESS};

    fn minimal(reader: &str) -> String {
        format!(
            r#"{{
                "sources": [{{
                    "alias": "main",
                    "name": "ORCLCDB1",
                    "reader": {reader},
                    "flags": 3,
                    "log-archive-format": "o1_mf_%t_%s_%h_.arc",
                    "redo-log-batch": ["/opt/archive"]
                }}]
            }}"#
        )
    }

    #[test]
    fn parses_minimal_batch_source() {
        let config = Config::from_json(&minimal(r#"{"type": "batch"}"#)).expect("parse");
        let source = &config.sources[0];
        assert_eq!(source.reader.reader_type, ReaderType::Batch);
        assert_eq!(source.reader.redo_read_sleep_us, 50_000);
        assert_eq!(source.reader.arch_read_tries, 10);
        assert_eq!(source.backend_spec(), BackendSpec::File);

        let ctx = source.build_ctx();
        assert!(ctx.is_flag_set(FLAG_ARCH_ONLY));
        assert!(ctx.is_flag_set(FLAG_SCHEMALESS));
        assert_eq!(ctx.memory_chunks_max, 32);
    }

    #[test]
    fn shell_backend_requires_command() {
        let err = Config::from_json(&minimal(r#"{"type": "batch", "backend": "asm-shell"}"#))
            .expect_err("must fail");
        assert!(err.to_string().contains("backend-command"));

        let config = Config::from_json(&minimal(
            r#"{"type": "batch", "backend": "asm-shell",
                "backend-command": "ssh db1 asmpipe {path}"}"#,
        ))
        .expect("parse");
        assert!(matches!(
            config.sources[0].backend_spec(),
            BackendSpec::AsmShell { .. }
        ));
    }

    #[test]
    fn batch_reader_needs_batch_entries() {
        let raw = r#"{
            "sources": [{
                "alias": "main",
                "name": "DB",
                "reader": {"type": "batch"}
            }]
        }"#;
        let err = Config::from_json(raw).expect_err("must fail");
        assert!(err.to_string().contains("redo-log-batch"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = r#"{"sources": [], "surprise": 1}"#;
        assert!(Config::from_json(raw).is_err());
    }

    #[test]
    fn odd_path_mapping_is_rejected() {
        let raw = r#"{
            "sources": [{
                "alias": "main",
                "name": "DB",
                "reader": {"type": "online"},
                "path-mapping": ["/only-source"]
            }]
        }"#;
        let err = Config::from_json(raw).expect_err("must fail");
        assert!(err.to_string().contains("path-mapping"));
    }

    #[test]
    fn online_groups_parse() {
        let raw = r#"{
            "sources": [{
                "alias": "main",
                "name": "DB",
                "reader": {"type": "online", "redo-verify-delay-us": 250000},
                "online-redo-logs": [
                    {"group": 1, "paths": ["/ora/redo01a.log", "/ora/redo01b.log"]},
                    {"group": 2, "paths": ["/ora/redo02a.log"]}
                ],
                "db-recovery-file-dest": "/ora/fra",
                "context": "ORCL",
                "log-archive-format": "o1_mf_%t_%s_%h_.arc"
            }]
        }"#;
        let config = Config::from_json(raw).expect("parse");
        let source = &config.sources[0];
        assert_eq!(source.online_redo_logs.len(), 2);
        assert_eq!(source.online_redo_logs[0].paths.len(), 2);
        assert_eq!(source.reader.redo_verify_delay_us, 250_000);
    }
}
