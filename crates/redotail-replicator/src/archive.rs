//! Archived-log discovery and `log_archive_format` sequence extraction.
//!
//! The archiver names its files by expanding a printf-like template. Walking
//! the template and a candidate filename in lockstep recovers the sequence
//! number without ever parsing dates or hashes:
//!
//! - `%s` / `%S` consume a maximal digit run and capture it as the sequence
//! - `%t` / `%T` / `%r` / `%a` / `%d` consume a digit run and discard it
//! - `%h` consumes a `[0-9a-z]` run and discards it
//! - any other template character must match exactly
//!
//! A failed walk yields `Seq::ZERO` with a warning, never an error: foreign
//! files in an archive directory are routine.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::path::{Path, PathBuf};

use redotail_error::{RedotailError, Result};
use redotail_types::Seq;
use tracing::{trace, warn};

/// Extract the sequence encoded in `file` by `format`, or `Seq::ZERO`.
#[must_use]
pub fn sequence_from_file_name(format: &str, file: &str) -> Seq {
    let format_bytes = format.as_bytes();
    let file_bytes = file.as_bytes();
    let mut sequence = Seq::ZERO;
    let mut i = 0;
    let mut j = 0;

    while i < format_bytes.len() && j < file_bytes.len() {
        if format_bytes[i] == b'%' {
            let Some(&wildcard) = format_bytes.get(i + 1) else {
                warn!(file, format, position = j, "template ends after %");
                return Seq::ZERO;
            };
            let mut digits = 0;
            match wildcard {
                b's' | b'S' | b't' | b'T' | b'r' | b'a' | b'd' => {
                    let mut number: u32 = 0;
                    while j < file_bytes.len() && file_bytes[j].is_ascii_digit() {
                        number = number
                            .wrapping_mul(10)
                            .wrapping_add(u32::from(file_bytes[j] - b'0'));
                        j += 1;
                        digits += 1;
                    }
                    if wildcard == b's' || wildcard == b'S' {
                        sequence = Seq(number);
                    }
                    i += 2;
                }
                b'h' => {
                    while j < file_bytes.len()
                        && (file_bytes[j].is_ascii_digit()
                            || file_bytes[j].is_ascii_lowercase())
                    {
                        j += 1;
                        digits += 1;
                    }
                    i += 2;
                }
                _ => {
                    warn!(file, format, position = j, "unknown template wildcard");
                    return Seq::ZERO;
                }
            }
            if digits == 0 {
                warn!(file, format, position = j, "wildcard matched nothing");
                return Seq::ZERO;
            }
        } else if file_bytes[j] == format_bytes[i] {
            i += 1;
            j += 1;
        } else {
            warn!(file, format, position = j, "literal mismatch");
            return Seq::ZERO;
        }
    }

    if i == format_bytes.len() && j == file_bytes.len() {
        return sequence;
    }
    warn!(file, format, position = j, "template and name end apart");
    Seq::ZERO
}

/// Ordered `(source prefix → target prefix)` rewrites applied to every path
/// before it is opened; the first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct PathMapping {
    rules: Vec<(String, String)>,
}

impl PathMapping {
    #[must_use]
    pub fn new(rules: Vec<(String, String)>) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn apply(&self, path: &Path) -> PathBuf {
        let rendered = path.to_string_lossy();
        for (source, target) in &self.rules {
            if let Some(rest) = rendered.strip_prefix(source.as_str()) {
                return PathBuf::from(format!("{target}{rest}"));
            }
        }
        path.to_path_buf()
    }
}

/// One discovered archived log, waiting its turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveCandidate {
    pub sequence: Seq,
    pub path: PathBuf,
    /// Discovery order, breaking ties between equal sequences.
    order: u64,
}

impl Ord for ArchiveCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.sequence, self.order).cmp(&(other.sequence, other.order))
    }
}

impl PartialOrd for ArchiveCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of candidates by ascending sequence; enqueueing the same
/// sequence twice is a no-op, so re-discovery is idempotent.
#[derive(Debug, Default)]
pub struct ArchiveQueue {
    heap: BinaryHeap<Reverse<ArchiveCandidate>>,
    queued: BTreeSet<u32>,
    next_order: u64,
}

impl ArchiveQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sequence: Seq, path: PathBuf) {
        if !self.queued.insert(sequence.value()) {
            return;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(Reverse(ArchiveCandidate {
            sequence,
            path,
            order,
        }));
    }

    #[must_use]
    pub fn peek(&self) -> Option<&ArchiveCandidate> {
        self.heap.peek().map(|entry| &entry.0)
    }

    pub fn pop(&mut self) -> Option<ArchiveCandidate> {
        let candidate = self.heap.pop().map(|entry| entry.0)?;
        self.queued.remove(&candidate.sequence.value());
        Some(candidate)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.queued.clear();
    }
}

/// Where archived logs come from.
#[derive(Debug, Clone)]
pub enum DiscoveryMode {
    /// Scan `<db_recovery_file_dest>/<context>/archivelog/<day>/` two levels
    /// deep, the layout the database's own archiver produces.
    RecoveryDest,
    /// An explicit batch of files and directories, consumed once.
    Batch(Vec<PathBuf>),
}

/// Repeatedly lists candidate archived logs and feeds the queue.
#[derive(Debug)]
pub struct ArchiveDiscovery {
    mode: DiscoveryMode,
    format: String,
    mapping: PathMapping,
    recovery_dest: PathBuf,
    context: String,
    /// Day directories strictly below this were fully drained; the day
    /// itself is re-scanned since the archiver may still write into it.
    last_checked_day: Option<String>,
    batch_consumed: bool,
}

impl ArchiveDiscovery {
    #[must_use]
    pub fn new(
        mode: DiscoveryMode,
        format: String,
        mapping: PathMapping,
        recovery_dest: PathBuf,
        context: String,
    ) -> Self {
        Self {
            mode,
            format,
            mapping,
            recovery_dest,
            context,
            last_checked_day: None,
            batch_consumed: false,
        }
    }

    /// Enqueue every candidate with a sequence at or past `floor`.
    pub fn discover(&mut self, floor: Seq, queue: &mut ArchiveQueue) -> Result<()> {
        match self.mode.clone() {
            DiscoveryMode::RecoveryDest => self.discover_recovery_dest(floor, queue),
            DiscoveryMode::Batch(paths) => {
                if self.batch_consumed {
                    return Ok(());
                }
                self.discover_batch(&paths, floor, queue)?;
                self.batch_consumed = true;
                Ok(())
            }
        }
    }

    fn consider(&self, name: &str, full_path: PathBuf, floor: Seq, queue: &mut ArchiveQueue) {
        let sequence = sequence_from_file_name(&self.format, name);
        trace!(path = %full_path.display(), sequence = %sequence, "archive candidate");
        if sequence.is_zero() || sequence < floor {
            return;
        }
        queue.push(sequence, full_path);
    }

    fn discover_recovery_dest(&mut self, floor: Seq, queue: &mut ArchiveQueue) -> Result<()> {
        if self.format.is_empty() {
            return Err(RedotailError::MissingArchiveFormat);
        }
        let root = self
            .mapping
            .apply(&self.recovery_dest.join(&self.context).join("archivelog"));
        trace!(path = %root.display(), "checking archive root");

        let entries = std::fs::read_dir(&root)
            .map_err(|_| RedotailError::DirectoryUnreadable { path: root.clone() })?;

        let mut newest_day: Option<String> = None;
        for entry in entries.flatten() {
            let day_name = entry.file_name().to_string_lossy().into_owned();
            let day_path = root.join(&day_name);
            let Ok(file_type) = entry.file_type() else {
                warn!(path = %day_path.display(), "can't stat archive entry");
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            // Fully drained days need no second look.
            if let Some(last) = &self.last_checked_day {
                if day_name.as_str() < last.as_str() {
                    continue;
                }
            }

            let day_entries = std::fs::read_dir(&day_path)
                .map_err(|_| RedotailError::DirectoryUnreadable { path: day_path.clone() })?;
            for file_entry in day_entries.flatten() {
                let file_name = file_entry.file_name().to_string_lossy().into_owned();
                self.consider(&file_name, day_path.join(&file_name), floor, queue);
            }

            match &newest_day {
                Some(newest) if newest.as_str() >= day_name.as_str() => {}
                _ => newest_day = Some(day_name),
            }
        }

        if let Some(newest) = newest_day {
            if self.last_checked_day.as_deref() != Some(newest.as_str()) {
                trace!(day = %newest, "updating last checked day");
            }
            self.last_checked_day = Some(newest);
        }
        Ok(())
    }

    fn discover_batch(
        &self,
        paths: &[PathBuf],
        floor: Seq,
        queue: &mut ArchiveQueue,
    ) -> Result<()> {
        for path in paths {
            let mapped = self.mapping.apply(path);
            let Ok(stat) = std::fs::metadata(&mapped) else {
                warn!(path = %mapped.display(), "can't stat batch entry");
                continue;
            };
            if stat.is_dir() {
                let entries = std::fs::read_dir(&mapped).map_err(|_| {
                    RedotailError::DirectoryUnreadable {
                        path: mapped.clone(),
                    }
                })?;
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    self.consider(&name, mapped.join(&name), floor, queue);
                }
            } else {
                let name = mapped
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.consider(&name, mapped.clone(), floor, queue);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FORMAT: &str = "o1_mf_%t_%s_%h_.arc";

    #[test]
    fn extracts_sequence_from_standard_name() {
        assert_eq!(
            sequence_from_file_name(FORMAT, "o1_mf_1_527_lo541v2n_.arc"),
            Seq::new(527)
        );
    }

    #[test]
    fn rejects_foreign_names() {
        assert_eq!(sequence_from_file_name(FORMAT, "README.txt"), Seq::ZERO);
        assert_eq!(sequence_from_file_name(FORMAT, "o1_mf_1__x_.arc"), Seq::ZERO);
        // Trailing garbage after the template.
        assert_eq!(
            sequence_from_file_name(FORMAT, "o1_mf_1_527_lo541v2n_.arc.bak"),
            Seq::ZERO
        );
        // Template ends after a bare percent.
        assert_eq!(sequence_from_file_name("log_%", "log_1"), Seq::ZERO);
    }

    #[test]
    fn thread_and_resetlogs_fields_are_discarded() {
        let format = "arch_%t_%r_%s.log";
        assert_eq!(
            sequence_from_file_name(format, "arch_2_931_88.log"),
            Seq::new(88)
        );
    }

    /// Expanding the template and re-extracting yields the same sequence.
    fn expand(format: &str, sequence: u32, thread: u32, resetlogs: u32, hash: &str) -> String {
        let mut out = String::new();
        let bytes = format.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' && i + 1 < bytes.len() {
                match bytes[i + 1] {
                    b's' | b'S' => out.push_str(&sequence.to_string()),
                    b't' | b'T' => out.push_str(&thread.to_string()),
                    b'r' => out.push_str(&resetlogs.to_string()),
                    b'a' => out.push_str("7"),
                    b'd' => out.push_str("3"),
                    b'h' => out.push_str(hash),
                    other => out.push(char::from(other)),
                }
                i += 2;
            } else {
                out.push(char::from(bytes[i]));
                i += 1;
            }
        }
        out
    }

    proptest! {
        #[test]
        fn matcher_is_left_inverse_of_expansion(
            sequence in 1u32..1_000_000,
            thread in 1u32..64,
            resetlogs in 1u32..100_000,
            hash in "[0-9a-z]{4,10}",
        ) {
            for format in [FORMAT, "arch_%t_%r_%s.log", "%S_%a_%d.arc"] {
                let name = expand(format, sequence, thread, resetlogs, &hash);
                prop_assert_eq!(
                    sequence_from_file_name(format, &name),
                    Seq::new(sequence)
                );
            }
        }
    }

    #[test]
    fn queue_orders_by_sequence_and_dedups() {
        let mut queue = ArchiveQueue::new();
        queue.push(Seq::new(102), PathBuf::from("b"));
        queue.push(Seq::new(100), PathBuf::from("a"));
        queue.push(Seq::new(101), PathBuf::from("c"));
        queue.push(Seq::new(100), PathBuf::from("duplicate"));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop().expect("head").sequence, Seq::new(100));
        assert_eq!(queue.pop().expect("head").sequence, Seq::new(101));
        assert_eq!(queue.pop().expect("head").sequence, Seq::new(102));
        assert!(queue.is_empty());

        // Once popped, the sequence may be enqueued again.
        queue.push(Seq::new(100), PathBuf::from("a"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn path_mapping_rewrites_prefix() {
        let mapping = PathMapping::new(vec![("/ora".to_owned(), "/mnt/ora".to_owned())]);
        assert_eq!(
            mapping.apply(Path::new("/ora/arch/f.arc")),
            PathBuf::from("/mnt/ora/arch/f.arc")
        );
        assert_eq!(
            mapping.apply(Path::new("/other/f.arc")),
            PathBuf::from("/other/f.arc")
        );
    }

    fn touch(path: &Path) {
        std::fs::write(path, b"x").expect("touch");
    }

    #[test]
    fn recovery_dest_scan_two_levels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let arch = dir.path().join("ORCL/archivelog");
        std::fs::create_dir_all(arch.join("2025_07_01")).expect("day 1");
        std::fs::create_dir_all(arch.join("2025_07_02")).expect("day 2");
        touch(&arch.join("2025_07_01/o1_mf_1_100_aaaa_.arc"));
        touch(&arch.join("2025_07_01/ignore.me"));
        touch(&arch.join("2025_07_02/o1_mf_1_101_bbbb_.arc"));
        touch(&arch.join("2025_07_02/o1_mf_1_99_cccc_.arc"));

        let mut discovery = ArchiveDiscovery::new(
            DiscoveryMode::RecoveryDest,
            FORMAT.to_owned(),
            PathMapping::default(),
            dir.path().to_path_buf(),
            "ORCL".to_owned(),
        );
        let mut queue = ArchiveQueue::new();
        discovery
            .discover(Seq::new(100), &mut queue)
            .expect("discover");

        // Sequence 99 is below the floor, ignore.me fails the template.
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().expect("head").sequence, Seq::new(100));
        assert_eq!(queue.pop().expect("head").sequence, Seq::new(101));

        // Re-discovery skips days before the last checked one but re-scans
        // the newest day.
        touch(&arch.join("2025_07_02/o1_mf_1_102_dddd_.arc"));
        touch(&arch.join("2025_07_01/o1_mf_1_150_eeee_.arc"));
        discovery
            .discover(Seq::new(100), &mut queue)
            .expect("re-discover");
        let sequences: Vec<u32> = std::iter::from_fn(|| queue.pop())
            .map(|candidate| candidate.sequence.value())
            .collect();
        // 150 lives in an already-drained day and is skipped; the newest
        // day is re-scanned, dropping 99 below the floor again.
        assert_eq!(sequences, vec![101, 102]);
    }

    #[test]
    fn batch_mode_is_one_shot() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("o1_mf_1_200_ffff_.arc"));
        touch(&dir.path().join("o1_mf_1_201_gggg_.arc"));

        let mut discovery = ArchiveDiscovery::new(
            DiscoveryMode::Batch(vec![dir.path().to_path_buf()]),
            FORMAT.to_owned(),
            PathMapping::default(),
            PathBuf::new(),
            String::new(),
        );
        let mut queue = ArchiveQueue::new();
        discovery.discover(Seq::ZERO, &mut queue).expect("discover");
        assert_eq!(queue.len(), 2);

        discovery
            .discover(Seq::ZERO, &mut queue)
            .expect("second discover");
        assert_eq!(queue.len(), 2, "batch is consumed once");
    }

    #[test]
    fn missing_root_is_an_error() {
        let mut discovery = ArchiveDiscovery::new(
            DiscoveryMode::RecoveryDest,
            FORMAT.to_owned(),
            PathMapping::default(),
            PathBuf::from("/nonexistent-redotail"),
            "X".to_owned(),
        );
        let mut queue = ArchiveQueue::new();
        let err = discovery
            .discover(Seq::ZERO, &mut queue)
            .expect_err("must fail");
        assert!(matches!(err, RedotailError::DirectoryUnreadable { .. }));
    }
}
