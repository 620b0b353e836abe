//! End-to-end control-loop scenarios against synthetic logs on disk.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use redotail_error::Result;
use redotail_replicator::metadata::Metadata;
use redotail_replicator::{Config, Replicator};
use redotail_testkit::LogSpec;
use redotail_types::ctx::RunCtx;
use redotail_types::{Scn, Seq};

const FORMAT: &str = "o1_mf_%t_%s_%h_.arc";

fn write_archived(dir: &Path, sequence: u32, first_scn: u64, next_scn: u64) {
    let spec = LogSpec::archived(sequence, first_scn, next_scn, 8);
    let name = format!("o1_mf_1_{sequence}_abcdef_.arc");
    redotail_testkit::write_log(&dir.join(name), &spec).expect("write archived log");
}

fn batch_config(dir: &Path, start_sequence: Option<u32>, stop_log_switches: u64) -> Config {
    let start = match start_sequence {
        Some(sequence) => format!(r#""start-sequence": {sequence},"#),
        None => String::new(),
    };
    let raw = format!(
        r#"{{
            "sources": [{{
                "alias": "test",
                "name": "TESTDB",
                "reader": {{
                    "type": "batch",
                    "redo-read-sleep-us": 5000,
                    "arch-read-sleep-us": 20000,
                    "arch-read-tries": 3,
                    "refresh-interval-us": 50000
                }},
                "memory": {{ "min-mb": 4, "max-mb": 4 }},
                "flags": 3,
                {start}
                "stop-log-switches": {stop_log_switches},
                "log-archive-format": "{FORMAT}",
                "redo-log-batch": ["{}"]
            }}]
        }}"#,
        dir.display()
    );
    Config::from_json(&raw).expect("config parses")
}

fn online_config(
    online_path: &Path,
    recovery_dest: &Path,
    start_sequence: u32,
    stop_log_switches: u64,
) -> Config {
    let raw = format!(
        r#"{{
            "sources": [{{
                "alias": "test",
                "name": "TESTDB",
                "reader": {{
                    "type": "online",
                    "redo-read-sleep-us": 5000,
                    "arch-read-sleep-us": 20000,
                    "arch-read-tries": 3,
                    "refresh-interval-us": 100000
                }},
                "memory": {{ "min-mb": 4, "max-mb": 4 }},
                "flags": 2,
                "start-sequence": {start_sequence},
                "stop-log-switches": {stop_log_switches},
                "log-archive-format": "{FORMAT}",
                "db-recovery-file-dest": "{}",
                "context": "TESTDB",
                "online-redo-logs": [{{ "group": 1, "paths": ["{}"] }}]
            }}]
        }}"#,
        recovery_dest.display(),
        online_path.display()
    );
    Config::from_json(&raw).expect("config parses")
}

struct Harness {
    ctx: Arc<RunCtx>,
    metadata: Arc<Metadata>,
    thread: Option<std::thread::JoinHandle<()>>,
    result: mpsc::Receiver<Result<()>>,
}

impl Harness {
    fn start(config: &Config) -> Self {
        let source = config.sources[0].clone();
        let ctx = source.build_ctx();
        let metadata = Arc::new(Metadata::new(source.facts()));
        metadata.request_replication();

        let mut replicator = Replicator::new(Arc::clone(&ctx), Arc::clone(&metadata), &source);
        let (sender, receiver) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("replicator-test".to_owned())
            .spawn(move || {
                let _ = sender.send(replicator.run());
            })
            .expect("spawn replicator");

        Self {
            ctx,
            metadata,
            thread: Some(thread),
            result: receiver,
        }
    }

    /// Wait for a self-terminating run (stop-log-switches) to finish.
    fn join(mut self, deadline: Duration) -> Result<()> {
        let result = self
            .result
            .recv_timeout(deadline)
            .expect("replicator finished in time");
        self.thread.take().expect("thread").join().expect("join");
        result
    }

    /// Stop an open-ended run and collect its result.
    fn stop(self, deadline: Duration) -> Result<()> {
        self.ctx.stop_soft();
        self.join(deadline)
    }
}

const DEADLINE: Duration = Duration::from_secs(30);

/// Archived logs 100..=103 roll forward in order; each commit advances the
/// sequence by one and records that file's SCN range.
#[test]
fn s1_archived_roll_forward() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_archived(dir.path(), 100, 1000, 2000);
    write_archived(dir.path(), 101, 2000, 3000);
    write_archived(dir.path(), 102, 3000, 4000);
    write_archived(dir.path(), 103, 4000, 5000);

    let config = batch_config(dir.path(), Some(100), 4);
    let harness = Harness::start(&config);
    let metadata = Arc::clone(&harness.metadata);
    harness.join(DEADLINE).expect("clean run");

    assert_eq!(metadata.sequence(), Seq::new(104));
    assert_eq!(metadata.first_scn(), Scn::new(4000));
    assert_eq!(metadata.next_scn(), Scn::new(5000));
}

/// A missing sequence is a gap: warn, sleep, re-discover, never advance.
#[test]
fn s2_gap_keeps_sequence() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_archived(dir.path(), 102, 3000, 4000);

    let config = batch_config(dir.path(), Some(100), 0);
    let harness = Harness::start(&config);
    let metadata = Arc::clone(&harness.metadata);

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(metadata.sequence(), Seq::new(100), "gap must not advance");
    assert!(metadata.next_scn().is_none(), "file 102 was not processed");

    harness.stop(DEADLINE).expect("clean stop");
    assert_eq!(metadata.sequence(), Seq::new(100));
}

/// With no position configured, the oldest discovered file donates its
/// sequence.
#[test]
fn adopts_sequence_from_first_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_archived(dir.path(), 200, 1000, 2000);
    write_archived(dir.path(), 201, 2000, 3000);

    let config = batch_config(dir.path(), None, 2);
    let harness = Harness::start(&config);
    let metadata = Arc::clone(&harness.metadata);
    harness.join(DEADLINE).expect("clean run");

    assert_eq!(metadata.sequence(), Seq::new(202));
}

/// Restarting with a checkpointed sequence skips everything below it.
#[test]
fn resume_skips_processed_sequences() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_archived(dir.path(), 100, 1000, 2000);
    write_archived(dir.path(), 101, 2000, 3000);
    write_archived(dir.path(), 102, 3000, 4000);
    write_archived(dir.path(), 103, 4000, 5000);

    let config = batch_config(dir.path(), Some(102), 2);
    let harness = Harness::start(&config);
    let metadata = Arc::clone(&harness.metadata);
    harness.join(DEADLINE).expect("clean run");

    // Only 102 and 103 were processed.
    assert_eq!(metadata.sequence(), Seq::new(104));
    assert_eq!(metadata.first_scn(), Scn::new(4000));
}

/// A completed online log advances the sequence like an archived one.
#[test]
fn online_log_switch_advances_sequence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let online = dir.path().join("redo01a.log");
    let spec = LogSpec {
        sequence: 250,
        first_scn: 5000,
        next_scn: Some(6000),
        payload_blocks: 8,
        declared_blocks: Some(10),
        ..LogSpec::default()
    };
    redotail_testkit::write_log(&online, &spec).expect("write online log");

    let fra = dir.path().join("fra");
    std::fs::create_dir_all(fra.join("TESTDB/archivelog")).expect("archive root");

    let config = online_config(&online, &fra, 250, 1);
    let harness = Harness::start(&config);
    let metadata = Arc::clone(&harness.metadata);
    harness.join(DEADLINE).expect("clean run");

    assert_eq!(metadata.sequence(), Seq::new(251));
    assert_eq!(metadata.first_scn(), Scn::new(5000));
    assert_eq!(metadata.next_scn(), Scn::new(6000));
}

/// An overwritten online log is abandoned; the archived copy of the same
/// sequence finishes the job.
#[test]
fn s3_online_overwrite_falls_back_to_archive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let online = dir.path().join("redo01a.log");
    let spec = LogSpec::online(250, 5000, 8);
    redotail_testkit::write_log(&online, &spec).expect("write online log");
    // The database wrapped past our position: the tail belongs to 251 now.
    redotail_testkit::overwrite_with_sequence(&online, &spec, 5, 251).expect("wrap tail");

    let fra = dir.path().join("fra");
    let day = fra.join("TESTDB/archivelog/2025_07_01");
    std::fs::create_dir_all(&day).expect("archive day dir");

    let config = online_config(&online, &fra, 250, 1);
    let harness = Harness::start(&config);
    let metadata = Arc::clone(&harness.metadata);

    // The archiver lands the closed copy of 250 shortly after the wrap.
    std::thread::sleep(Duration::from_millis(200));
    write_archived(&day, 250, 5000, 6000);

    harness.join(DEADLINE).expect("clean run");
    assert_eq!(metadata.sequence(), Seq::new(251));
    assert_eq!(metadata.next_scn(), Scn::new(6000));
}

/// A missing schema snapshot is fatal even with the failsafe set; only an
/// unknown start position may fall back to "waiting for further commands".
#[test]
fn schema_missing_is_fatal_despite_failsafe() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_archived(dir.path(), 100, 1000, 2000);

    // Flags without the schemaless bit: boot cannot complete.
    let raw = format!(
        r#"{{
            "sources": [{{
                "alias": "test",
                "name": "TESTDB",
                "reader": {{ "type": "batch" }},
                "memory": {{ "min-mb": 4, "max-mb": 4 }},
                "flags": 1,
                "boot-failsafe": true,
                "log-archive-format": "{FORMAT}",
                "redo-log-batch": ["{}"]
            }}]
        }}"#,
        dir.path().display()
    );
    let config = Config::from_json(&raw).expect("config parses");

    let harness = Harness::start(&config);
    let ctx = Arc::clone(&harness.ctx);
    let metadata = Arc::clone(&harness.metadata);

    let result = harness.join(DEADLINE);
    assert!(
        result.is_err(),
        "schema-missing boot failure must be fatal regardless of the failsafe"
    );
    assert_eq!(metadata.first_scn(), Scn::NONE, "nothing was replicated");
    // The harness cleans up the reader threads it spawned.
    ctx.stop_soft();
}

/// With no start hint, no checkpoint and nothing to derive a position from,
/// boot fails with an unknown start position; that one failure is absorbed
/// by the failsafe and the source parks in the ready state.
#[test]
fn unknown_start_position_waits_with_failsafe() {
    let dir = tempfile::tempdir().expect("tempdir");
    let online = dir.path().join("redo01a.log");
    let spec = LogSpec::online(100, 1000, 4);
    redotail_testkit::write_log(&online, &spec).expect("write online log");

    let fra = dir.path().join("fra");
    std::fs::create_dir_all(fra.join("TESTDB/archivelog")).expect("archive root");

    let raw = format!(
        r#"{{
            "sources": [{{
                "alias": "test",
                "name": "TESTDB",
                "reader": {{ "type": "online", "redo-read-sleep-us": 5000 }},
                "memory": {{ "min-mb": 4, "max-mb": 4 }},
                "flags": 2,
                "boot-failsafe": true,
                "log-archive-format": "{FORMAT}",
                "db-recovery-file-dest": "{}",
                "context": "TESTDB",
                "online-redo-logs": [{{ "group": 1, "paths": ["{}"] }}]
            }}]
        }}"#,
        fra.display(),
        online.display()
    );
    let config = Config::from_json(&raw).expect("config parses");

    let harness = Harness::start(&config);
    let metadata = Arc::clone(&harness.metadata);

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(
        metadata.status(),
        redotail_replicator::metadata::MetadataStatus::Ready,
        "unknown start position must fall back to the ready state"
    );
    assert!(!metadata.is_positioned(), "no position was invented");
    assert_eq!(metadata.first_scn(), Scn::NONE, "nothing was replicated");

    harness.stop(DEADLINE).expect("clean stop");
}

/// Without the failsafe the same boot failure is fatal.
#[test]
fn boot_failure_without_failsafe_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_archived(dir.path(), 100, 1000, 2000);

    let raw = format!(
        r#"{{
            "sources": [{{
                "alias": "test",
                "name": "TESTDB",
                "reader": {{ "type": "batch" }},
                "memory": {{ "min-mb": 4, "max-mb": 4 }},
                "flags": 1,
                "log-archive-format": "{FORMAT}",
                "redo-log-batch": ["{}"]
            }}]
        }}"#,
        dir.path().display()
    );
    let config = Config::from_json(&raw).expect("config parses");

    let harness = Harness::start(&config);
    let ctx = Arc::clone(&harness.ctx);
    let result = harness.join(DEADLINE);
    assert!(result.is_err(), "boot failure must be fatal");
    // The harness cleans up the reader threads it spawned.
    ctx.stop_soft();
}
