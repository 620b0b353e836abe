//! Process-level pipeline manager.
//!
//! One [`Pipeline`] owns every configured source: its run context, its
//! checkpoint metadata and its replicator thread. A fatal error in any
//! source hard-stops the others; a clean soft shutdown drains them all and
//! saves their checkpoints.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use redotail_error::{RedotailError, Result};
use redotail_replicator::metadata::Metadata;
use redotail_replicator::{Config, Replicator};
use redotail_types::ctx::RunCtx;
use tracing::{error, info};

struct SourceRuntime {
    alias: String,
    ctx: Arc<RunCtx>,
    metadata: Arc<Metadata>,
    checkpoint_path: Option<PathBuf>,
    thread: Option<JoinHandle<()>>,
    result: mpsc::Receiver<Result<()>>,
}

/// Running replication pipeline: one replicator thread per source.
pub struct Pipeline {
    sources: Vec<SourceRuntime>,
}

impl Pipeline {
    /// Spawn every configured source.
    pub fn start(config: &Config) -> Result<Self> {
        if config.sources.is_empty() {
            return Err(RedotailError::config("no sources configured"));
        }

        // A fatal error in any source hard-stops every other one; the list
        // is shared with the replicator threads for that fan-out.
        let all_contexts: Arc<Mutex<Vec<Arc<RunCtx>>>> = Arc::new(Mutex::new(Vec::new()));

        let mut sources = Vec::with_capacity(config.sources.len());
        for source_config in &config.sources {
            let ctx = source_config.build_ctx();
            all_contexts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&ctx));
            let metadata = Arc::new(Metadata::new(source_config.facts()));
            metadata.set_incarnations(source_config.incarnations.clone());

            if let Some(path) = &source_config.checkpoint_path {
                if metadata.load_checkpoint(path)? {
                    info!(
                        alias = %source_config.alias,
                        sequence = %metadata.sequence(),
                        offset = %metadata.file_offset(),
                        "checkpoint restored"
                    );
                }
            }

            // No writer component runs inside this core; downstream is
            // considered ready as soon as the pipeline is up.
            metadata.request_replication();

            let mut replicator = Replicator::new(
                Arc::clone(&ctx),
                Arc::clone(&metadata),
                source_config,
            );
            let (sender, receiver) = mpsc::channel();
            let fanout = Arc::clone(&all_contexts);
            let alias = source_config.alias.clone();
            let thread_alias = alias.clone();
            let thread = std::thread::Builder::new()
                .name(format!("replicator-{alias}"))
                .spawn(move || {
                    let result = replicator.run();
                    if let Err(err) = &result {
                        error!(alias = %thread_alias, error = %err, "replicator failed");
                        let contexts = fanout.lock().unwrap_or_else(PoisonError::into_inner);
                        for ctx in contexts.iter() {
                            ctx.stop_hard();
                        }
                    }
                    let _ = sender.send(result);
                })
                .map_err(|err| RedotailError::internal(format!("spawn replicator: {err}")))?;

            sources.push(SourceRuntime {
                alias,
                ctx,
                metadata,
                checkpoint_path: source_config.checkpoint_path.clone(),
                thread: Some(thread),
                result: receiver,
            });
        }

        Ok(Self { sources })
    }

    /// Contexts of every source, e.g. for a signal handler.
    #[must_use]
    pub fn contexts(&self) -> Vec<Arc<RunCtx>> {
        self.sources
            .iter()
            .map(|source| Arc::clone(&source.ctx))
            .collect()
    }

    /// Metadata handles of every source, in configuration order.
    #[must_use]
    pub fn metadata(&self) -> Vec<Arc<Metadata>> {
        self.sources
            .iter()
            .map(|source| Arc::clone(&source.metadata))
            .collect()
    }

    /// Request a cooperative stop of every source.
    pub fn stop(&self) {
        for source in &self.sources {
            source.ctx.stop_soft();
        }
    }

    /// Join every source, persist checkpoints, and report the first failure.
    pub fn wait(mut self) -> Result<()> {
        let mut first_error: Option<RedotailError> = None;

        for source in &mut self.sources {
            let outcome = match source.thread.take() {
                Some(thread) => {
                    let result = source
                        .result
                        .recv()
                        .unwrap_or_else(|_| {
                            Err(RedotailError::ThreadLost {
                                name: source.alias.clone(),
                            })
                        });
                    if thread.join().is_err() {
                        Err(RedotailError::ThreadLost {
                            name: source.alias.clone(),
                        })
                    } else {
                        result
                    }
                }
                None => Ok(()),
            };

            match outcome {
                Ok(()) => {
                    if let Some(path) = &source.checkpoint_path {
                        if let Err(err) = source.metadata.save_checkpoint(path) {
                            error!(alias = %source.alias, error = %err, "checkpoint save failed");
                        } else {
                            info!(
                                alias = %source.alias,
                                sequence = %source.metadata.sequence(),
                                "checkpoint saved"
                            );
                        }
                    }
                }
                Err(err) => {
                    error!(alias = %source.alias, error = %err, "source ended with error");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redotail_testkit::LogSpec;
    use redotail_types::{Scn, Seq};

    #[test]
    fn empty_config_is_rejected() {
        let config = Config::from_json(r#"{"sources": []}"#).expect("parse");
        assert!(Pipeline::start(&config).is_err());
    }

    /// Full stack: config → pipeline → replicator → reader → checkpoint.
    #[test]
    fn pipeline_processes_batch_and_checkpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = LogSpec::archived(500, 100, 200, 4);
        redotail_testkit::write_log(&dir.path().join("o1_mf_1_500_aaaa_.arc"), &spec)
            .expect("write log");
        let checkpoint = dir.path().join("checkpoint.json");

        let raw = format!(
            r#"{{
                "sources": [{{
                    "alias": "main",
                    "name": "TESTDB",
                    "reader": {{
                        "type": "batch",
                        "arch-read-sleep-us": 20000,
                        "redo-read-sleep-us": 5000
                    }},
                    "memory": {{ "min-mb": 4, "max-mb": 4 }},
                    "flags": 3,
                    "start-sequence": 500,
                    "stop-log-switches": 1,
                    "log-archive-format": "o1_mf_%t_%s_%h_.arc",
                    "redo-log-batch": ["{}"],
                    "checkpoint-path": "{}"
                }}]
            }}"#,
            dir.path().display(),
            checkpoint.display()
        );
        let config = Config::from_json(&raw).expect("config");

        let pipeline = Pipeline::start(&config).expect("start");
        let metadata = pipeline.metadata().remove(0);
        pipeline.wait().expect("clean run");

        assert_eq!(metadata.sequence(), Seq::new(501));
        assert_eq!(metadata.next_scn(), Scn::new(200));
        assert!(checkpoint.exists(), "checkpoint snapshot written");

        // A fresh pipeline restores the saved position.
        let restored = Arc::new(Metadata::new(config.sources[0].facts()));
        assert!(restored.load_checkpoint(&checkpoint).expect("load"));
        assert_eq!(restored.sequence(), Seq::new(501));
    }
}
