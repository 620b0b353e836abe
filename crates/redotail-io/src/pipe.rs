//! Shell-pipe backend: mirror a remote or ASM file into memory.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use redotail_error::{RedotailError, Result};
use redotail_types::ctx::RunCtx;
use tracing::{debug, info, trace};

use crate::BlockIo;

const STREAM_CHUNK: usize = 64 * 1024;
const PROGRESS_EVERY: u64 = 64 * 1024 * 1024;

/// Streams the stdout of a configured command into an in-memory mirror and
/// serves all subsequent reads from it.
///
/// The command template substitutes `{path}` with the log path, e.g.
/// `ssh loghost cat {path}` or a wrapper script that runs `asmcmd cp` through
/// a FIFO on the database host. Credentials and host details belong to the
/// command/ssh configuration, never to this process.
///
/// Append-closed: the mirror is complete when `open` returns. Archived logs
/// only.
pub struct PipeBlockIo {
    command_template: String,
    ctx: Arc<RunCtx>,
    mirror: Vec<u8>,
}

impl PipeBlockIo {
    #[must_use]
    pub fn new(command_template: String, ctx: Arc<RunCtx>) -> Self {
        Self {
            command_template,
            ctx,
            mirror: Vec::new(),
        }
    }

    fn render_command(&self, path: &Path) -> String {
        self.command_template
            .replace("{path}", &path.display().to_string())
    }
}

impl BlockIo for PipeBlockIo {
    fn open(&mut self, path: &Path) -> Result<u64> {
        self.close();
        let command = self.render_command(path);
        debug!(command = %command, "mirroring log through shell pipe");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| RedotailError::internal("child stdout not captured"))?;

        let mut mirror = Vec::new();
        let mut chunk = vec![0u8; STREAM_CHUNK];
        let mut next_progress = PROGRESS_EVERY;
        loop {
            if self.ctx.is_hard_shutdown() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RedotailError::internal("shutdown during transfer"));
            }
            match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    mirror.extend_from_slice(&chunk[..n]);
                    if mirror.len() as u64 >= next_progress {
                        trace!(loaded = mirror.len(), "mirror transfer progress");
                        next_progress += PROGRESS_EVERY;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(err.into());
                }
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(RedotailError::CommandFailed {
                command,
                status: status.code().unwrap_or(-1),
            });
        }
        if mirror.is_empty() {
            return Err(RedotailError::EmptyTransfer {
                path: path.to_path_buf(),
            });
        }

        info!(
            path = %path.display(),
            size = mirror.len(),
            "log mirrored to memory"
        );
        self.mirror = mirror;
        Ok(self.mirror.len() as u64)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.mirror.len() {
            return Ok(0);
        }
        let available = self.mirror.len() - offset;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self.mirror[offset..offset + n]);
        Ok(n)
    }

    fn close(&mut self) {
        self.mirror = Vec::new();
    }

    fn is_append_closed(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redotail_types::ctx::RunCtxConfig;

    fn ctx() -> Arc<RunCtx> {
        Arc::new(RunCtx::new(RunCtxConfig::default()))
    }

    #[test]
    fn mirrors_a_file_through_cat() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("arch_100.arc");
        std::fs::write(&path, b"redo bytes here").expect("write fixture");

        let mut io = PipeBlockIo::new("cat {path}".to_owned(), ctx());
        assert_eq!(io.open(&path).expect("open"), 15);

        let mut buf = [0u8; 4];
        assert_eq!(io.read_at(&mut buf, 5).expect("read"), 4);
        assert_eq!(&buf, b"byte");
        assert_eq!(io.read_at(&mut buf, 99).expect("past end"), 0);
    }

    #[test]
    fn failing_command_is_reported() {
        let mut io = PipeBlockIo::new("exit 3".to_owned(), ctx());
        let err = io.open(Path::new("/nonexistent")).expect_err("must fail");
        match err {
            RedotailError::CommandFailed { status, .. } => assert_eq!(status, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_transfer_is_an_error() {
        let mut io = PipeBlockIo::new("true".to_owned(), ctx());
        let err = io.open(Path::new("/whatever")).expect_err("must fail");
        assert!(matches!(err, RedotailError::EmptyTransfer { .. }));
    }

    #[test]
    fn close_drops_the_mirror() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("arch_101.arc");
        std::fs::write(&path, b"x").expect("write fixture");

        let mut io = PipeBlockIo::new("cat {path}".to_owned(), ctx());
        io.open(&path).expect("open");
        io.close();
        let mut buf = [0u8; 1];
        assert_eq!(io.read_at(&mut buf, 0).expect("read closed"), 0);
    }
}
