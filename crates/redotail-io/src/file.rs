//! Local-filesystem backend.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use redotail_error::Result;
use tracing::trace;

use crate::BlockIo;

/// Positional reads against a local file.
///
/// Reads past the current end return 0 bytes without error; an online log
/// being appended to simply has no data there yet.
#[derive(Debug, Default)]
pub struct FileBlockIo {
    file: Option<File>,
}

impl FileBlockIo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockIo for FileBlockIo {
    fn open(&mut self, path: &Path) -> Result<u64> {
        self.close();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        trace!(path = %path.display(), size, "opened redo log");
        self.file = Some(file);
        Ok(size)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let Some(file) = self.file.as_ref() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "read on a closed log file",
            )
            .into());
        };

        // Loop over short reads so a partial result only ever means EOF.
        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(done)
    }

    fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_at_past_eof_returns_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("redo01.log");
        std::fs::write(&path, b"0123456789").expect("write fixture");

        let mut io = FileBlockIo::new();
        assert_eq!(io.open(&path).expect("open"), 10);

        let mut buf = [0u8; 4];
        assert_eq!(io.read_at(&mut buf, 2).expect("read"), 4);
        assert_eq!(&buf, b"2345");

        assert_eq!(io.read_at(&mut buf, 100).expect("read past eof"), 0);
        // Short tail read.
        assert_eq!(io.read_at(&mut buf, 8).expect("tail"), 2);
        assert_eq!(&buf[..2], b"89");
    }

    #[test]
    fn read_on_closed_handle_is_an_error() {
        let mut io = FileBlockIo::new();
        let mut buf = [0u8; 1];
        assert!(io.read_at(&mut buf, 0).is_err());
    }

    #[test]
    fn reopen_observes_growth() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("redo02.log");
        std::fs::write(&path, b"aaaa").expect("write fixture");

        let mut io = FileBlockIo::new();
        assert_eq!(io.open(&path).expect("open"), 4);

        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("append open");
        f.write_all(b"bbbb").expect("append");
        drop(f);

        // Same handle sees the appended bytes without reopening.
        let mut buf = [0u8; 8];
        assert_eq!(io.read_at(&mut buf, 0).expect("read grown"), 8);
        assert_eq!(&buf, b"aaaabbbb");
    }
}
