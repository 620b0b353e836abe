//! Redo log reading: on-disk block validation, the bounded read ring and the
//! reader state machine.
//!
//! One [`Reader`] owns one log-file descriptor and a ring of fixed-size
//! chunks. Its thread runs a four-state machine (`SLEEPING`/`CHECK`/`UPDATE`/
//! `READ`) driven entirely from the outside through the handle methods; while
//! in `READ` it is the single producer filling the ring with checksum-verified
//! blocks, and the downstream consumer advances the other end through
//! [`Reader::confirm_read_data`].

pub mod block;
pub mod metrics;
mod reader;
mod ring;

pub use reader::{Reader, ReaderStatus};
