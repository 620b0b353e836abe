//! Replication control: archived-log discovery, checkpoint metadata and the
//! per-source control loop.
//!
//! The [`Replicator`] owns one source database's reader fleet: a single
//! archived reader (group 0) fed by [`archive::ArchiveDiscovery`], and one
//! reader per online log group. It serializes sequence advancement through
//! [`metadata::Metadata`], the boundary to the external checkpoint store.

pub mod archive;
pub mod config;
pub mod metadata;
mod replicator;
mod stream;

pub use config::{Config, SourceConfig};
pub use replicator::Replicator;
pub use stream::RecordStream;
