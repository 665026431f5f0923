//! Share record wire format shared by the stats engine roles.
//!
//! Every share travels as a fixed 48-byte little-endian record, both on the
//! ingest bus and in the on-disk binary share log. This crate owns that
//! layout plus the day-file naming convention, so writer, replayer and the
//! live aggregator cannot drift apart.

pub mod files;
pub mod share;

pub use files::sharelog_file_path;
pub use share::{Share, ShareCodecError, ShareResult, WorkerKey, SHARE_RECORD_SIZE};
