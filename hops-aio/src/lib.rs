// hops-aio/src/lib.rs
//! IO primitives for hops: processes, checksums, archives, filesystem, json, locks.

pub mod checksum;
pub mod extract;
pub mod fs;
pub mod json_io;
pub mod lock;
pub mod process;

pub use checksum::{sha256_file, verify_checksum_async, verify_checksum_sync};
pub use extract::{extract_archive, extract_archive_async, infer_archive_root_dir, ArchiveKind};
pub use json_io::{read_json_sync, write_json_sync};
pub use lock::BuildLock;
pub use process::{BackgroundProcess, CommandOutcome, CommandRunner, CommandSpec, SystemRunner};
