//! This module implements the mail index storage layer.
//!
//! # Data formats
//!
//! A mailbox directory carries a single index file mapping
//! monotonically increasing message UIDs to fixed-size metadata
//! records. The file starts with a [MailIndexHeader] followed by a
//! tightly packed array of [MailIndexRecord] structs. The layout uses
//! native integer widths; the header's compat tuple refuses files
//! written with a different ABI.
//!
//! Variable-length cached fields (envelope, body structure, ...) live
//! in a separate data file, addressed from each index record by
//! `(data_position, data_size)`. A memory-mapped hash sidecar maps
//! UIDs to record offsets for fast UID range lookups, and an
//! append-only modify log publishes expunges and flag changes to
//! peer processes.
//!
//! Records are never moved by regular operations. Expunging a message
//! only zeroes its UID, leaving a *hole* that keeps sequence numbers
//! computable for the rest of the session; holes are compacted by the
//! recovery driver on a later open.
//!
//! # Locking
//!
//! A single advisory whole-file lock (``fcntl``) coordinates
//! processes: readers take a shared lock, the one writer takes an
//! exclusive lock. Upgrading shared to exclusive is forbidden, the
//! caller has to unlock first. While the exclusive lock is held the
//! FSCK header flag is set on disk, so a writer crash is noticed and
//! repaired on the next open. Releasing the exclusive lock flushes
//! deferred header bits, msyncs the mapping, syncs the sidecar files
//! and stamps the file mtime before the OS lock is dropped.

mod file_formats;
pub use file_formats::*;

mod mail_index;
pub use mail_index::*;

mod mmap;

mod lock;

mod lookup;

mod update;

mod open;

mod recovery;

mod data_file;
pub use data_file::*;

mod hash_file;
pub use hash_file::*;

mod modify_log;
pub use modify_log::*;

mod backend;
pub use backend::*;
