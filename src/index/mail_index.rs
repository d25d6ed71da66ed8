use std::fs::File;
use std::path::PathBuf;

use anyhow::Error;
use memmap2::MmapMut;

use super::*;

/// Logical lock states of an index handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Unlock,
    Shared,
    Exclusive,
}

/// Distinguished error kinds. Most failures are plain [anyhow::Error]s,
/// these two need to be told apart by callers.
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// Another process rebuilt the index under this handle. The handle
    /// is poisoned, only teardown is allowed.
    #[error("mail index is in inconsistent state - reopen required")]
    Inconsistent,
    #[error("mail index corrupted - {0}")]
    Corrupted(String),
}

/// Check whether `err` reports the poisoned-handle state.
pub fn is_inconsistency_error(err: &Error) -> bool {
    matches!(err.downcast_ref::<IndexError>(), Some(IndexError::Inconsistent))
}

/// Copy of one record plus its byte offset in the index file.
///
/// The copy stays valid across remaps; mutating operations revalidate
/// the offset against the live mapping before touching anything.
#[derive(Debug, Clone, Copy)]
pub struct RecordRef {
    pub(crate) offset: u64,
    pub(crate) record: MailIndexRecord,
}

impl RecordRef {
    pub fn uid(&self) -> u32 {
        self.record.uid
    }

    pub fn msg_flags(&self) -> MessageFlags {
        self.record.msg_flags()
    }

    pub fn cached_fields(&self) -> DataFields {
        self.record.cached_fields()
    }

    pub fn data_size(&self) -> u32 {
        self.record.data_size
    }
}

/// Handle to one on-disk mail index.
///
/// Single writer, multiple readers, coordinated with advisory
/// whole-file locks. All lookups and mutations require the matching
/// lock to be held, see [MailIndex::set_lock].
pub struct MailIndex {
    pub(crate) dir: PathBuf,
    pub(crate) filepath: PathBuf,
    pub(crate) file: Option<File>,
    pub(crate) mmap: Option<MmapMut>,
    pub(crate) mmap_dirty: bool,

    pub(crate) indexid: u32,
    pub(crate) lock_type: LockType,
    /// Inhibits backend sync / rebuild re-entry while the index is
    /// already in the middle of an update.
    pub(crate) updating: bool,
    pub(crate) inconsistent: bool,
    pub(crate) opened: bool,

    pub(crate) data: Option<DataFile>,
    pub(crate) hash: Option<HashFile>,
    pub(crate) modifylog: Option<ModifyLog>,
    pub(crate) backend: Option<Box<dyn MailboxBackend>>,

    /// Cursor of the most recent sequence lookup: (record offset,
    /// sequence). Invalidated on unlock and adjusted on expunges.
    pub(crate) last_lookup: Option<(u64, u32)>,

    /// Header bits accumulated under a shared lock, OR'd into the
    /// header on the next eligible release.
    pub(crate) set_flags: HeaderFlags,
    pub(crate) set_cache_fields: DataFields,

    pub(crate) first_recent_uid: u32,
    /// Stamped onto the index file mtime on clean release; backends
    /// set it to the mailbox mtime they synced against.
    pub(crate) file_sync_stamp: libc::time_t,

    pub(crate) last_error: Option<String>,
}

impl MailIndex {
    pub(crate) fn new_unopened(dir: PathBuf, backend: Box<dyn MailboxBackend>) -> Self {
        let filepath = dir.join(INDEX_FILE_PREFIX);
        Self {
            dir,
            filepath,
            file: None,
            mmap: None,
            mmap_dirty: true,
            indexid: 0,
            lock_type: LockType::Unlock,
            updating: false,
            inconsistent: false,
            opened: false,
            data: None,
            hash: None,
            modifylog: None,
            backend: Some(backend),
            last_lookup: None,
            set_flags: HeaderFlags::empty(),
            set_cache_fields: DataFields::empty(),
            first_recent_uid: 1,
            file_sync_stamp: 0,
            last_error: None,
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// The most recent error message recorded on this handle.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// First UID of the `\Recent` range computed at open.
    pub fn first_recent_uid(&self) -> u32 {
        self.first_recent_uid
    }

    /// Tell the release path which mtime to stamp onto the index file.
    pub fn set_sync_stamp(&mut self, stamp: libc::time_t) {
        self.file_sync_stamp = stamp;
    }

    /// The modify log journal, for peers following expunges and flag
    /// changes.
    pub fn modify_log(&self) -> Option<&ModifyLog> {
        self.modifylog.as_ref()
    }

    /// Request header flag bits. Applied to the header on the next
    /// eligible lock release.
    pub fn set_header_flags(&mut self, flags: HeaderFlags) {
        self.set_flags |= flags;
    }

    /// Request caching of additional field kinds for future appends.
    pub fn set_cache_fields(&mut self, fields: DataFields) {
        self.set_cache_fields |= fields;
    }

    pub(crate) fn set_error(&mut self, msg: String) {
        self.last_error = Some(msg);
    }

    /// Record a corruption: remember the error, request REBUILD and, if
    /// we are the writer, flag the live header right away.
    pub(crate) fn set_corrupted(&mut self, msg: &str) {
        log::warn!("index {:?} corrupted - {}", self.filepath, msg);
        self.set_error(format!("index corrupted - {}", msg));
        self.set_flags |= HeaderFlags::REBUILD;
        if self.lock_type == LockType::Exclusive && self.mmap.is_some() {
            self.hdr_mut().flags |= HeaderFlags::REBUILD.bits();
        }
    }

    pub(crate) fn set_inconsistent(&mut self, msg: &str) {
        log::warn!("index {:?} - {}", self.filepath, msg);
        self.inconsistent = true;
        self.set_error(msg.to_string());
    }

    /// Run `f` with the mailbox backend temporarily detached, so it
    /// can receive `&mut self` without aliasing.
    pub(crate) fn with_backend<T>(
        &mut self,
        f: impl FnOnce(&mut dyn MailboxBackend, &mut MailIndex) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut backend = match self.backend.take() {
            Some(backend) => backend,
            None => anyhow::bail!("index {:?} has no mailbox backend", self.filepath),
        };
        let result = f(backend.as_mut(), self);
        self.backend = Some(backend);
        result
    }
}
