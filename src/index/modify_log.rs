use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use super::*;

const LOG_HEADER_SIZE: usize = std::mem::size_of::<ModifyLogHeader>();
const LOG_RECORD_SIZE: usize = std::mem::size_of::<ModifyLogRecord>();

const KIND_EXPUNGE: u32 = 1;
const KIND_FLAGS: u32 = 2;
const KIND_MASK: u32 = 0xff;
const EXTERNAL_FLAG: u32 = 0x100;

// truncate the log on release once it grows past this
const LOG_ROTATE_SIZE: u64 = 64 * 1024;

fn modify_log_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.log", INDEX_FILE_PREFIX))
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct ModifyLogHeader {
    indexid: u32,
    /// Bumped whenever the log is truncated; readers holding an old
    /// resume offset notice the discontinuity.
    sync_id: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct ModifyLogRecord {
    kind: u32,
    seq: u32,
    uid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryKind {
    Expunge,
    FlagsChanged,
}

/// One decoded modify log entry.
#[derive(Debug, Clone, Copy)]
pub struct ModifyLogEntry {
    pub kind: LogEntryKind,
    pub seq: u32,
    pub uid: u32,
    /// Change was caused outside this index (mailbox-level), not by a
    /// regular client operation.
    pub external: bool,
}

/// Append-only journal of expunges and flag changes, consumed by peer
/// processes watching the same index.
pub struct ModifyLog {
    path: PathBuf,
    file: File,
    indexid: u32,
    sync_id: u32,
}

impl ModifyLog {
    pub(crate) fn create(dir: &Path, indexid: u32) -> Result<Self, Error> {
        let path = modify_log_path(dir);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|err| format_err!("unable to create modify log {:?} - {}", path, err))?;

        let mut this = Self {
            path,
            file,
            indexid,
            sync_id: 0,
        };
        this.write_header()?;
        Ok(this)
    }

    pub(crate) fn open(dir: &Path, indexid: u32) -> Result<Self, Error> {
        let path = modify_log_path(dir);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| format_err!("unable to open modify log {:?} - {}", path, err))?;

        let len = file.metadata()?.len();
        if len < LOG_HEADER_SIZE as u64 {
            bail!("modify log {:?} is truncated ({} bytes)", path, len);
        }

        let mut hdr = ModifyLogHeader {
            indexid: 0,
            sync_id: 0,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(&mut hdr as *mut _ as *mut u8, LOG_HEADER_SIZE)
        };
        file.read_exact_at(bytes, 0)?;

        if hdr.indexid != indexid {
            bail!(
                "modify log {:?} belongs to another index (indexid {} != {})",
                path,
                hdr.indexid,
                indexid
            );
        }

        Ok(Self {
            path,
            file,
            indexid,
            sync_id: hdr.sync_id,
        })
    }

    fn write_header(&mut self) -> Result<(), Error> {
        let hdr = ModifyLogHeader {
            indexid: self.indexid,
            sync_id: self.sync_id,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(&hdr as *const _ as *const u8, LOG_HEADER_SIZE)
        };
        self.file.write_all_at(bytes, 0)?;
        Ok(())
    }

    fn append_record(&mut self, kind: u32, seq: u32, uid: u32, external: bool) -> Result<(), Error> {
        let rec = ModifyLogRecord {
            kind: kind | if external { EXTERNAL_FLAG } else { 0 },
            seq,
            uid,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(&rec as *const _ as *const u8, LOG_RECORD_SIZE)
        };
        let end = self.file.metadata()?.len();
        self.file.write_all_at(bytes, end)?;
        Ok(())
    }

    pub(crate) fn add_expunge(&mut self, seq: u32, uid: u32, external: bool) -> Result<(), Error> {
        self.append_record(KIND_EXPUNGE, seq, uid, external)
    }

    pub(crate) fn add_flags(&mut self, seq: u32, uid: u32, external: bool) -> Result<(), Error> {
        self.append_record(KIND_FLAGS, seq, uid, external)
    }

    /// Current truncation generation. A reader whose cached sync id
    /// differs must restart from the log head.
    pub fn sync_id(&self) -> u32 {
        self.sync_id
    }

    /// Decode entries starting at byte `offset`; returns them and the
    /// offset to resume from.
    pub fn entries_from(&self, offset: u64) -> Result<(Vec<ModifyLogEntry>, u64), Error> {
        let len = self.file.metadata()?.len();
        let mut off = offset.max(LOG_HEADER_SIZE as u64);
        let mut entries = Vec::new();

        while off + LOG_RECORD_SIZE as u64 <= len {
            let mut rec = ModifyLogRecord {
                kind: 0,
                seq: 0,
                uid: 0,
            };
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(&mut rec as *mut _ as *mut u8, LOG_RECORD_SIZE)
            };
            self.file.read_exact_at(bytes, off)?;

            let kind = match rec.kind & KIND_MASK {
                KIND_EXPUNGE => LogEntryKind::Expunge,
                KIND_FLAGS => LogEntryKind::FlagsChanged,
                other => bail!("modify log {:?} has unknown record kind {}", self.path, other),
            };
            entries.push(ModifyLogEntry {
                kind,
                seq: rec.seq,
                uid: rec.uid,
                external: rec.kind & EXTERNAL_FLAG != 0,
            });
            off += LOG_RECORD_SIZE as u64;
        }

        Ok((entries, off))
    }

    /// Throw old entries away once the log got large. Only the
    /// exclusive writer calls this; peers notice via `sync_id`.
    pub(crate) fn maybe_rotate(&mut self) -> Result<(), Error> {
        let len = self.file.metadata()?.len();
        if len <= LOG_ROTATE_SIZE {
            return Ok(());
        }
        log::info!("rotating modify log {:?} ({} bytes)", self.path, len);
        self.file.set_len(LOG_HEADER_SIZE as u64)?;
        self.sync_id = self.sync_id.wrapping_add(1);
        self.write_header()
    }

    pub(crate) fn sync_file(&mut self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ModifyLog::create(dir.path(), 5).unwrap();

        log.add_expunge(2, 17, false).unwrap();
        log.add_flags(1, 16, true).unwrap();

        let (entries, end) = log.entries_from(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, LogEntryKind::Expunge);
        assert_eq!(entries[0].seq, 2);
        assert_eq!(entries[0].uid, 17);
        assert!(!entries[0].external);
        assert_eq!(entries[1].kind, LogEntryKind::FlagsChanged);
        assert!(entries[1].external);

        // incremental read sees only what came after
        log.add_expunge(1, 16, false).unwrap();
        let (more, _) = log.entries_from(end).unwrap();
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].uid, 16);
    }

    #[test]
    fn test_reopen_checks_indexid() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _log = ModifyLog::create(dir.path(), 11).unwrap();
        }
        assert!(ModifyLog::open(dir.path(), 11).is_ok());
        assert!(ModifyLog::open(dir.path(), 12).is_err());
    }

    #[test]
    fn test_rotation_bumps_sync_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ModifyLog::create(dir.path(), 1).unwrap();
        let before = log.sync_id();

        for seq in 0..(LOG_ROTATE_SIZE / LOG_RECORD_SIZE as u64 + 2) {
            log.add_flags(seq as u32, seq as u32 + 1, false).unwrap();
        }
        log.maybe_rotate().unwrap();

        assert_eq!(log.sync_id(), before + 1);
        let (entries, _) = log.entries_from(0).unwrap();
        assert!(entries.is_empty());
    }
}
