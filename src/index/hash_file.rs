use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use memmap2::{MmapMut, MmapOptions};

use super::*;

const HASH_HEADER_SIZE: usize = std::mem::size_of::<HashFileHeader>();
const HASH_SLOT_SIZE: usize = std::mem::size_of::<HashSlot>();

const HASH_MIN_SLOTS: u32 = 1024;
// ask for a rebuild once live + tombstone slots pass this fill grade
const HASH_MAX_FILL_PCT: u32 = 60;

fn hash_file_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.hash", INDEX_FILE_PREFIX))
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct HashFileHeader {
    indexid: u32,
    reserved: u32,
    used_records: u32,
    size: u32,
}

/// `uid == 0` means the slot was never used and ends a probe chain.
/// `uid != 0, position == 0` is a tombstone; chains continue across it
/// and inserts may reuse it.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct HashSlot {
    uid: u32,
    reserved: u32,
    position: u64,
}

/// Memory-mapped UID → record-offset table with linear probing.
///
/// The table is advisory: a miss or a stale entry only costs the
/// caller a linear index scan, so crash consistency is not required
/// here. Anything suspicious is answered by rebuilding from the index.
pub struct HashFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    indexid: u32,
    size: u32,
    used: u32,
    wants_rebuild: bool,
}

impl HashFile {
    pub(crate) fn create(dir: &Path, indexid: u32, slots: u32) -> Result<Self, Error> {
        let path = hash_file_path(dir);
        let slots = slots.max(HASH_MIN_SLOTS);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|err| format_err!("unable to create hash file {:?} - {}", path, err))?;

        let len = HASH_HEADER_SIZE as u64 + slots as u64 * HASH_SLOT_SIZE as u64;
        file.set_len(len)?;
        let mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };

        let mut this = Self {
            path,
            file,
            mmap,
            indexid,
            size: slots,
            used: 0,
            wants_rebuild: false,
        };
        {
            let hdr = this.hdr_mut();
            hdr.indexid = indexid;
            hdr.reserved = 0;
            hdr.used_records = 0;
            hdr.size = slots;
        }
        Ok(this)
    }

    pub(crate) fn open(dir: &Path, indexid: u32) -> Result<Self, Error> {
        let path = hash_file_path(dir);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| format_err!("unable to open hash file {:?} - {}", path, err))?;

        let len = file.metadata()?.len();
        if len < HASH_HEADER_SIZE as u64 {
            bail!("hash file {:?} is truncated ({} bytes)", path, len);
        }
        let mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };

        let hdr = unsafe { &*(mmap.as_ptr() as *const HashFileHeader) };
        if hdr.indexid != indexid {
            bail!(
                "hash file {:?} belongs to another index (indexid {} != {})",
                path,
                hdr.indexid,
                indexid
            );
        }
        let expected = HASH_HEADER_SIZE as u64 + hdr.size as u64 * HASH_SLOT_SIZE as u64;
        if hdr.size == 0 || expected != len || hdr.used_records > hdr.size {
            bail!("hash file {:?} header does not match its size", path);
        }

        let size = hdr.size;
        let used = hdr.used_records;
        Ok(Self {
            path,
            file,
            mmap,
            indexid,
            size,
            used,
            wants_rebuild: false,
        })
    }

    fn hdr_mut(&mut self) -> &mut HashFileHeader {
        unsafe { &mut *(self.mmap.as_mut_ptr() as *mut HashFileHeader) }
    }

    fn slot(&self, index: u32) -> &HashSlot {
        debug_assert!(index < self.size);
        let off = HASH_HEADER_SIZE + index as usize * HASH_SLOT_SIZE;
        unsafe { &*(self.mmap.as_ptr().add(off) as *const HashSlot) }
    }

    fn slot_mut(&mut self, index: u32) -> &mut HashSlot {
        debug_assert!(index < self.size);
        let off = HASH_HEADER_SIZE + index as usize * HASH_SLOT_SIZE;
        unsafe { &mut *(self.mmap.as_mut_ptr().add(off) as *mut HashSlot) }
    }

    /// UID → record byte offset. Misses are fine, the caller falls
    /// back to a linear scan.
    pub(crate) fn lookup(&self, uid: u32) -> Option<u64> {
        if uid == 0 || self.size == 0 {
            return None;
        }
        let mut index = uid % self.size;
        for _ in 0..self.size {
            let slot = self.slot(index);
            if slot.uid == 0 {
                return None;
            }
            if slot.uid == uid {
                if slot.position == 0 {
                    return None;
                }
                return Some(slot.position);
            }
            index = (index + 1) % self.size;
        }
        None
    }

    /// Insert or update an entry; `position == 0` deletes. When the
    /// table is too full the entry is quietly dropped and a rebuild
    /// requested instead.
    pub(crate) fn update(&mut self, uid: u32, position: u64) {
        if uid == 0 || self.size == 0 {
            return;
        }

        let mut index = uid % self.size;
        let mut reusable: Option<u32> = None;
        for _ in 0..self.size {
            let slot = *self.slot(index);
            if slot.uid == uid {
                self.slot_mut(index).position = position;
                return;
            }
            if slot.uid == 0 {
                if position == 0 {
                    // deleting something that was never hashed
                    return;
                }
                let fresh = reusable.is_none();
                let target = reusable.unwrap_or(index);
                {
                    let slot = self.slot_mut(target);
                    slot.uid = uid;
                    slot.position = position;
                }
                if fresh {
                    self.used += 1;
                    let used = self.used;
                    self.hdr_mut().used_records = used;
                    if self.used * 100 / self.size >= HASH_MAX_FILL_PCT {
                        self.wants_rebuild = true;
                    }
                }
                return;
            }
            if slot.position == 0 && reusable.is_none() {
                reusable = Some(index);
            }
            index = (index + 1) % self.size;
        }

        if position != 0 {
            if let Some(target) = reusable {
                let slot = self.slot_mut(target);
                slot.uid = uid;
                slot.position = position;
            }
            self.wants_rebuild = true;
        }
    }

    pub(crate) fn wants_rebuild(&self) -> bool {
        self.wants_rebuild
    }

    /// Recreate the table from `(uid, offset)` pairs, sized for twice
    /// the current message count.
    pub(crate) fn rebuild(&mut self, indexid: u32, pairs: &[(u32, u64)]) -> Result<(), Error> {
        let slots = ((pairs.len() as u32).saturating_mul(2)).max(HASH_MIN_SLOTS);
        let len = HASH_HEADER_SIZE as u64 + slots as u64 * HASH_SLOT_SIZE as u64;

        // zero the old contents before growing to the new size
        self.file.set_len(0)?;
        self.file.set_len(len)?;
        self.mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(&self.file)? };

        self.indexid = indexid;
        self.size = slots;
        self.used = 0;
        {
            let hdr = self.hdr_mut();
            hdr.indexid = indexid;
            hdr.reserved = 0;
            hdr.used_records = 0;
            hdr.size = slots;
        }

        for (uid, position) in pairs {
            self.update(*uid, *position);
        }
        self.wants_rebuild = false;

        log::debug!(
            "rebuilt hash {:?} with {} slots for {} records",
            self.path,
            slots,
            pairs.len()
        );
        Ok(())
    }

    pub(crate) fn sync_file(&mut self) -> Result<(), Error> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut hash = HashFile::create(dir.path(), 1, 0).unwrap();

        hash.update(17, 4096);
        hash.update(18, 4128);
        assert_eq!(hash.lookup(17), Some(4096));
        assert_eq!(hash.lookup(18), Some(4128));
        assert_eq!(hash.lookup(19), None);

        hash.update(17, 0);
        assert_eq!(hash.lookup(17), None);
        // the tombstone must not break the probe chain
        assert_eq!(hash.lookup(18), Some(4128));
    }

    #[test]
    fn test_colliding_uids_probe_linearly() {
        let dir = tempfile::tempdir().unwrap();
        let mut hash = HashFile::create(dir.path(), 1, 0).unwrap();
        let size = hash.size;

        // same home slot for all three
        hash.update(5, 100);
        hash.update(5 + size, 200);
        hash.update(5 + 2 * size, 300);

        assert_eq!(hash.lookup(5), Some(100));
        assert_eq!(hash.lookup(5 + size), Some(200));
        assert_eq!(hash.lookup(5 + 2 * size), Some(300));

        // tombstone in the middle of the chain, then reuse it
        hash.update(5 + size, 0);
        assert_eq!(hash.lookup(5 + 2 * size), Some(300));
        hash.update(5 + 3 * size, 400);
        assert_eq!(hash.lookup(5 + 3 * size), Some(400));
        assert_eq!(hash.lookup(5 + size), None);
    }

    #[test]
    fn test_reopen_and_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut hash = HashFile::create(dir.path(), 9, 0).unwrap();
            hash.update(1, 72);
            hash.sync_file().unwrap();
        }
        let mut hash = HashFile::open(dir.path(), 9).unwrap();
        assert_eq!(hash.lookup(1), Some(72));
        assert!(HashFile::open(dir.path(), 10).is_err());

        hash.rebuild(9, &[(1, 72), (2, 104), (3, 136)]).unwrap();
        assert_eq!(hash.lookup(2), Some(104));
        assert_eq!(hash.lookup(3), Some(136));
        assert!(!hash.wants_rebuild());
    }

    #[test]
    fn test_fill_grade_requests_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let mut hash = HashFile::create(dir.path(), 2, 0).unwrap();
        let size = hash.size;

        for uid in 1..=(size * HASH_MAX_FILL_PCT / 100 + 1) {
            hash.update(uid, uid as u64 * 32);
        }
        assert!(hash.wants_rebuild());
    }
}
