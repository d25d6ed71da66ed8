use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, format_err, Error};
use nix::sys::stat::Mode;

use super::*;
use crate::tools;

const DIR_LOCK_NAME: &str = ".imap.index.dirlock";
const DIR_LOCK_TIMEOUT: usize = 30;

impl MailIndex {
    /// Open an existing index in `dir`. Fails when no compatible
    /// index file exists there.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        backend: Box<dyn MailboxBackend>,
        update_recent: bool,
    ) -> Result<MailIndex, Error> {
        let mut index = MailIndex::new_unopened(dir.as_ref().to_owned(), backend);
        if !index.try_open(update_recent)? {
            bail!("no compatible mail index in {:?}", index.dir);
        }
        Ok(index)
    }

    /// Open the index in `dir`, creating a fresh one first if no
    /// compatible file exists. Creation is serialized through an
    /// exclusive directory lock.
    pub fn open_or_create<P: AsRef<Path>>(
        dir: P,
        backend: Box<dyn MailboxBackend>,
        update_recent: bool,
    ) -> Result<MailIndex, Error> {
        let mut index = MailIndex::new_unopened(dir.as_ref().to_owned(), backend);
        if index.try_open(update_recent)? {
            return Ok(index);
        }

        let dir_lock = tools::lock_dir(&index.dir, DIR_LOCK_NAME, DIR_LOCK_TIMEOUT)?;

        // somebody else may have created it while we waited
        if index.try_open(update_recent)? {
            return Ok(index);
        }
        index.create(update_recent, dir_lock)?;
        Ok(index)
    }

    /// Read the header of `path` and check the compat tuple and
    /// format version. `Ok(None)` means "not a compatible index".
    fn read_and_verify_header(path: &Path) -> Result<Option<MailIndexHeader>, Error> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => bail!("unable to open index {:?} - {}", path, err),
        };
        if file.metadata()?.len() < INDEX_HEADER_SIZE as u64 {
            return Ok(None);
        }

        let mut hdr = MailIndexHeader::new(0);
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(&mut hdr as *mut _ as *mut u8, INDEX_HEADER_SIZE)
        };
        file.read_exact_at(bytes, 0)?;

        if !hdr.compatible() {
            return Ok(None);
        }
        Ok(Some(hdr))
    }

    /// Probe the primary file name, then fall back to scanning the
    /// directory for any sibling starting with the prefix.
    fn find_index_file(dir: &Path) -> Result<Option<PathBuf>, Error> {
        let primary = dir.join(INDEX_FILE_PREFIX);
        if Self::read_and_verify_header(&primary)?.is_some() {
            return Ok(Some(primary));
        }

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with(INDEX_FILE_PREFIX) {
                continue;
            }
            let path = entry.path();
            if path == primary {
                continue;
            }
            // sidecar and temp files fail the header check
            if Self::read_and_verify_header(&path)?.is_some() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    fn try_open(&mut self, update_recent: bool) -> Result<bool, Error> {
        let path = match Self::find_index_file(&self.dir)? {
            Some(path) => path,
            None => return Ok(false),
        };
        self.open_file(&path, update_recent)?;
        Ok(true)
    }

    fn open_file(&mut self, path: &Path, update_recent: bool) -> Result<(), Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| format_err!("unable to open index {:?} - {}", path, err))?;

        let mut hdr = MailIndexHeader::new(0);
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(&mut hdr as *mut _ as *mut u8, INDEX_HEADER_SIZE)
        };
        file.read_exact_at(bytes, 0)?;
        if !hdr.compatible() {
            bail!("index {:?} has an incompatible format", path);
        }

        let st = nix::sys::stat::fstat(file.as_raw_fd())?;

        self.filepath = path.to_owned();
        self.file = Some(file);
        self.mmap = None;
        self.mmap_dirty = true;
        self.indexid = hdr.indexid;
        self.file_sync_stamp = st.st_mtime;
        self.inconsistent = false;
        self.opened = true;

        self.updating = true;
        let result = self.open_file_steps(hdr, update_recent);
        self.updating = false;

        if result.is_err() {
            self.abandon_lock();
            self.opened = false;
        }
        result
    }

    fn open_file_steps(
        &mut self,
        hdr: MailIndexHeader,
        update_recent: bool,
    ) -> Result<(), Error> {
        // header flags read before the exclusive lock sets FSCK
        let mut flags = hdr.header_flags();

        if self.data_open_or_recreate(flags.contains(HeaderFlags::REBUILD))? {
            flags |= HeaderFlags::REBUILD;
        }
        if self.hash_open_or_create()? {
            flags |= HeaderFlags::REBUILD_HASH;
        }
        self.modifylog_open_or_create()?;

        self.run_recovery(flags, update_recent)
    }

    /// Open the data file; a broken one is recreated and forces a
    /// full rebuild. Returns whether a rebuild became necessary.
    fn data_open_or_recreate(&mut self, rebuild_requested: bool) -> Result<bool, Error> {
        match DataFile::open(&self.dir, self.indexid) {
            Ok(data) => {
                self.data = Some(data);
                Ok(false)
            }
            Err(err) => {
                log::warn!(
                    "index {:?}: data file unusable ({}), recreating",
                    self.filepath,
                    err
                );
                self.data = Some(DataFile::create(&self.dir, self.indexid)?);
                Ok(!rebuild_requested)
            }
        }
    }

    /// Open the hash sidecar; a broken one is recreated empty and
    /// rebuilt from the index. Returns whether a rebuild is needed.
    fn hash_open_or_create(&mut self) -> Result<bool, Error> {
        match HashFile::open(&self.dir, self.indexid) {
            Ok(hash) => {
                self.hash = Some(hash);
                Ok(false)
            }
            Err(err) => {
                log::warn!(
                    "index {:?}: hash file unusable ({}), recreating",
                    self.filepath,
                    err
                );
                self.hash = Some(HashFile::create(&self.dir, self.indexid, 0)?);
                Ok(true)
            }
        }
    }

    fn modifylog_open_or_create(&mut self) -> Result<(), Error> {
        match ModifyLog::open(&self.dir, self.indexid) {
            Ok(log) => self.modifylog = Some(log),
            Err(err) => {
                log::warn!(
                    "index {:?}: modify log unusable ({}), recreating",
                    self.filepath,
                    err
                );
                self.modifylog = Some(ModifyLog::create(&self.dir, self.indexid)?);
            }
        }
        Ok(())
    }

    /// Run the pending recovery steps in their required order, then
    /// let the backend sync and finish open-time bookkeeping.
    fn run_recovery(&mut self, flags: HeaderFlags, update_recent: bool) -> Result<(), Error> {
        self.set_lock(LockType::Exclusive)?;

        if flags.contains(HeaderFlags::REBUILD) {
            self.rebuild_index()?;
        }
        if flags.contains(HeaderFlags::FSCK) {
            self.fsck_index()?;
        }
        if flags.contains(HeaderFlags::COMPRESS) {
            self.compress()?;
        }
        if flags.contains(HeaderFlags::REBUILD_HASH) {
            self.rebuild_hash()?;
        }
        if flags.contains(HeaderFlags::CACHE_FIELDS) {
            self.update_cache()?;
        }
        // after CACHE_FIELDS, which may have freed space
        if flags.contains(HeaderFlags::COMPRESS_DATA) {
            self.compress_data()?;
        }

        self.with_backend(|backend, index| backend.sync(index))?;
        self.open_init(update_recent)?;

        self.set_lock(LockType::Unlock)?;
        Ok(())
    }

    /// Compute the `\Recent` range and, when asked to, move the
    /// non-recent mark up to the current end of the mailbox.
    pub(crate) fn open_init(&mut self, update_recent: bool) -> Result<(), Error> {
        let hdr = *self.hdr();
        self.first_recent_uid = hdr.last_nonrecent_uid + 1;

        if update_recent && hdr.last_nonrecent_uid != hdr.next_uid - 1 {
            if self.lock_type != LockType::Exclusive {
                self.set_lock(LockType::Unlock)?;
                self.set_lock(LockType::Exclusive)?;
            }
            let old = self.hdr().last_nonrecent_uid;
            let next_uid = self.hdr().next_uid;
            self.hdr_mut().last_nonrecent_uid = next_uid - 1;
            self.first_recent_uid = old + 1;
        }

        if hdr.next_uid >= NEXT_UID_REBUILD_LIMIT {
            self.set_flags |= HeaderFlags::REBUILD;
        }
        Ok(())
    }

    /// Write a fresh index through a temp file and link it into
    /// place, then populate it from the mailbox.
    fn create(&mut self, update_recent: bool, dir_lock: tools::DirLock) -> Result<(), Error> {
        let indexid = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as u32;
        let hdr = MailIndexHeader::new(indexid);

        let primary = self.dir.join(INDEX_FILE_PREFIX);
        let (tmp_file, tmp_path) =
            tools::make_tempfile(&primary, Mode::from_bits_truncate(0o600))?;
        let bytes = unsafe {
            std::slice::from_raw_parts(&hdr as *const _ as *const u8, INDEX_HEADER_SIZE)
        };
        tmp_file.write_all_at(bytes, 0)?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        // link() keeps the target atomic; an existing (incompatible)
        // file at the primary name pushes us to a host-specific one
        let path = match std::fs::hard_link(&tmp_path, &primary) {
            Ok(()) => {
                let _ = nix::unistd::unlink(tmp_path.as_path());
                primary
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let fallback = self
                    .dir
                    .join(format!("{}-{}", INDEX_FILE_PREFIX, tools::hostname()));
                if let Err(err) = std::fs::rename(&tmp_path, &fallback) {
                    let _ = nix::unistd::unlink(tmp_path.as_path());
                    bail!("unable to rename new index to {:?} - {}", fallback, err);
                }
                fallback
            }
            Err(err) => {
                let _ = nix::unistd::unlink(tmp_path.as_path());
                bail!("unable to link new index to {:?} - {}", primary, err);
            }
        };

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let st = nix::sys::stat::fstat(file.as_raw_fd())?;

        self.filepath = path;
        self.file = Some(file);
        self.mmap = None;
        self.mmap_dirty = true;
        self.indexid = indexid;
        self.file_sync_stamp = st.st_mtime;
        self.opened = true;

        self.updating = true;
        let result = (|| -> Result<(), Error> {
            self.set_lock(LockType::Exclusive)?;

            // the index lock now guards the files, other processes may
            // probe the directory again
            drop(dir_lock);

            self.data = Some(DataFile::create(&self.dir, indexid)?);
            self.with_backend(|backend, index| backend.rebuild(index))?;
            self.hdr_mut().flags &= !HeaderFlags::REBUILD.bits();

            self.hash = Some(HashFile::create(&self.dir, indexid, 0)?);
            self.rebuild_hash()?;
            self.modifylog = Some(ModifyLog::create(&self.dir, indexid)?);

            self.open_init(update_recent)?;
            self.set_lock(LockType::Unlock)?;
            Ok(())
        })();
        self.updating = false;

        if result.is_err() {
            self.abandon_lock();
            self.opened = false;
        }
        result
    }
}
