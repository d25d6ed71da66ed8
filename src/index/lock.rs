use std::os::unix::io::AsRawFd;

use anyhow::{bail, Error};
use nix::errno::Errno;
use nix::fcntl::FcntlArg;

use super::*;
use crate::tools;

impl MailIndex {
    /// Move the handle to the requested lock state, blocking until the
    /// advisory lock is granted.
    ///
    /// Shared cannot be upgraded to exclusive, callers have to unlock
    /// first. Releasing the exclusive lock runs the full write-back
    /// sequence (deferred header bits, FSCK clear, msync, sidecar
    /// syncs, mtime stamp, fsync) before the OS lock is dropped.
    pub fn set_lock(&mut self, lock_type: LockType) -> Result<(), Error> {
        self.change_lock(lock_type, true).map(|_| ())
    }

    /// Non-blocking variant. Returns false when another process holds
    /// a conflicting lock.
    pub fn try_lock(&mut self, lock_type: LockType) -> Result<bool, Error> {
        self.change_lock(lock_type, false)
    }

    fn change_lock(&mut self, lock_type: LockType, wait: bool) -> Result<bool, Error> {
        if lock_type == self.lock_type {
            return Ok(true);
        }
        if self.inconsistent && lock_type != LockType::Unlock {
            self.set_error("index is in inconsistent state - reopen required".to_string());
            bail!(IndexError::Inconsistent);
        }
        assert!(
            !(self.lock_type == LockType::Shared && lock_type == LockType::Exclusive),
            "shared lock cannot be upgraded to exclusive, unlock first"
        );

        if lock_type == LockType::Unlock {
            self.release_lock()?;
            Ok(true)
        } else {
            self.acquire_lock(lock_type, wait)
        }
    }

    fn acquire_lock(&mut self, lock_type: LockType, wait: bool) -> Result<bool, Error> {
        if self.lock_type == LockType::Exclusive {
            // downgrade: everything has to hit the disk before the
            // exclusive lock goes away
            self.flush_exclusive()?;
            self.fcntl_lock(LockType::Shared, true)?;
            self.lock_type = LockType::Shared;
            return Ok(true);
        }

        // reconcile with the mailbox before the caller sees the index
        if !self.updating {
            self.updating = true;
            let res = self.with_backend(|backend, index| backend.sync(index));
            self.updating = false;
            res?;
            if self.inconsistent {
                bail!(IndexError::Inconsistent);
            }
            if self.lock_type == lock_type {
                return Ok(true);
            }
        }

        if !self.fcntl_lock(lock_type, wait)? {
            return Ok(false);
        }
        self.lock_type = lock_type;

        if let Err(err) = self.post_acquire(lock_type) {
            let _ = self.fcntl_lock(LockType::Unlock, true);
            self.lock_type = LockType::Unlock;
            return Err(err);
        }
        Ok(true)
    }

    fn post_acquire(&mut self, lock_type: LockType) -> Result<(), Error> {
        self.mmap_refresh()?;

        if self.hdr().indexid != self.indexid {
            self.set_inconsistent("indexid changed - another process rebuilt the index");
            bail!(IndexError::Inconsistent);
        }

        if lock_type == LockType::Exclusive {
            // a crash from here on is noticed by the next open
            self.hdr_mut().flags |= HeaderFlags::FSCK.bits();
            self.map().flush_range(0, INDEX_HEADER_SIZE)?;
        }

        if !self.updating
            && self
                .hdr()
                .header_flags()
                .contains(HeaderFlags::REBUILD)
        {
            self.rebuild_under_lock(lock_type)?;
        }

        Ok(())
    }

    /// The live header says the index is corrupt. Rebuild it now,
    /// temporarily trading a shared lock for the exclusive one.
    fn rebuild_under_lock(&mut self, lock_type: LockType) -> Result<(), Error> {
        self.updating = true;
        let result = (|| -> Result<(), Error> {
            if lock_type == LockType::Shared {
                self.fcntl_lock(LockType::Unlock, true)?;
                self.lock_type = LockType::Unlock;
                self.fcntl_lock(LockType::Exclusive, true)?;
                self.lock_type = LockType::Exclusive;
                self.mmap_refresh()?;
                if self.hdr().indexid != self.indexid {
                    self.set_inconsistent("indexid changed - another process rebuilt the index");
                    bail!(IndexError::Inconsistent);
                }
            }
            self.hdr_mut().flags |= HeaderFlags::FSCK.bits();

            if self
                .hdr()
                .header_flags()
                .contains(HeaderFlags::REBUILD)
            {
                self.rebuild_index()?;
            }

            if lock_type == LockType::Shared {
                self.flush_exclusive()?;
                self.fcntl_lock(LockType::Shared, true)?;
                self.lock_type = LockType::Shared;
            }
            Ok(())
        })();
        self.updating = false;
        result
    }

    fn release_lock(&mut self) -> Result<(), Error> {
        // the pointee may be gone after the next remap
        self.last_lookup = None;

        match self.lock_type {
            LockType::Unlock => Ok(()),
            LockType::Exclusive => {
                if !self.inconsistent {
                    self.flush_exclusive()?;
                }
                self.fcntl_lock(LockType::Unlock, true)?;
                self.lock_type = LockType::Unlock;
                Ok(())
            }
            LockType::Shared => {
                let pending = !self.set_flags.is_empty() || !self.set_cache_fields.is_empty();
                self.fcntl_lock(LockType::Unlock, true)?;
                self.lock_type = LockType::Unlock;
                if pending && !self.inconsistent {
                    self.apply_deferred_bits()?;
                }
                Ok(())
            }
        }
    }

    /// Deferred bits survived a shared session; land them with one
    /// short exclusive lock.
    fn apply_deferred_bits(&mut self) -> Result<(), Error> {
        self.updating = true;
        let result = (|| -> Result<(), Error> {
            self.fcntl_lock(LockType::Exclusive, true)?;
            self.lock_type = LockType::Exclusive;
            self.mmap_refresh()?;
            if self.hdr().indexid != self.indexid {
                self.set_inconsistent("indexid changed - another process rebuilt the index");
                bail!(IndexError::Inconsistent);
            }
            self.hdr_mut().flags |= HeaderFlags::FSCK.bits();
            self.map().flush_range(0, INDEX_HEADER_SIZE)?;
            self.flush_exclusive()?;
            Ok(())
        })();
        self.updating = false;

        let unlock = self.fcntl_lock(LockType::Unlock, true);
        self.lock_type = LockType::Unlock;
        result?;
        unlock.map(|_| ())
    }

    /// Write-back sequence run while the exclusive lock is still held.
    fn flush_exclusive(&mut self) -> Result<(), Error> {
        {
            let set_flags = self.set_flags;
            let set_cache = self.set_cache_fields;
            self.set_flags = HeaderFlags::empty();
            self.set_cache_fields = DataFields::empty();

            let hdr = self.hdr_mut();
            hdr.flags |= set_flags.bits();
            hdr.cache_fields |= set_cache.bits();
            hdr.flags &= !HeaderFlags::FSCK.bits();
        }

        self.map().flush()?; // msync(MS_SYNC)

        if let Some(data) = self.data.as_mut() {
            data.sync_file()?;
        }
        if let Some(hash) = self.hash.as_mut() {
            hash.sync_file()?;
        }
        if let Some(log) = self.modifylog.as_mut() {
            log.maybe_rotate()?;
            log.sync_file()?;
        }

        if self.file_sync_stamp != 0 {
            tools::set_file_mtime(&self.filepath, self.file_sync_stamp)?;
        }
        self.file_ref()?.sync_all()?;

        Ok(())
    }

    /// Drop the OS lock without the write-back sequence. Used on
    /// failed opens, where a half-done recovery must keep its on-disk
    /// FSCK marker.
    pub(crate) fn abandon_lock(&mut self) {
        self.last_lookup = None;
        let _ = self.fcntl_lock(LockType::Unlock, true);
        self.lock_type = LockType::Unlock;
    }

    /// Blocking/non-blocking whole-file advisory lock, with EINTR
    /// retry.
    fn fcntl_lock(&self, lock_type: LockType, wait: bool) -> Result<bool, Error> {
        let fd = self.file_ref()?.as_raw_fd();

        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = match lock_type {
            LockType::Unlock => libc::F_UNLCK,
            LockType::Shared => libc::F_RDLCK,
            LockType::Exclusive => libc::F_WRLCK,
        } as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = 0;
        fl.l_len = 0; // whole file

        loop {
            let arg = if wait {
                FcntlArg::F_SETLKW(&fl)
            } else {
                FcntlArg::F_SETLK(&fl)
            };
            match nix::fcntl::fcntl(fd, arg) {
                Ok(_) => return Ok(true),
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EACCES))
                    if !wait =>
                {
                    return Ok(false)
                }
                Err(err) => bail!("fcntl lock on {:?} failed - {}", self.filepath, err),
            }
        }
    }
}
