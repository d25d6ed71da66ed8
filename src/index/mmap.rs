use anyhow::{bail, format_err, Error};
use memmap2::{MmapMut, MmapOptions};

use super::*;

const HDR: u64 = INDEX_HEADER_SIZE as u64;
const RS: u64 = INDEX_RECORD_SIZE as u64;

impl MailIndex {
    pub(crate) fn file_ref(&self) -> Result<&std::fs::File, Error> {
        self.file
            .as_ref()
            .ok_or_else(|| format_err!("index {:?} is not open", self.filepath))
    }

    /// (Re)map the index file if an append or truncate made the
    /// current mapping stale. Partial trailing bytes (an interrupted
    /// append) are silently truncated away.
    pub(crate) fn mmap_refresh(&mut self) -> Result<(), Error> {
        if !self.mmap_dirty && self.mmap.is_some() {
            return Ok(());
        }

        // unmap any prior region before remapping
        self.mmap = None;

        let mut len = self.file_ref()?.metadata()?.len();

        if len < HDR {
            let msg = format!("index file is only {} bytes, no complete header", len);
            self.set_error(format!("index corrupted - {}", msg));
            bail!(IndexError::Corrupted(msg));
        }

        let extra = (len - HDR) % RS;
        if extra != 0 {
            len -= extra;
            log::debug!(
                "{:?}: dropping {} partial trailing bytes of an interrupted append",
                self.filepath,
                extra
            );
            self.file_ref()?.set_len(len)?;
        }

        let mmap = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map_mut(self.file_ref()?)?
        };
        self.mmap = Some(mmap);
        self.mmap_dirty = false;

        Ok(())
    }

    /// Change the file length and remap. Used by expunge-to-empty and
    /// hole compaction.
    pub(crate) fn truncate_records(&mut self, new_len: u64) -> Result<(), Error> {
        self.file_ref()?.set_len(new_len)?;
        self.mmap_dirty = true;
        self.mmap_refresh()
    }

    pub(crate) fn map(&self) -> &MmapMut {
        self.mmap.as_ref().expect("index is not mapped")
    }

    pub(crate) fn map_mut(&mut self) -> &mut MmapMut {
        self.mmap.as_mut().expect("index is not mapped")
    }

    pub(crate) fn hdr(&self) -> &MailIndexHeader {
        // the mapping is page aligned and at least INDEX_HEADER_SIZE long
        unsafe { &*(self.map().as_ptr() as *const MailIndexHeader) }
    }

    pub(crate) fn hdr_mut(&mut self) -> &mut MailIndexHeader {
        unsafe { &mut *(self.map_mut().as_mut_ptr() as *mut MailIndexHeader) }
    }

    /// Copy of the current header. Needs the mapping, so a lock must
    /// have been held at least once and not have failed.
    pub fn header(&self) -> Result<MailIndexHeader, Error> {
        if self.mmap.is_none() {
            bail!("index {:?} is not mapped - lock it first", self.filepath);
        }
        Ok(*self.hdr())
    }

    pub(crate) fn file_length(&self) -> u64 {
        self.map().len() as u64
    }

    pub(crate) fn record_count(&self) -> u32 {
        ((self.file_length() - HDR) / RS) as u32
    }

    pub(crate) fn valid_record_offset(&self, offset: u64) -> bool {
        offset >= HDR && offset + RS <= self.file_length() && (offset - HDR) % RS == 0
    }

    pub(crate) fn record_at(&self, offset: u64) -> &MailIndexRecord {
        debug_assert!(self.valid_record_offset(offset));
        unsafe { &*(self.map().as_ptr().add(offset as usize) as *const MailIndexRecord) }
    }

    pub(crate) fn record_at_mut(&mut self, offset: u64) -> &mut MailIndexRecord {
        debug_assert!(self.valid_record_offset(offset));
        unsafe { &mut *(self.map_mut().as_mut_ptr().add(offset as usize) as *mut MailIndexRecord) }
    }

    pub(crate) fn record_ref_at(&self, offset: u64) -> RecordRef {
        RecordRef {
            offset,
            record: *self.record_at(offset),
        }
    }

    /// Check that `rec` still points at the record it was created
    /// from; remaps and expunges can invalidate stale references.
    pub(crate) fn resolve_record(&self, rec: &RecordRef) -> Result<(), Error> {
        if !self.valid_record_offset(rec.offset) {
            bail!(
                "record reference for UID {} is outside the index (offset {})",
                rec.record.uid,
                rec.offset
            );
        }
        if self.record_at(rec.offset).uid != rec.record.uid {
            bail!(
                "record reference for UID {} is stale (offset {})",
                rec.record.uid,
                rec.offset
            );
        }
        Ok(())
    }
}
