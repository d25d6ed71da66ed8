use std::os::unix::fs::FileExt;

use anyhow::{bail, Error};

use super::*;

const HDR: u64 = INDEX_HEADER_SIZE as u64;
const RS: u64 = INDEX_RECORD_SIZE as u64;

impl MailIndex {
    pub(crate) fn require_exclusive(&self) -> Result<(), Error> {
        if self.inconsistent {
            bail!(IndexError::Inconsistent);
        }
        if self.lock_type != LockType::Exclusive {
            bail!(
                "mutating {:?} requires the exclusive lock",
                self.filepath
            );
        }
        Ok(())
    }

    /// Append a new record and assign it the next UID.
    ///
    /// `fields` is filtered down to the kinds the header wants cached;
    /// everything else is dropped silently.
    pub fn append(
        &mut self,
        msg_flags: MessageFlags,
        fields: &[(DataFields, &[u8])],
    ) -> Result<RecordRef, Error> {
        self.require_exclusive()?;

        let uid = self.hdr().next_uid;
        if uid >= NEXT_UID_REBUILD_LIMIT {
            self.set_flags |= HeaderFlags::REBUILD;
        }
        if uid == std::u32::MAX {
            bail!("index {:?} ran out of UIDs", self.filepath);
        }

        let wanted =
            DataFields::from_bits_truncate(self.hdr().cache_fields) | self.set_cache_fields;
        let mut cached = DataFields::empty();
        let mut stored: Vec<(DataFields, &[u8])> = Vec::new();
        for (field, payload) in fields {
            if wanted.contains(*field) {
                cached |= *field;
                stored.push((*field, payload));
            }
        }

        let (data_position, data_size) = if stored.is_empty() {
            (0, 0)
        } else {
            match self.data.as_mut() {
                Some(data) => data.append_fields(&stored)?,
                None => bail!("index {:?} has no data file open", self.filepath),
            }
        };

        let record = MailIndexRecord {
            uid,
            msg_flags: msg_flags.bits(),
            cached_fields: cached.bits(),
            reserved: 0,
            data_position: data_position as libc::off_t,
            data_size,
            reserved2: 0,
        };

        let offset = self.file_length();
        let bytes = unsafe {
            std::slice::from_raw_parts(&record as *const _ as *const u8, INDEX_RECORD_SIZE)
        };
        self.file_ref()?.write_all_at(bytes, offset)?;
        self.mmap_dirty = true;
        self.mmap_refresh()?;

        {
            let hdr = self.hdr_mut();
            hdr.next_uid = uid + 1;
            hdr.messages_count += 1;
        }
        self.mark_flag_changes(uid, MessageFlags::empty(), msg_flags)?;
        {
            let hdr = self.hdr_mut();
            if !msg_flags.contains(MessageFlags::SEEN)
                && (hdr.first_unseen_uid_lowwater == 0 || uid < hdr.first_unseen_uid_lowwater)
            {
                hdr.first_unseen_uid_lowwater = uid;
            }
        }

        if let Some(hash) = self.hash.as_mut() {
            hash.update(uid, offset);
            if hash.wants_rebuild() {
                self.set_flags |= HeaderFlags::REBUILD_HASH;
            }
        }

        Ok(self.record_ref_at(offset))
    }

    /// Expunge a record, leaving a hole in its place.
    ///
    /// `seq == 0` skips the modify log entry; repair code uses that
    /// when no sequence numbering exists yet.
    pub fn expunge(&mut self, rec: &RecordRef, seq: u32, external: bool) -> Result<(), Error> {
        self.require_exclusive()?;
        self.resolve_record(rec)?;

        let live = *self.record_at(rec.offset);
        if live.uid == 0 {
            bail!("record at offset {} is already expunged", rec.offset);
        }

        if seq != 0 {
            if let Some(log) = self.modifylog.as_mut() {
                log.add_expunge(seq, live.uid, external)?;
            }
        }
        if let Some(hash) = self.hash.as_mut() {
            hash.update(live.uid, 0);
        }

        self.record_at_mut(rec.offset).uid = 0;

        // keep the lookup cursor coherent across the removal
        if let Some((off, last_seq)) = self.last_lookup {
            if off == rec.offset || (seq != 0 && seq == last_seq) {
                self.last_lookup = None;
            } else if seq != 0 && seq < last_seq {
                self.last_lookup = Some((off, last_seq - 1));
            }
        }

        self.note_hole(rec.offset);

        if self.hdr().messages_count == 0 {
            self.set_corrupted("messages_count underflow on expunge");
            bail!(IndexError::Corrupted(
                "messages_count underflow on expunge".to_string()
            ));
        }
        self.hdr_mut().messages_count -= 1;
        self.mark_flag_changes(live.uid, live.msg_flags(), MessageFlags::empty())?;

        if self.hdr().messages_count == 0 {
            // nothing left, shrink back to a bare header
            self.truncate_records(HDR)?;
            {
                let hdr = self.hdr_mut();
                hdr.first_hole_position = 0;
                hdr.first_hole_records = 0;
            }
            if let Some(data) = self.data.as_mut() {
                data.reset()?;
            }
            self.last_lookup = None;
        } else if live.data_size > 0 {
            if let Some(data) = self.data.as_mut() {
                if data.add_deleted_space(live.data_size as u64)? {
                    self.set_flags |= HeaderFlags::COMPRESS_DATA;
                }
            }
        }

        Ok(())
    }

    /// Maintain the first-hole cursor after the record at `offset`
    /// was zeroed.
    fn note_hole(&mut self, offset: u64) {
        let len = self.file_length();
        let (hole, run) = {
            let hdr = self.hdr();
            (hdr.first_hole_position as u64, hdr.first_hole_records)
        };

        if hole == 0 {
            let hdr = self.hdr_mut();
            hdr.first_hole_position = offset as libc::off_t;
            hdr.first_hole_records = 1;
        } else if offset + RS == hole {
            // the run grows downward
            let hdr = self.hdr_mut();
            hdr.first_hole_position = offset as libc::off_t;
            hdr.first_hole_records = run + 1;
        } else if offset == hole + run as u64 * RS {
            // the run grows upward, absorbing any holes it now touches
            let mut new_run = run + 1;
            let mut pos = hole + new_run as u64 * RS;
            while pos + RS <= len && self.record_at(pos).uid == 0 {
                new_run += 1;
                pos += RS;
            }
            self.hdr_mut().first_hole_records = new_run;
        } else {
            // a second hole appeared, compaction has to clean this up
            self.set_flags |= HeaderFlags::COMPRESS;
            if offset < hole {
                let hdr = self.hdr_mut();
                hdr.first_hole_position = offset as libc::off_t;
                hdr.first_hole_records = 1;
            }
        }
    }

    /// Replace the message flags of a record. A no-op change writes
    /// nothing, not even to the modify log.
    pub fn update_flags(
        &mut self,
        rec: &RecordRef,
        seq: u32,
        flags: MessageFlags,
        external: bool,
    ) -> Result<(), Error> {
        self.require_exclusive()?;
        self.resolve_record(rec)?;

        let live = *self.record_at(rec.offset);
        if live.uid == 0 {
            bail!("cannot update flags of an expunged record");
        }
        if live.msg_flags() == flags {
            return Ok(());
        }

        self.mark_flag_changes(live.uid, live.msg_flags(), flags)?;
        self.record_at_mut(rec.offset).msg_flags = flags.bits();

        if let Some(log) = self.modifylog.as_mut() {
            log.add_flags(seq, live.uid, external)?;
        }
        Ok(())
    }

    /// Counter and lowwater bookkeeping for one flag transition.
    ///
    /// `messages_count` must already reflect the operation (appends
    /// increment before calling this, expunges decrement before).
    pub(crate) fn mark_flag_changes(
        &mut self,
        uid: u32,
        old: MessageFlags,
        new: MessageFlags,
    ) -> Result<(), Error> {
        let mut corrupt = None;
        {
            let hdr = self.hdr_mut();

            if !old.contains(MessageFlags::SEEN) && new.contains(MessageFlags::SEEN) {
                hdr.seen_messages_count += 1;
                if hdr.seen_messages_count > hdr.messages_count {
                    corrupt = Some("seen_messages_count larger than messages_count");
                }
            } else if old.contains(MessageFlags::SEEN) && !new.contains(MessageFlags::SEEN) {
                if hdr.seen_messages_count == 0 {
                    corrupt = Some("seen_messages_count underflow");
                } else {
                    if hdr.seen_messages_count == hdr.messages_count
                        && hdr.first_unseen_uid_lowwater == 0
                    {
                        // this is now the only unseen message
                        hdr.first_unseen_uid_lowwater = uid;
                    }
                    hdr.seen_messages_count -= 1;
                    if hdr.first_unseen_uid_lowwater == 0 || uid < hdr.first_unseen_uid_lowwater {
                        hdr.first_unseen_uid_lowwater = uid;
                    }
                }
            }

            if !old.contains(MessageFlags::DELETED) && new.contains(MessageFlags::DELETED) {
                hdr.deleted_messages_count += 1;
                if hdr.deleted_messages_count > hdr.messages_count {
                    corrupt = Some("deleted_messages_count larger than messages_count");
                } else if hdr.first_deleted_uid_lowwater == 0
                    || uid < hdr.first_deleted_uid_lowwater
                {
                    hdr.first_deleted_uid_lowwater = uid;
                }
            } else if old.contains(MessageFlags::DELETED) && !new.contains(MessageFlags::DELETED) {
                if hdr.deleted_messages_count == 0 {
                    corrupt = Some("deleted_messages_count underflow");
                } else {
                    hdr.deleted_messages_count -= 1;
                }
            }
        }

        if let Some(msg) = corrupt {
            self.set_corrupted(msg);
            bail!(IndexError::Corrupted(msg.to_string()));
        }
        Ok(())
    }
}
