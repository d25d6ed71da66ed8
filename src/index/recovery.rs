use std::convert::TryInto;

use anyhow::{bail, Error};

use super::*;

const HDR: u64 = INDEX_HEADER_SIZE as u64;
const RS: u64 = INDEX_RECORD_SIZE as u64;

impl MailIndex {
    /// Full rebuild: drop every record, let the backend repopulate
    /// the index from the mailbox, then rebuild the hash.
    ///
    /// `uid_validity` and `next_uid` survive, so UIDs stay monotonic
    /// across rebuilds.
    pub(crate) fn rebuild_index(&mut self) -> Result<(), Error> {
        self.require_exclusive()?;
        log::info!("rebuilding index {:?}", self.filepath);

        self.truncate_records(HDR)?;
        {
            let hdr = self.hdr_mut();
            hdr.messages_count = 0;
            hdr.seen_messages_count = 0;
            hdr.deleted_messages_count = 0;
            hdr.first_unseen_uid_lowwater = 0;
            hdr.first_deleted_uid_lowwater = 0;
            hdr.first_hole_position = 0;
            hdr.first_hole_records = 0;
        }
        if let Some(data) = self.data.as_mut() {
            data.reset()?;
        }
        self.last_lookup = None;

        self.with_backend(|backend, index| backend.rebuild(index))?;

        self.hdr_mut().flags &= !HeaderFlags::REBUILD.bits();
        self.set_flags.remove(HeaderFlags::REBUILD);

        if self.hash.is_some() {
            self.rebuild_hash()?;
        }
        Ok(())
    }

    /// Recount everything derivable from the record array. Run when a
    /// writer died while holding the exclusive lock. Damage beyond
    /// counters (UID order violations) escalates to a full rebuild.
    pub(crate) fn fsck_index(&mut self) -> Result<(), Error> {
        self.require_exclusive()?;
        log::info!("fsck of index {:?}", self.filepath);

        let len = self.file_length();
        let mut messages = 0u32;
        let mut seen = 0u32;
        let mut deleted = 0u32;
        let mut first_unseen = 0u32;
        let mut first_deleted = 0u32;
        let mut max_uid = 0u32;
        let mut hole_pos = 0u64;
        let mut hole_run = 0u32;
        let mut past_first_run = false;
        let mut second_hole = false;

        let mut pos = HDR;
        while pos + RS <= len {
            let rec = *self.record_at(pos);
            if rec.uid == 0 {
                if hole_pos == 0 {
                    hole_pos = pos;
                    hole_run = 1;
                } else if !past_first_run {
                    hole_run += 1;
                } else {
                    second_hole = true;
                }
            } else {
                if hole_pos != 0 {
                    past_first_run = true;
                }
                if rec.uid <= max_uid {
                    self.set_corrupted("UID order broken, falling back to full rebuild");
                    return self.rebuild_index();
                }
                max_uid = rec.uid;
                messages += 1;
                let flags = rec.msg_flags();
                if flags.contains(MessageFlags::SEEN) {
                    seen += 1;
                } else if first_unseen == 0 {
                    first_unseen = rec.uid;
                }
                if flags.contains(MessageFlags::DELETED) {
                    deleted += 1;
                    if first_deleted == 0 {
                        first_deleted = rec.uid;
                    }
                }
            }
            pos += RS;
        }

        {
            let hdr = self.hdr_mut();
            hdr.messages_count = messages;
            hdr.seen_messages_count = seen;
            hdr.deleted_messages_count = deleted;
            hdr.first_unseen_uid_lowwater = first_unseen;
            hdr.first_deleted_uid_lowwater = first_deleted;
            hdr.first_hole_position = hole_pos as libc::off_t;
            hdr.first_hole_records = hole_run;
            if hdr.next_uid <= max_uid {
                hdr.next_uid = max_uid + 1;
            }
            if second_hole {
                hdr.flags |= HeaderFlags::COMPRESS.bits();
            }
        }

        self.with_backend(|backend, index| backend.fsck(index))
    }

    /// Slide live records down over the holes and truncate the file.
    /// Record offsets move, so the hash is rebuilt afterwards.
    pub(crate) fn compress(&mut self) -> Result<(), Error> {
        self.require_exclusive()?;

        let len = self.file_length() as usize;
        let mut write = INDEX_HEADER_SIZE;
        {
            let map = self.map_mut();
            let mut read = INDEX_HEADER_SIZE;
            while read + INDEX_RECORD_SIZE <= len {
                let uid = u32::from_ne_bytes(map[read..read + 4].try_into().unwrap());
                if uid != 0 {
                    if write != read {
                        map.copy_within(read..read + INDEX_RECORD_SIZE, write);
                    }
                    write += INDEX_RECORD_SIZE;
                }
                read += INDEX_RECORD_SIZE;
            }
        }
        self.truncate_records(write as u64)?;

        {
            let hdr = self.hdr_mut();
            hdr.first_hole_position = 0;
            hdr.first_hole_records = 0;
            hdr.flags &= !HeaderFlags::COMPRESS.bits();
        }
        self.set_flags.remove(HeaderFlags::COMPRESS);
        self.last_lookup = None;

        self.rebuild_hash()
    }

    /// Refill the hash from the record array.
    pub(crate) fn rebuild_hash(&mut self) -> Result<(), Error> {
        let mut pairs = Vec::with_capacity(self.hdr().messages_count as usize);
        let len = self.file_length();
        let mut pos = HDR;
        while pos + RS <= len {
            let rec = self.record_at(pos);
            if rec.uid != 0 {
                pairs.push((rec.uid, pos));
            }
            pos += RS;
        }

        let indexid = self.indexid;
        match self.hash.as_mut() {
            Some(hash) => hash.rebuild(indexid, &pairs)?,
            None => bail!("index {:?} has no hash file open", self.filepath),
        }

        self.hdr_mut().flags &= !HeaderFlags::REBUILD_HASH.bits();
        self.set_flags.remove(HeaderFlags::REBUILD_HASH);
        Ok(())
    }

    /// Materialize newly requested cache fields on existing records.
    ///
    /// The index cannot read the mailbox itself; payloads come from
    /// the backend. Records it cannot serve right now are skipped and
    /// stay on their old field set.
    pub(crate) fn update_cache(&mut self) -> Result<(), Error> {
        self.require_exclusive()?;

        let wanted = DataFields::from_bits_truncate(self.hdr().cache_fields);

        let mut offsets = Vec::new();
        let len = self.file_length();
        let mut pos = HDR;
        while pos + RS <= len {
            let rec = self.record_at(pos);
            if rec.uid != 0 && !rec.cached_fields().contains(wanted) {
                offsets.push(pos);
            }
            pos += RS;
        }

        for offset in offsets {
            let rec_ref = self.record_ref_at(offset);
            let missing = wanted - rec_ref.cached_fields();

            let supplied = self.with_backend(|backend, index| {
                backend.cache_fields(index, &rec_ref, missing)
            })?;
            let supplied = match supplied {
                Some(fields) if !fields.is_empty() => fields,
                _ => continue,
            };

            // carry the old payloads over into the fresh run
            let mut run: Vec<(DataFields, Vec<u8>)> = Vec::new();
            if rec_ref.data_size() > 0 {
                let data = match self.data.as_ref() {
                    Some(data) => data,
                    None => bail!("index {:?} has no data file open", self.filepath),
                };
                for field in DATA_FIELDS {
                    if !rec_ref.cached_fields().contains(*field) {
                        continue;
                    }
                    if let Some(bytes) = data.lookup(
                        rec_ref.record.data_position as u64,
                        rec_ref.record.data_size,
                        *field,
                    )? {
                        run.push((*field, bytes));
                    }
                }
            }
            for (field, bytes) in supplied {
                if missing.contains(field) {
                    run.push((field, bytes));
                }
            }

            let mut cached = DataFields::empty();
            for (field, _) in &run {
                cached |= *field;
            }

            let refs: Vec<(DataFields, &[u8])> =
                run.iter().map(|(field, bytes)| (*field, bytes.as_slice())).collect();
            let (new_pos, new_size) = match self.data.as_mut() {
                Some(data) => data.append_fields(&refs)?,
                None => bail!("index {:?} has no data file open", self.filepath),
            };

            let old_size = rec_ref.data_size();
            if old_size > 0 {
                if let Some(data) = self.data.as_mut() {
                    if data.add_deleted_space(old_size as u64)? {
                        self.set_flags |= HeaderFlags::COMPRESS_DATA;
                    }
                }
            }

            let rec = self.record_at_mut(offset);
            rec.data_position = new_pos as libc::off_t;
            rec.data_size = new_size;
            rec.cached_fields = cached.bits();
        }

        self.hdr_mut().flags &= !HeaderFlags::CACHE_FIELDS.bits();
        self.set_flags.remove(HeaderFlags::CACHE_FIELDS);
        Ok(())
    }

    /// Rewrite the data file without its deleted space, re-pointing
    /// every live record at its new run position.
    pub(crate) fn compress_data(&mut self) -> Result<(), Error> {
        self.require_exclusive()?;

        let mut moves = Vec::new();
        let len = self.file_length();
        let mut pos = HDR;
        while pos + RS <= len {
            let rec = self.record_at(pos);
            if rec.uid != 0 && rec.data_size > 0 {
                moves.push((pos, rec.data_position as u64, rec.data_size));
            }
            pos += RS;
        }

        let runs: Vec<(u64, u32)> = moves.iter().map(|m| (m.1, m.2)).collect();
        let new_positions = match self.data.as_mut() {
            Some(data) => data.compact(&runs)?,
            None => bail!("index {:?} has no data file open", self.filepath),
        };

        for ((offset, _, _), new_pos) in moves.iter().zip(new_positions) {
            self.record_at_mut(*offset).data_position = new_pos as libc::off_t;
        }

        self.hdr_mut().flags &= !HeaderFlags::COMPRESS_DATA.bits();
        self.set_flags.remove(HeaderFlags::COMPRESS_DATA);
        Ok(())
    }
}
