use anyhow::{bail, Error};

use super::*;

const HDR: u64 = INDEX_HEADER_SIZE as u64;
const RS: u64 = INDEX_RECORD_SIZE as u64;

impl MailIndex {
    pub(crate) fn require_lock(&self) -> Result<(), Error> {
        if self.inconsistent {
            bail!(IndexError::Inconsistent);
        }
        if self.lock_type == LockType::Unlock {
            bail!("index {:?} is not locked", self.filepath);
        }
        Ok(())
    }

    /// Look up a record by its 1-based sequence number among live
    /// records in file order.
    ///
    /// Positions before the first hole resolve in O(1); behind it the
    /// engine scans, resuming from the previous lookup when possible.
    pub fn lookup(&mut self, seq: u32) -> Result<Option<RecordRef>, Error> {
        self.require_lock()?;
        if seq == 0 {
            bail!("sequence numbers are 1-based");
        }

        if let Some((off, last_seq)) = self.last_lookup {
            if seq == last_seq && self.valid_record_offset(off) && self.record_at(off).uid != 0 {
                return Ok(Some(self.record_ref_at(off)));
            }
        }

        let naive = HDR + (seq as u64 - 1) * RS;
        if naive + RS > self.file_length() {
            return Ok(None);
        }

        let (hole, hole_records) = {
            let hdr = self.hdr();
            (hdr.first_hole_position as u64, hdr.first_hole_records as u64)
        };

        if hole == 0 || naive < hole {
            // no holes up to here, sequence equals record index
            if self.record_at(naive).uid == 0 {
                self.set_corrupted(&format!(
                    "hole metadata is stale, record at offset {} has UID 0",
                    naive
                ));
                return Ok(None);
            }
            self.last_lookup = Some((naive, seq));
            return Ok(Some(self.record_ref_at(naive)));
        }

        // scan behind the hole run, resuming from the cursor when the
        // target lies further ahead
        let (mut pos, mut count) = match self.last_lookup {
            Some((off, last_seq))
                if seq > last_seq
                    && self.valid_record_offset(off)
                    && self.record_at(off).uid != 0 =>
            {
                (off, last_seq)
            }
            _ => {
                let hole_index = (hole - HDR) / RS;
                (hole + hole_records * RS, (hole_index + 1) as u32)
            }
        };

        let len = self.file_length();
        while pos + RS <= len {
            if self.record_at(pos).uid != 0 {
                if count == seq {
                    self.last_lookup = Some((pos, seq));
                    return Ok(Some(self.record_ref_at(pos)));
                }
                count += 1;
            }
            pos += RS;
        }
        Ok(None)
    }

    /// The next record with a nonzero UID, or None at end of file.
    pub fn next(&self, rec: &RecordRef) -> Result<Option<RecordRef>, Error> {
        self.require_lock()?;

        let len = self.file_length();
        let mut pos = rec.offset + RS;
        while pos + RS <= len {
            if self.record_at(pos).uid != 0 {
                return Ok(Some(self.record_ref_at(pos)));
            }
            pos += RS;
        }
        Ok(None)
    }

    /// First live record whose UID falls into `[first_uid, last_uid]`.
    pub fn lookup_uid_range(
        &mut self,
        first_uid: u32,
        last_uid: u32,
    ) -> Result<Option<RecordRef>, Error> {
        self.require_lock()?;
        if first_uid == 0 || last_uid < first_uid {
            bail!("invalid UID range {}..{}", first_uid, last_uid);
        }

        // hot path: probe the hash for the first few candidate UIDs
        let mut uid = first_uid;
        let mut probes = 0;
        while probes < 5 {
            if let Some(position) = self.hash.as_ref().and_then(|hash| hash.lookup(uid)) {
                if self.valid_record_offset(position) && self.record_at(position).uid == uid {
                    return Ok(Some(self.record_ref_at(position)));
                }
                // stale hash entry
                self.set_flags |= HeaderFlags::REBUILD_HASH;
            }
            if uid == last_uid {
                break;
            }
            uid += 1;
            probes += 1;
        }

        // fall back to a linear scan; live UIDs are strictly
        // increasing in file order, stop once they pass the range
        let len = self.file_length();
        let mut pos = HDR;
        while pos + RS <= len {
            let rec = self.record_at(pos);
            if rec.uid != 0 {
                if rec.uid > last_uid {
                    break;
                }
                if rec.uid >= first_uid {
                    return Ok(Some(self.record_ref_at(pos)));
                }
            }
            pos += RS;
        }
        Ok(None)
    }

    /// Sequence number of `rec` among live records.
    pub fn get_sequence(&mut self, rec: &RecordRef) -> Result<u32, Error> {
        self.require_lock()?;
        self.resolve_record(rec)?;

        if let Some((off, seq)) = self.last_lookup {
            if off == rec.offset {
                return Ok(seq);
            }
        }

        let (hole, hole_records) = {
            let hdr = self.hdr();
            (hdr.first_hole_position as u64, hdr.first_hole_records as u64)
        };

        if hole == 0 || rec.offset < hole {
            let seq = ((rec.offset - HDR) / RS + 1) as u32;
            self.last_lookup = Some((rec.offset, seq));
            return Ok(seq);
        }

        let mut pos = hole + hole_records * RS;
        let mut seq = ((hole - HDR) / RS + 1) as u32;
        let len = self.file_length();
        while pos + RS <= len {
            if pos == rec.offset {
                self.last_lookup = Some((pos, seq));
                return Ok(seq);
            }
            if self.record_at(pos).uid != 0 {
                seq += 1;
            }
            pos += RS;
        }
        bail!(
            "record with UID {} not found behind the hole run",
            rec.record.uid
        );
    }

    /// Read a cached field payload for `rec`.
    ///
    /// A field the record never cached is a plain miss; if the header
    /// does not request it either, it is remembered so future appends
    /// cache it. A field the record advertises but the data file
    /// cannot produce means corruption and requests a rebuild.
    pub fn lookup_field(
        &mut self,
        rec: &RecordRef,
        field: DataFields,
    ) -> Result<Option<Vec<u8>>, Error> {
        self.require_lock()?;
        self.resolve_record(rec)?;

        let live = *self.record_at(rec.offset);
        if !live.cached_fields().contains(field) {
            let header_fields = DataFields::from_bits_truncate(self.hdr().cache_fields);
            if !header_fields.contains(field) {
                self.set_cache_fields |= field;
            }
            return Ok(None);
        }

        let data = match self.data.as_ref() {
            Some(data) => data,
            None => bail!("index {:?} has no data file open", self.filepath),
        };
        match data.lookup(live.data_position as u64, live.data_size, field) {
            Ok(Some(bytes)) => Ok(Some(bytes)),
            Ok(None) => {
                self.set_corrupted(&format!(
                    "record UID {} advertises field {:?} but the data record has no such field",
                    live.uid, field
                ));
                Ok(None)
            }
            Err(err) => {
                self.set_corrupted(&format!(
                    "data record of UID {} is broken - {}",
                    live.uid, err
                ));
                Ok(None)
            }
        }
    }
}
