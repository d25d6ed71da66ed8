use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Error;

use mail_index::index::*;

#[derive(Default)]
struct Calls {
    rebuild: usize,
    sync: usize,
    fsck: usize,
}

/// Mailbox backend that counts its hook invocations and repopulates
/// the index with a fixed message list on rebuild.
struct TestMailbox {
    calls: Arc<Mutex<Calls>>,
    messages: Vec<MessageFlags>,
}

impl TestMailbox {
    fn new() -> (Box<Self>, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        (
            Box::new(Self {
                calls: Arc::clone(&calls),
                messages: Vec::new(),
            }),
            calls,
        )
    }
}

impl MailboxBackend for TestMailbox {
    fn rebuild(&mut self, index: &mut MailIndex) -> Result<(), Error> {
        self.calls.lock().unwrap().rebuild += 1;
        let messages = self.messages.clone();
        for flags in messages {
            index.append(flags, &[])?;
        }
        Ok(())
    }

    fn sync(&mut self, _index: &mut MailIndex) -> Result<(), Error> {
        self.calls.lock().unwrap().sync += 1;
        Ok(())
    }

    fn fsck(&mut self, _index: &mut MailIndex) -> Result<(), Error> {
        self.calls.lock().unwrap().fsck += 1;
        Ok(())
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_index(dir: &Path, update_recent: bool) -> (MailIndex, Arc<Mutex<Calls>>) {
    let (backend, calls) = TestMailbox::new();
    let index = MailIndex::open_or_create(dir, backend, update_recent).unwrap();
    (index, calls)
}

/// Header flag word as stored in the file, bypassing the handle.
fn on_disk_flags(dir: &Path) -> u32 {
    let file = std::fs::File::open(dir.join(INDEX_FILE_PREFIX)).unwrap();
    let mut buf = [0u8; 4];
    file.read_exact_at(&mut buf, 12).unwrap();
    u32::from_ne_bytes(buf)
}

/// Walk all live records and check every header invariant against
/// them. Requires a held lock.
fn check_invariants(index: &mut MailIndex) {
    let hdr = index.header().unwrap();

    let mut messages = 0u32;
    let mut seen = 0u32;
    let mut deleted = 0u32;
    let mut prev_uid = 0u32;

    let mut cursor = index.lookup(1).unwrap();
    while let Some(rec) = cursor {
        messages += 1;
        assert!(rec.uid() > prev_uid, "UIDs must increase in file order");
        assert!(rec.uid() < hdr.next_uid);
        prev_uid = rec.uid();

        let flags = rec.msg_flags();
        if flags.contains(MessageFlags::SEEN) {
            seen += 1;
        } else if hdr.first_unseen_uid_lowwater > 0 {
            assert!(rec.uid() >= hdr.first_unseen_uid_lowwater);
        }
        if flags.contains(MessageFlags::DELETED) {
            deleted += 1;
            if hdr.first_deleted_uid_lowwater > 0 {
                assert!(rec.uid() >= hdr.first_deleted_uid_lowwater);
            }
        }
        cursor = index.next(&rec).unwrap();
    }

    assert_eq!(hdr.messages_count, messages);
    assert_eq!(hdr.seen_messages_count, seen);
    assert_eq!(hdr.deleted_messages_count, deleted);
}

#[test]
fn test_fresh_create() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, calls) = open_index(dir.path(), true);

    assert!(dir.path().join(INDEX_FILE_PREFIX).exists());
    let hdr = index.header().unwrap();
    assert_eq!(hdr.next_uid, 1);
    assert_eq!(hdr.messages_count, 0);
    assert_eq!(hdr.uid_validity, hdr.indexid);
    assert_ne!(hdr.indexid, 0);
    // initial rebuild ran and cleared REBUILD; the release cleared FSCK
    assert_eq!(hdr.flags, 0);
    assert_eq!(calls.lock().unwrap().rebuild, 1);

    index.set_lock(LockType::Shared).unwrap();
    check_invariants(&mut index);
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_append_three_counters() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Exclusive).unwrap();
    index.append(MessageFlags::empty(), &[]).unwrap();
    index.append(MessageFlags::SEEN, &[]).unwrap();
    index.append(MessageFlags::DELETED, &[]).unwrap();
    check_invariants(&mut index);
    index.set_lock(LockType::Unlock).unwrap();

    let hdr = index.header().unwrap();
    assert_eq!(hdr.messages_count, 3);
    assert_eq!(hdr.seen_messages_count, 1);
    assert_eq!(hdr.deleted_messages_count, 1);
    assert_eq!(hdr.next_uid, 4);
    assert_eq!(hdr.first_unseen_uid_lowwater, 1);
    assert_eq!(hdr.first_deleted_uid_lowwater, 3);
}

#[test]
fn test_middle_expunge_leaves_tracked_hole() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Exclusive).unwrap();
    index.append(MessageFlags::empty(), &[]).unwrap();
    index.append(MessageFlags::SEEN, &[]).unwrap();
    index.append(MessageFlags::DELETED, &[]).unwrap();

    let rec2 = index.lookup(2).unwrap().unwrap();
    assert_eq!(rec2.uid(), 2);
    index.expunge(&rec2, 2, false).unwrap();

    let hdr = index.header().unwrap();
    assert_eq!(
        hdr.first_hole_position as usize,
        INDEX_HEADER_SIZE + INDEX_RECORD_SIZE
    );
    assert_eq!(hdr.first_hole_records, 1);
    assert_eq!(hdr.messages_count, 2);
    assert_eq!(hdr.seen_messages_count, 0);

    // sequence numbering skips the hole
    let rec = index.lookup(2).unwrap().unwrap();
    assert_eq!(rec.uid(), 3);
    assert_eq!(index.get_sequence(&rec).unwrap(), 2);

    check_invariants(&mut index);
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_second_hole_sets_compress_and_reopen_compacts() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    {
        let (mut index, _calls) = open_index(dir.path(), false);
        index.set_lock(LockType::Exclusive).unwrap();
        index.append(MessageFlags::empty(), &[]).unwrap();
        index.append(MessageFlags::SEEN, &[]).unwrap();
        index.append(MessageFlags::empty(), &[]).unwrap();

        let rec2 = index.lookup(2).unwrap().unwrap();
        index.expunge(&rec2, 2, false).unwrap();

        let rec4 = index.append(MessageFlags::empty(), &[]).unwrap();
        assert_eq!(rec4.uid(), 4);

        // uid 3 sits between the tracked hole and this one
        index.expunge(&rec4, 3, false).unwrap();
        index.set_lock(LockType::Unlock).unwrap();

        let hdr = index.header().unwrap();
        assert_ne!(hdr.flags & HeaderFlags::COMPRESS.bits(), 0);
    }

    // the next open compacts the record array
    let (mut index, _calls) = open_index(dir.path(), false);
    let hdr = index.header().unwrap();
    assert_eq!(hdr.flags & HeaderFlags::COMPRESS.bits(), 0);
    assert_eq!(hdr.first_hole_position, 0);
    assert_eq!(hdr.messages_count, 2);

    index.set_lock(LockType::Shared).unwrap();
    let rec1 = index.lookup(1).unwrap().unwrap();
    let rec2 = index.lookup(2).unwrap().unwrap();
    assert_eq!(rec1.uid(), 1);
    assert_eq!(rec2.uid(), 3);
    check_invariants(&mut index);
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_crash_with_exclusive_lock_triggers_fsck() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    {
        let (mut index, _calls) = open_index(dir.path(), false);
        index.set_lock(LockType::Exclusive).unwrap();
        index.append(MessageFlags::SEEN, &[]).unwrap();
        // "crash": drop the handle without releasing the lock
    }
    assert_ne!(on_disk_flags(dir.path()) & HeaderFlags::FSCK.bits(), 0);

    let (mut index, calls) = open_index(dir.path(), false);
    assert_eq!(calls.lock().unwrap().fsck, 1);
    assert_eq!(on_disk_flags(dir.path()) & HeaderFlags::FSCK.bits(), 0);

    let hdr = index.header().unwrap();
    assert_eq!(hdr.messages_count, 1);
    assert_eq!(hdr.seen_messages_count, 1);

    index.set_lock(LockType::Shared).unwrap();
    check_invariants(&mut index);
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_indexid_change_poisons_handle() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Shared).unwrap();
    index.set_lock(LockType::Unlock).unwrap();

    // another process rebuilds the index with a fresh indexid
    let other_id: u32 = index.header().unwrap().indexid.wrapping_add(17);
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join(INDEX_FILE_PREFIX))
        .unwrap();
    file.write_all_at(&other_id.to_ne_bytes(), 8).unwrap();
    drop(file);

    let err = index.set_lock(LockType::Shared).unwrap_err();
    assert!(is_inconsistency_error(&err));
    assert!(index.is_inconsistent());

    // only teardown is allowed now
    assert!(index.lookup(1).is_err());
    assert!(index.set_lock(LockType::Exclusive).is_err());
    drop(index);
}

#[test]
fn test_append_then_uid_lookup_roundtrip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Exclusive).unwrap();
    let rec = index
        .append(
            MessageFlags::FLAGGED,
            &[(DataFields::LOCATION, b"box/17" as &[u8])],
        )
        .unwrap();
    let uid = rec.uid();

    let found = index.lookup_uid_range(uid, uid).unwrap().unwrap();
    assert_eq!(found.uid(), uid);
    assert_eq!(found.msg_flags(), MessageFlags::FLAGGED);
    assert_eq!(
        index.lookup_field(&found, DataFields::LOCATION).unwrap().unwrap(),
        b"box/17"
    );

    index.expunge(&found, 1, false).unwrap();
    assert!(index.lookup_uid_range(uid, uid).unwrap().is_none());
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_expunge_last_message_truncates_index_and_data() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Exclusive).unwrap();
    let rec = index
        .append(
            MessageFlags::empty(),
            &[(DataFields::LOCATION, b"box/1" as &[u8])],
        )
        .unwrap();
    assert!(rec.data_size() > 0);

    index.expunge(&rec, 1, false).unwrap();
    index.set_lock(LockType::Unlock).unwrap();

    let index_len = std::fs::metadata(dir.path().join(INDEX_FILE_PREFIX))
        .unwrap()
        .len();
    assert_eq!(index_len, INDEX_HEADER_SIZE as u64);

    let hdr = index.header().unwrap();
    assert_eq!(hdr.messages_count, 0);
    assert_eq!(hdr.first_hole_position, 0);
    // next_uid keeps growing even across a full purge
    assert_eq!(hdr.next_uid, 2);
}

#[test]
fn test_update_flags_is_idempotent_in_modify_log() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Exclusive).unwrap();
    let rec = index.append(MessageFlags::empty(), &[]).unwrap();

    index
        .update_flags(&rec, 1, MessageFlags::SEEN, false)
        .unwrap();
    let rec = index.lookup(1).unwrap().unwrap();
    // same flags again: no counter change, no new journal entry
    index
        .update_flags(&rec, 1, MessageFlags::SEEN, false)
        .unwrap();

    let (entries, _) = index.modify_log().unwrap().entries_from(0).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, LogEntryKind::FlagsChanged);
    assert_eq!(entries[0].uid, 1);

    let hdr = index.header().unwrap();
    assert_eq!(hdr.seen_messages_count, 1);
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_expunges_reach_the_modify_log() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Exclusive).unwrap();
    index.append(MessageFlags::empty(), &[]).unwrap();
    index.append(MessageFlags::empty(), &[]).unwrap();

    let rec = index.lookup(1).unwrap().unwrap();
    index.expunge(&rec, 1, true).unwrap();

    let (entries, _) = index.modify_log().unwrap().entries_from(0).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, LogEntryKind::Expunge);
    assert_eq!(entries[0].seq, 1);
    assert_eq!(entries[0].uid, 1);
    assert!(entries[0].external);
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_get_sequence_roundtrip_with_holes() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Exclusive).unwrap();
    for _ in 0..6 {
        index.append(MessageFlags::empty(), &[]).unwrap();
    }
    // punch holes at sequences 2 and 3 (adjacent, one run)
    let rec = index.lookup(2).unwrap().unwrap();
    index.expunge(&rec, 2, false).unwrap();
    let rec = index.lookup(2).unwrap().unwrap();
    assert_eq!(rec.uid(), 3);
    index.expunge(&rec, 2, false).unwrap();

    let hdr = index.header().unwrap();
    assert_eq!(hdr.first_hole_records, 2);
    assert_eq!(hdr.messages_count, 4);

    for n in 1..=4u32 {
        let rec = index.lookup(n).unwrap().unwrap();
        assert_eq!(index.get_sequence(&rec).unwrap(), n, "sequence {}", n);
    }
    assert!(index.lookup(5).unwrap().is_none());

    check_invariants(&mut index);
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_deferred_bits_survive_a_shared_session() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut index =
        MailIndex::open_or_create(dir.path(), Box::new(EmptyMailbox), false).unwrap();

    index.set_lock(LockType::Shared).unwrap();
    index.set_cache_fields(DataFields::ENVELOPE);
    index.set_lock(LockType::Unlock).unwrap();

    let hdr = index.header().unwrap();
    assert_ne!(hdr.cache_fields & DataFields::ENVELOPE.bits(), 0);
}

#[test]
fn test_reading_an_uncached_field_requests_caching() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Exclusive).unwrap();
    let rec = index
        .append(
            MessageFlags::empty(),
            &[(DataFields::LOCATION, b"box/9" as &[u8])],
        )
        .unwrap();

    // ENVELOPE was never requested: miss, but remember the interest
    assert!(index.lookup_field(&rec, DataFields::ENVELOPE).unwrap().is_none());
    index.set_lock(LockType::Unlock).unwrap();

    let hdr = index.header().unwrap();
    assert_ne!(hdr.cache_fields & DataFields::ENVELOPE.bits(), 0);

    // new appends now cache the field
    index.set_lock(LockType::Exclusive).unwrap();
    let rec = index
        .append(
            MessageFlags::empty(),
            &[
                (DataFields::LOCATION, b"box/10" as &[u8]),
                (DataFields::ENVELOPE, b"Subject: hi" as &[u8]),
            ],
        )
        .unwrap();
    assert_eq!(
        index.lookup_field(&rec, DataFields::ENVELOPE).unwrap().unwrap(),
        b"Subject: hi"
    );
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_update_recent_range_moves_forward() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    {
        let (mut index, _calls) = open_index(dir.path(), true);
        assert_eq!(index.first_recent_uid(), 1);
        index.set_lock(LockType::Exclusive).unwrap();
        for _ in 0..3 {
            index.append(MessageFlags::empty(), &[]).unwrap();
        }
        index.set_lock(LockType::Unlock).unwrap();
    }
    {
        // all three messages are recent for this session
        let (index, _calls) = open_index(dir.path(), true);
        assert_eq!(index.first_recent_uid(), 1);
        assert_eq!(index.header().unwrap().last_nonrecent_uid, 3);
    }
    {
        // nothing new since, the recent range is empty
        let (index, _calls) = open_index(dir.path(), true);
        assert_eq!(index.first_recent_uid(), 4);
    }
}

#[test]
fn test_stale_hole_metadata_requests_rebuild() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    index.set_lock(LockType::Exclusive).unwrap();
    index.append(MessageFlags::empty(), &[]).unwrap();
    index.append(MessageFlags::empty(), &[]).unwrap();

    // zero the first record's UID behind the engine's back; the hole
    // cursor still claims there are no holes
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join(INDEX_FILE_PREFIX))
        .unwrap();
    file.write_all_at(&0u32.to_ne_bytes(), INDEX_HEADER_SIZE as u64)
        .unwrap();
    drop(file);

    assert!(index.lookup(1).unwrap().is_none());
    assert!(index.last_error().is_some());
    assert_ne!(
        index.header().unwrap().flags & HeaderFlags::REBUILD.bits(),
        0
    );
    index.set_lock(LockType::Unlock).unwrap();

    // the next open rebuilds from the mailbox
    let (_index, calls) = open_index(dir.path(), false);
    assert_eq!(calls.lock().unwrap().rebuild, 1);
    assert_eq!(on_disk_flags(dir.path()) & HeaderFlags::REBUILD.bits(), 0);
}

#[test]
fn test_clean_release_clears_fsck_and_stamps_mtime() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    let stamp: libc::time_t = 1_500_000_000;
    index.set_lock(LockType::Exclusive).unwrap();
    index.append(MessageFlags::empty(), &[]).unwrap();
    index.set_sync_stamp(stamp);
    index.set_lock(LockType::Unlock).unwrap();

    assert_eq!(on_disk_flags(dir.path()) & HeaderFlags::FSCK.bits(), 0);

    let meta = std::fs::metadata(dir.path().join(INDEX_FILE_PREFIX)).unwrap();
    let mtime = meta
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    assert_eq!(mtime, stamp as u64);
}

#[test]
fn test_lock_upgrade_is_rejected() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut index =
        MailIndex::open_or_create(dir.path(), Box::new(EmptyMailbox), false).unwrap();

    index.set_lock(LockType::Shared).unwrap();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = index.set_lock(LockType::Exclusive);
    }));
    assert!(result.is_err());
}

#[test]
fn test_mutations_require_the_exclusive_lock() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut index, _calls) = open_index(dir.path(), false);

    assert!(index.append(MessageFlags::empty(), &[]).is_err());

    index.set_lock(LockType::Shared).unwrap();
    assert!(index.append(MessageFlags::empty(), &[]).is_err());
    index.set_lock(LockType::Unlock).unwrap();
}

#[test]
fn test_partial_trailing_record_is_truncated_silently() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    {
        let (mut index, _calls) = open_index(dir.path(), false);
        index.set_lock(LockType::Exclusive).unwrap();
        index.append(MessageFlags::empty(), &[]).unwrap();
        index.set_lock(LockType::Unlock).unwrap();
    }

    // simulate an interrupted append: half a record at the tail
    let path = dir.path().join(INDEX_FILE_PREFIX);
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len + (INDEX_RECORD_SIZE as u64 / 2)).unwrap();
    drop(file);

    let (mut index, _calls) = open_index(dir.path(), false);
    assert_eq!(index.header().unwrap().messages_count, 1);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len);

    index.set_lock(LockType::Shared).unwrap();
    check_invariants(&mut index);
    index.set_lock(LockType::Unlock).unwrap();
}
