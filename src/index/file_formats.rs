use bitflags::bitflags;

/// Version of the on-disk index format. Files with a different
/// version are refused at open.
pub const MAIL_INDEX_VERSION: u32 = 3;

/// Primary index file name inside the mailbox directory. The
/// `-<hostname>` fallback and any other sibling starting with this
/// prefix are accepted as candidates too.
pub const INDEX_FILE_PREFIX: &str = ".imap.index";

/// Record-layout variant marker stored in `compat_data[0]`.
pub const COMPAT_FLAGS: u8 = 0x01;

/// Stop assigning UIDs this close to INT_MAX and rebuild instead.
pub const NEXT_UID_REBUILD_LIMIT: u32 = (std::i32::MAX as u32) - 1024;

bitflags! {
    /// Header flag bits. The bit order is public ABI.
    pub struct HeaderFlags: u32 {
        /// Index is known corrupt, next open runs a full rebuild.
        const REBUILD       = 0x01;
        /// An exclusive writer is (or was) in progress; cleared only
        /// on clean release.
        const FSCK          = 0x02;
        /// Record array contains non-leading holes, compact on next open.
        const COMPRESS      = 0x04;
        const REBUILD_HASH  = 0x08;
        const CACHE_FIELDS  = 0x10;
        const COMPRESS_DATA = 0x20;
    }
}

bitflags! {
    /// Standard IMAP system flags kept in each record.
    pub struct MessageFlags: u32 {
        const ANSWERED = 0x01;
        const FLAGGED  = 0x02;
        const DELETED  = 0x04;
        const SEEN     = 0x08;
        const DRAFT    = 0x10;
    }
}

bitflags! {
    /// Kinds of variable-length fields cacheable in the data file.
    pub struct DataFields: u32 {
        const LOCATION      = 0x01;
        const ENVELOPE      = 0x02;
        const BODY          = 0x04;
        const BODYSTRUCTURE = 0x08;
        const MD5           = 0x10;
        const MESSAGESIZE   = 0x20;
        const VIRTUALSIZE   = 0x40;
    }
}

/// All field kinds in bit order, for iteration.
pub const DATA_FIELDS: &[DataFields] = &[
    DataFields::LOCATION,
    DataFields::ENVELOPE,
    DataFields::BODY,
    DataFields::BODYSTRUCTURE,
    DataFields::MD5,
    DataFields::MESSAGESIZE,
    DataFields::VIRTUALSIZE,
];

/// Fields cached for new records of a freshly created index.
pub const DEFAULT_CACHE_FIELDS: DataFields =
    DataFields::from_bits_truncate(DataFields::LOCATION.bits() | DataFields::MESSAGESIZE.bits());

/// Compat tuple for files written by this build:
/// `{flags byte, sizeof(unsigned int), sizeof(time_t), sizeof(off_t)}`.
pub fn compat_data() -> [u8; 4] {
    [
        COMPAT_FLAGS,
        std::mem::size_of::<libc::c_uint>() as u8,
        std::mem::size_of::<libc::time_t>() as u8,
        std::mem::size_of::<libc::off_t>() as u8,
    ]
}

/// Index file header, at offset 0.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MailIndexHeader {
    pub compat_data: [u8; 4],
    pub version: u32,
    /// Assigned at creation (wall clock seconds). A change under an
    /// open handle means another process rebuilt the index.
    pub indexid: u32,
    pub flags: u32,
    /// Field kinds cached for newly appended records.
    pub cache_fields: u32,
    pub uid_validity: u32,
    pub next_uid: u32,
    pub messages_count: u32,
    pub seen_messages_count: u32,
    pub deleted_messages_count: u32,
    /// Highest UID ever observed as non-recent.
    pub last_nonrecent_uid: u32,
    pub first_unseen_uid_lowwater: u32,
    pub first_deleted_uid_lowwater: u32,
    pub reserved: u32,
    /// Byte offset of the first zero-UID record, or 0 if none.
    pub first_hole_position: libc::off_t,
    /// Length in records of the contiguous hole run starting there.
    pub first_hole_records: u32,
    pub reserved2: u32,
}

pub const INDEX_HEADER_SIZE: usize = std::mem::size_of::<MailIndexHeader>();

impl MailIndexHeader {
    pub fn new(indexid: u32) -> Self {
        Self {
            compat_data: compat_data(),
            version: MAIL_INDEX_VERSION,
            indexid,
            // cleared by the initial rebuild
            flags: HeaderFlags::REBUILD.bits(),
            cache_fields: DEFAULT_CACHE_FIELDS.bits(),
            uid_validity: indexid,
            next_uid: 1,
            messages_count: 0,
            seen_messages_count: 0,
            deleted_messages_count: 0,
            last_nonrecent_uid: 0,
            first_unseen_uid_lowwater: 0,
            first_deleted_uid_lowwater: 0,
            reserved: 0,
            first_hole_position: 0,
            first_hole_records: 0,
            reserved2: 0,
        }
    }

    pub fn header_flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags)
    }

    /// Check the compat tuple and format version.
    pub fn compatible(&self) -> bool {
        self.compat_data == compat_data() && self.version == MAIL_INDEX_VERSION
    }
}

/// One fixed-size message record. A record with `uid == 0` is a hole
/// left behind by an expunge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MailIndexRecord {
    pub uid: u32,
    pub msg_flags: u32,
    /// Field kinds actually present in this record's data file run.
    pub cached_fields: u32,
    pub reserved: u32,
    pub data_position: libc::off_t,
    pub data_size: u32,
    pub reserved2: u32,
}

pub const INDEX_RECORD_SIZE: usize = std::mem::size_of::<MailIndexRecord>();

impl MailIndexRecord {
    pub fn msg_flags(&self) -> MessageFlags {
        MessageFlags::from_bits_truncate(self.msg_flags)
    }

    pub fn cached_fields(&self) -> DataFields {
        DataFields::from_bits_truncate(self.cached_fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        // record array stride must stay 8-byte aligned on LP64
        assert_eq!(INDEX_HEADER_SIZE % 8, 0);
        assert_eq!(INDEX_RECORD_SIZE % 8, 0);
        assert_eq!(INDEX_RECORD_SIZE, 32);
    }

    #[test]
    fn test_compat_probing() {
        let hdr = MailIndexHeader::new(1234);
        assert!(hdr.compatible());

        let mut other = hdr;
        other.version += 1;
        assert!(!other.compatible());

        let mut other = hdr;
        other.compat_data[2] ^= 0xff;
        assert!(!other.compatible());
    }

    #[test]
    fn test_new_header() {
        let hdr = MailIndexHeader::new(99);
        assert_eq!(hdr.uid_validity, 99);
        assert_eq!(hdr.next_uid, 1);
        assert!(hdr.header_flags().contains(HeaderFlags::REBUILD));
    }
}
