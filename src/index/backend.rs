use anyhow::Error;

use super::*;

/// Capabilities a mailbox format implementation provides to the
/// index. The index only manages its own files; anything that needs
/// to read the actual mailbox goes through this trait.
pub trait MailboxBackend {
    /// Repopulate the index from the mailbox. The record array and
    /// the data file have been reset when this is called; records are
    /// added back through [MailIndex::append].
    fn rebuild(&mut self, index: &mut MailIndex) -> Result<(), Error>;

    /// Reconcile the index with external mailbox changes. Called
    /// before a lock is handed to the caller.
    fn sync(&mut self, _index: &mut MailIndex) -> Result<(), Error> {
        Ok(())
    }

    /// Best-effort repair after a writer died mid-update. The index
    /// has already recounted its own header at this point.
    fn fsck(&mut self, _index: &mut MailIndex) -> Result<(), Error> {
        Ok(())
    }

    /// Produce payloads for cache fields missing on `rec`, or None
    /// when the mailbox cannot serve them right now. Used when the
    /// requested cache field set grew after records were written.
    fn cache_fields(
        &mut self,
        _index: &MailIndex,
        _rec: &RecordRef,
        _missing: DataFields,
    ) -> Result<Option<Vec<(DataFields, Vec<u8>)>>, Error> {
        Ok(None)
    }
}

/// Backend for an empty mailbox; rebuilds find nothing to add.
pub struct EmptyMailbox;

impl MailboxBackend for EmptyMailbox {
    fn rebuild(&mut self, _index: &mut MailIndex) -> Result<(), Error> {
        Ok(())
    }
}
