use std::convert::TryInto;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use super::*;

const DATA_HEADER_SIZE: usize = std::mem::size_of::<DataFileHeader>();
const FIELD_HEADER_SIZE: usize = std::mem::size_of::<DataFieldHeader>();

// compress once half the file is stale, but leave small files alone
const COMPRESS_MIN_SIZE: u64 = 16 * 1024;

fn data_file_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.data", INDEX_FILE_PREFIX))
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct DataFileHeader {
    indexid: u32,
    reserved: u32,
    used_file_size: u64,
    deleted_space: u64,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct DataFieldHeader {
    field: u32,
    /// Payload length rounded up to 4-byte alignment.
    full_field_size: u32,
    data_size: u32,
    crc: u32,
}

/// Store for variable-length cached fields.
///
/// Each index record addresses one packed *run* of field records via
/// `(data_position, data_size)`. Runs are only ever appended; space
/// abandoned by expunges and re-caching is tracked in `deleted_space`
/// until a compaction rewrites the file.
pub struct DataFile {
    path: PathBuf,
    file: File,
    indexid: u32,
    used_file_size: u64,
    deleted_space: u64,
}

impl DataFile {
    pub(crate) fn create(dir: &Path, indexid: u32) -> Result<Self, Error> {
        let path = data_file_path(dir);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|err| format_err!("unable to create data file {:?} - {}", path, err))?;

        let mut this = Self {
            path,
            file,
            indexid,
            used_file_size: DATA_HEADER_SIZE as u64,
            deleted_space: 0,
        };
        this.write_header()?;
        Ok(this)
    }

    pub(crate) fn open(dir: &Path, indexid: u32) -> Result<Self, Error> {
        let path = data_file_path(dir);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| format_err!("unable to open data file {:?} - {}", path, err))?;

        let len = file.metadata()?.len();
        if len < DATA_HEADER_SIZE as u64 {
            bail!("data file {:?} is truncated ({} bytes)", path, len);
        }

        let mut hdr = DataFileHeader {
            indexid: 0,
            reserved: 0,
            used_file_size: 0,
            deleted_space: 0,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(&mut hdr as *mut _ as *mut u8, DATA_HEADER_SIZE)
        };
        file.read_exact_at(bytes, 0)?;

        if hdr.indexid != indexid {
            bail!(
                "data file {:?} belongs to another index (indexid {} != {})",
                path,
                hdr.indexid,
                indexid
            );
        }
        if hdr.used_file_size < DATA_HEADER_SIZE as u64 || hdr.used_file_size > len {
            bail!(
                "data file {:?} used size {} does not fit the file ({} bytes)",
                path,
                hdr.used_file_size,
                len
            );
        }

        Ok(Self {
            path,
            file,
            indexid,
            used_file_size: hdr.used_file_size,
            deleted_space: hdr.deleted_space,
        })
    }

    fn write_header(&mut self) -> Result<(), Error> {
        let hdr = DataFileHeader {
            indexid: self.indexid,
            reserved: 0,
            used_file_size: self.used_file_size,
            deleted_space: self.deleted_space,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(&hdr as *const _ as *const u8, DATA_HEADER_SIZE)
        };
        self.file.write_all_at(bytes, 0)?;
        Ok(())
    }

    /// Append one packed run of field records, returning `(position,
    /// size)` for the index record.
    pub(crate) fn append_fields(
        &mut self,
        fields: &[(DataFields, &[u8])],
    ) -> Result<(u64, u32), Error> {
        let mut buf: Vec<u8> = Vec::new();
        for (field, payload) in fields {
            let padded = (payload.len() + 3) & !3;
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(payload);
            let fh = DataFieldHeader {
                field: field.bits(),
                full_field_size: padded as u32,
                data_size: payload.len() as u32,
                crc: hasher.finalize(),
            };
            let fh_bytes = unsafe {
                std::slice::from_raw_parts(&fh as *const _ as *const u8, FIELD_HEADER_SIZE)
            };
            buf.extend_from_slice(fh_bytes);
            buf.extend_from_slice(payload);
            buf.resize(buf.len() + (padded - payload.len()), 0);
        }

        let position = self.used_file_size;
        self.file.write_all_at(&buf, position)?;
        self.used_file_size += buf.len() as u64;
        self.write_header()?;

        Ok((position, buf.len() as u32))
    }

    fn read_run(&self, position: u64, size: u32) -> Result<Vec<u8>, Error> {
        if position < DATA_HEADER_SIZE as u64
            || position + size as u64 > self.used_file_size
        {
            bail!(
                "data record at {}+{} lies outside the used area ({} bytes)",
                position,
                size,
                self.used_file_size
            );
        }
        let mut buf = vec![0u8; size as usize];
        self.file.read_exact_at(&mut buf, position)?;
        Ok(buf)
    }

    fn parse_field_header(buf: &[u8], off: usize) -> DataFieldHeader {
        DataFieldHeader {
            field: u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap()),
            full_field_size: u32::from_ne_bytes(buf[off + 4..off + 8].try_into().unwrap()),
            data_size: u32::from_ne_bytes(buf[off + 8..off + 12].try_into().unwrap()),
            crc: u32::from_ne_bytes(buf[off + 12..off + 16].try_into().unwrap()),
        }
    }

    /// Fetch one field's payload from the run at `(position, size)`.
    /// `Ok(None)` means the run does not carry that field.
    pub(crate) fn lookup(
        &self,
        position: u64,
        size: u32,
        field: DataFields,
    ) -> Result<Option<Vec<u8>>, Error> {
        if size == 0 {
            return Ok(None);
        }
        let buf = self.read_run(position, size)?;

        let mut off = 0usize;
        while off + FIELD_HEADER_SIZE <= buf.len() {
            let fh = Self::parse_field_header(&buf, off);
            if fh.full_field_size % 4 != 0
                || (fh.data_size as u64) > fh.full_field_size as u64
                || off + FIELD_HEADER_SIZE + fh.full_field_size as usize > buf.len()
            {
                bail!("malformed field record at run offset {}", off);
            }

            if fh.field == field.bits() {
                let start = off + FIELD_HEADER_SIZE;
                let payload = &buf[start..start + fh.data_size as usize];

                let mut hasher = crc32fast::Hasher::new();
                hasher.update(payload);
                if hasher.finalize() != fh.crc {
                    bail!("field {:#x} payload fails its CRC check", fh.field);
                }
                return Ok(Some(payload.to_vec()));
            }
            off += FIELD_HEADER_SIZE + fh.full_field_size as usize;
        }

        if off != buf.len() {
            bail!("trailing garbage after the last field record");
        }
        Ok(None)
    }

    /// Structural and CRC check of the whole run.
    pub(crate) fn record_verify(&self, position: u64, size: u32) -> bool {
        if size == 0 {
            return true;
        }
        let buf = match self.read_run(position, size) {
            Ok(buf) => buf,
            Err(_) => return false,
        };

        let mut off = 0usize;
        while off + FIELD_HEADER_SIZE <= buf.len() {
            let fh = Self::parse_field_header(&buf, off);
            if fh.full_field_size % 4 != 0
                || (fh.data_size as u64) > fh.full_field_size as u64
                || off + FIELD_HEADER_SIZE + fh.full_field_size as usize > buf.len()
            {
                return false;
            }
            let start = off + FIELD_HEADER_SIZE;
            let payload = &buf[start..start + fh.data_size as usize];
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(payload);
            if hasher.finalize() != fh.crc {
                return false;
            }
            off += FIELD_HEADER_SIZE + fh.full_field_size as usize;
        }
        off == buf.len()
    }

    /// Account space abandoned by an expunge. Returns true once a
    /// compaction is worthwhile.
    pub(crate) fn add_deleted_space(&mut self, bytes: u64) -> Result<bool, Error> {
        self.deleted_space += bytes;
        self.write_header()?;
        Ok(self.used_file_size > COMPRESS_MIN_SIZE
            && self.deleted_space * 2 > self.used_file_size)
    }

    /// Drop all runs; the index has no live records left.
    pub(crate) fn reset(&mut self) -> Result<(), Error> {
        self.file.set_len(DATA_HEADER_SIZE as u64)?;
        self.used_file_size = DATA_HEADER_SIZE as u64;
        self.deleted_space = 0;
        self.write_header()
    }

    /// Rewrite the file keeping only the given runs. Returns their new
    /// positions in input order.
    pub(crate) fn compact(&mut self, runs: &[(u64, u32)]) -> Result<Vec<u64>, Error> {
        let mut tmp_os: OsString = self.path.as_os_str().to_owned();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);

        let tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)
            .map_err(|err| format_err!("unable to create {:?} - {}", tmp_path, err))?;

        let mut positions = Vec::with_capacity(runs.len());
        let mut used = DATA_HEADER_SIZE as u64;
        for (position, size) in runs {
            let buf = self.read_run(*position, *size)?;
            tmp.write_all_at(&buf, used)?;
            positions.push(used);
            used += buf.len() as u64;
        }

        let hdr = DataFileHeader {
            indexid: self.indexid,
            reserved: 0,
            used_file_size: used,
            deleted_space: 0,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(&hdr as *const _ as *const u8, DATA_HEADER_SIZE)
        };
        tmp.write_all_at(bytes, 0)?;
        tmp.sync_all()?;

        if let Err(err) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            bail!("unable to replace data file {:?} - {}", self.path, err);
        }

        self.file = tmp;
        self.used_file_size = used;
        self.deleted_space = 0;
        Ok(positions)
    }

    pub(crate) fn sync_file(&mut self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }

    pub(crate) fn deleted_space(&self) -> u64 {
        self.deleted_space
    }
}
