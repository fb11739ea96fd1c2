//! Append-only meta-logs.
//!
//! A meta-log is a stream of length-framed, type-tagged, checksummed
//! records replayed in order on restart to reconstruct a live entity set.
//! Two meta-logs exist in the system: the master meta-log (MML), which
//! records recovery-operation state transitions, and one per range server
//! (RSML), which records that server's live ranges.
//!
//! File layout:
//!
//! ```text
//! [FILE_MAGIC:u32][version:u16]
//! ([type_tag:u32][len:u32][payload][crc32:u32])*
//! ```
//!
//! The crc covers tag, length and payload. A truncated trailing record
//! (crash mid-append) is tolerated and dropped with a warning; a checksum
//! mismatch earlier in the stream is corruption and surfaces as an error.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::{LogError, Result};

const FILE_MAGIC: u32 = 0x54_4D_4C_47; // "TMLG"
const VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 6;
const RECORD_HEADER_LEN: usize = 8;

/// An entity that can be recorded in a meta-log.
pub trait MetaLogEntity {
    /// Type tag distinguishing this entity kind in the stream.
    fn type_tag(&self) -> u32;

    /// Encodes the entity payload.
    fn encode_payload(&self, buf: &mut BytesMut);
}

/// One raw record read back from a meta-log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaLogRecord {
    pub type_tag: u32,
    pub payload: Bytes,
}

/// Appends records to a meta-log; the single durable writer of its file.
pub struct MetaLogWriter {
    path: PathBuf,
    file: File,
}

impl MetaLogWriter {
    /// Atomically replaces the log at `path` with a fresh one seeded with
    /// `entities`.
    ///
    /// Writing an empty entity slice retires all prior state in one
    /// switch, which is how a recovered server's meta-log is erased.
    pub fn create(path: &Path, entities: &[&dyn MetaLogEntity]) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut header = [0u8; FILE_HEADER_LEN];
            header[..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
            header[4..6].copy_from_slice(&VERSION.to_le_bytes());
            tmp.write_all(&header)?;
            for entity in entities {
                tmp.write_all(&encode_record(*entity))?;
            }
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, path)?;
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Opens an existing log for appending, creating an empty one if none
    /// exists.
    pub fn open(path: &Path) -> Result<Self> {
        if path.exists() {
            let file = OpenOptions::new().append(true).open(path)?;
            Ok(Self {
                path: path.to_path_buf(),
                file,
            })
        } else {
            Self::create(path, &[])
        }
    }

    /// Appends one entity record and syncs it to disk.
    pub fn append(&mut self, entity: &dyn MetaLogEntity) -> Result<()> {
        self.file.write_all(&encode_record(entity))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Appends several entity records as one durable batch: a single
    /// write and a single sync, so either all records land or none do
    /// short of a torn tail.
    pub fn append_batch(&mut self, entities: &[&dyn MetaLogEntity]) -> Result<()> {
        let mut batch = Vec::new();
        for entity in entities {
            batch.extend_from_slice(&encode_record(*entity));
        }
        self.file.write_all(&batch)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_record(entity: &dyn MetaLogEntity) -> Vec<u8> {
    let mut payload = BytesMut::new();
    entity.encode_payload(&mut payload);
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len() + 4);
    record.extend_from_slice(&entity.type_tag().to_le_bytes());
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&payload);
    let crc = crc32fast::hash(&record);
    record.extend_from_slice(&crc.to_le_bytes());
    record
}

/// Replays a meta-log from disk.
pub struct MetaLogReader;

impl MetaLogReader {
    /// Reads every record in append order.
    ///
    /// A missing file reads as an empty log.
    pub fn read(path: &Path) -> Result<Vec<MetaLogRecord>> {
        let mut data = Vec::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_end(&mut data)?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        }
        if data.len() < FILE_HEADER_LEN {
            return Err(corrupt(path, "missing file header"));
        }
        let magic = u32::from_le_bytes(data[..4].try_into().unwrap());
        if magic != FILE_MAGIC {
            return Err(corrupt(path, "bad file magic"));
        }

        let mut records = Vec::new();
        let mut offset = FILE_HEADER_LEN;
        while offset < data.len() {
            let remaining = &data[offset..];
            if remaining.len() < RECORD_HEADER_LEN {
                warn!(path = %path.display(), offset, "dropping torn trailing record header");
                break;
            }
            let type_tag = u32::from_le_bytes(remaining[..4].try_into().unwrap());
            let len = u32::from_le_bytes(remaining[4..8].try_into().unwrap()) as usize;
            let Some(framed) = remaining.get(..RECORD_HEADER_LEN + len + 4) else {
                warn!(path = %path.display(), offset, "dropping torn trailing record");
                break;
            };
            let crc_stored = u32::from_le_bytes(
                framed[RECORD_HEADER_LEN + len..].try_into().unwrap(),
            );
            if crc32fast::hash(&framed[..RECORD_HEADER_LEN + len]) != crc_stored {
                // Torn tails are survivable; a bad checksum with records
                // after it is not.
                if offset + framed.len() == data.len() {
                    warn!(path = %path.display(), offset, "dropping trailing record with bad crc");
                    break;
                }
                return Err(LogError::ChecksumMismatch {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                });
            }
            records.push(MetaLogRecord {
                type_tag,
                payload: Bytes::copy_from_slice(&framed[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len]),
            });
            offset += framed.len();
        }
        Ok(records)
    }
}

fn corrupt(path: &Path, reason: &str) -> LogError {
    LogError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
