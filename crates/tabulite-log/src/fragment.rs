//! Commit-log fragment files.
//!
//! A fragment is one file named by its 32-bit id (rendered in decimal)
//! inside a commit-log directory. The file is a sequence of blocks:
//!
//! ```text
//! [BLOCK_MAGIC:u32][compression:u8][raw_len:u32][stored_len:u32][crc32:u32][payload]
//! ```
//!
//! The payload opens with the owning table (`vstr id, vi32 generation`)
//! followed by a cell block (`vstr row, vi64 revision, vstr value` per
//! cell), optionally compressed; the crc covers the stored payload
//! bytes. Cells within one fragment replay in file order; ordering
//! across fragments is reconstructed from cell revisions.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tabulite_types::{CellKey, TableId};
use tabulite_wire::serial::{get_cell, get_vi32, get_vstr_utf8, put_cell, put_vi32, put_vstr};
use tracing::warn;

use crate::codec::{CodecRegistry, CompressionKind};
use crate::{LogError, Result};

const BLOCK_MAGIC: u32 = 0x54_42_4C_4B; // "TBLK"
const BLOCK_HEADER_LEN: usize = 17;

/// One decoded fragment block: a table and its cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentBlock {
    pub table: TableId,
    pub cells: Vec<(CellKey, Bytes)>,
}

/// Encodes a block payload: table prefix followed by the cell sequence.
pub fn encode_block_payload(table: &TableId, cells: &[(CellKey, Bytes)]) -> BytesMut {
    let mut payload = BytesMut::new();
    put_vstr(&mut payload, table.id.as_bytes());
    put_vi32(&mut payload, table.generation as i32);
    for (key, value) in cells {
        put_cell(&mut payload, key, value);
    }
    payload
}

/// Decodes a block payload produced by [`encode_block_payload`], or by a
/// player concatenating raw cell bytes under one table prefix.
pub fn decode_block_payload(mut input: &[u8]) -> Result<FragmentBlock> {
    let id = get_vstr_utf8(&mut input)?;
    let generation = get_vi32(&mut input)? as u32;
    let mut cells = Vec::new();
    while !input.is_empty() {
        cells.push(get_cell(&mut input)?);
    }
    Ok(FragmentBlock {
        table: TableId::new(id, generation),
        cells,
    })
}

/// Path of fragment `id` inside `dir`.
pub fn fragment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(id.to_string())
}

/// Lists the fragment ids present in a commit-log directory, ascending.
///
/// Entries whose names are not valid fragment ids are ignored. A missing
/// directory reads as empty: a server that never wrote the group's log
/// has nothing to replay.
pub fn fragment_ids(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(error) => return Err(error.into()),
    };
    for entry in entries {
        let entry = entry?;
        match entry.file_name().to_string_lossy().parse::<u32>() {
            Ok(id) => ids.push(id),
            Err(_) => warn!(name = %entry.file_name().to_string_lossy(),
                            "ignoring non-fragment file in log directory"),
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Appends blocks to one fragment file.
pub struct FragmentWriter {
    path: PathBuf,
    file: File,
    compression: CompressionKind,
    registry: CodecRegistry,
}

impl FragmentWriter {
    /// Opens (creating if absent) the fragment file for appending.
    pub fn open(dir: &Path, id: u32, compression: CompressionKind) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Self::open_path(fragment_path(dir, id), compression)
    }

    pub fn open_path(path: PathBuf, compression: CompressionKind) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            compression,
            registry: CodecRegistry::new(),
        })
    }

    /// Appends one block of cells for `table`.
    pub fn append_cells(&mut self, table: &TableId, cells: &[(CellKey, Bytes)]) -> Result<()> {
        self.append_payload(&encode_block_payload(table, cells))
    }

    /// Appends one block from an already-encoded payload (table prefix
    /// included).
    pub fn append_payload(&mut self, payload: &[u8]) -> Result<()> {
        let stored = self.registry.compress(self.compression, payload)?;
        let mut header = [0u8; BLOCK_HEADER_LEN];
        header[..4].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
        header[4] = self.compression.as_u8();
        header[5..9].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[9..13].copy_from_slice(&(stored.len() as u32).to_le_bytes());
        header[13..17].copy_from_slice(&crc32fast::hash(&stored).to_le_bytes());
        self.file.write_all(&header)?;
        self.file.write_all(&stored)?;
        Ok(())
    }

    /// Flushes buffered data and syncs it to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads one fragment file, verifying checksums.
pub struct FragmentReader {
    path: PathBuf,
    data: Vec<u8>,
}

impl FragmentReader {
    pub fn open(dir: &Path, id: u32) -> Result<Self> {
        Self::open_path(fragment_path(dir, id))
    }

    pub fn open_path(path: PathBuf) -> Result<Self> {
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        Ok(Self { path, data })
    }

    /// Decodes all blocks in file order.
    pub fn blocks(&self) -> Result<Vec<FragmentBlock>> {
        let registry = CodecRegistry::new();
        let mut blocks = Vec::new();
        let mut offset = 0usize;
        while offset < self.data.len() {
            let remaining = &self.data[offset..];
            if remaining.len() < BLOCK_HEADER_LEN {
                return Err(self.corrupt(offset, "truncated block header"));
            }
            let magic = u32::from_le_bytes(remaining[..4].try_into().unwrap());
            if magic != BLOCK_MAGIC {
                return Err(self.corrupt(offset, "bad block magic"));
            }
            let compression = CompressionKind::from_u8(remaining[4])
                .ok_or_else(|| self.corrupt(offset, "unknown compression kind"))?;
            let stored_len = u32::from_le_bytes(remaining[9..13].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(remaining[13..17].try_into().unwrap());
            let stored = remaining
                .get(BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + stored_len)
                .ok_or_else(|| self.corrupt(offset, "truncated block payload"))?;
            if crc32fast::hash(stored) != crc {
                return Err(LogError::ChecksumMismatch {
                    path: self.path.clone(),
                    offset: offset as u64,
                });
            }
            let payload = registry.decompress(compression, stored)?;
            blocks.push(decode_block_payload(&payload)?);
            offset += BLOCK_HEADER_LEN + stored_len;
        }
        Ok(blocks)
    }

    fn corrupt(&self, offset: usize, reason: &str) -> LogError {
        LogError::Corrupt {
            path: self.path.clone(),
            reason: format!("{reason} at offset {offset}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cell(row: &str, revision: i64, value: &str) -> (CellKey, Bytes) {
        (
            CellKey::new(row.as_bytes().to_vec(), revision),
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    fn table() -> TableId {
        TableId::new("7", 1)
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let cells = vec![cell("row1", 10, "v1"), cell("row2", 11, "v2")];
        let mut writer = FragmentWriter::open(dir.path(), 42, CompressionKind::Lz4).unwrap();
        writer.append_cells(&table(), &cells).unwrap();
        writer
            .append_cells(&TableId::new("8", 2), &[cell("row3", 12, "v3")])
            .unwrap();
        writer.sync().unwrap();

        let blocks = FragmentReader::open(dir.path(), 42).unwrap().blocks().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].table, table());
        assert_eq!(blocks[0].cells, cells);
        assert_eq!(blocks[1].table, TableId::new("8", 2));
        assert_eq!(blocks[1].cells[0].0.row.as_ref(), b"row3");
    }

    #[test]
    fn fragment_ids_lists_numeric_names_sorted() {
        let dir = TempDir::new().unwrap();
        for id in [7u32, 42, 3] {
            FragmentWriter::open(dir.path(), id, CompressionKind::None).unwrap();
        }
        fs::write(dir.path().join("not-a-fragment"), b"x").unwrap();
        assert_eq!(fragment_ids(dir.path()).unwrap(), vec![3, 7, 42]);
    }

    #[test]
    fn missing_directory_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        assert!(fragment_ids(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn corrupted_block_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let mut writer = FragmentWriter::open(dir.path(), 1, CompressionKind::None).unwrap();
        writer.append_cells(&table(), &[cell("row", 1, "value")]).unwrap();
        writer.sync().unwrap();

        let path = fragment_path(dir.path(), 1);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data).unwrap();

        let reader = FragmentReader::open(dir.path(), 1).unwrap();
        assert!(matches!(
            reader.blocks(),
            Err(LogError::ChecksumMismatch { .. })
        ));
    }
}
