//! `BinaryArchive`: the reference [`Archive`](super::Archive) implementation.
//!
//! One data file per field (`P_<fieldname>.dat`, payloads concatenated in
//! write order) plus an offset/checksum table persisted as
//! `ArchiveMetaData-<prefix>.json`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use super::Archive;
use crate::error::{Error, Result};
use crate::metainfo::{ElementType, Scalar};
use crate::savepoint::FieldId;
use crate::view::StorageView;

const ARCHIVE_NAME: &str = "Binary";
const ARCHIVE_VERSION: i32 = 1;
const CHECKSUM_ALGORITHM: &str = "sha256";

/// One entry in a field's offset table: where its payload starts, and the
/// hex-encoded digest that both deduplicates and seals it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetEntry {
    /// Byte offset into the field's data file.
    pub offset: u64,
    /// Lowercase hex SHA-256 of the raw payload bytes.
    pub checksum: String,
}

/// An ordered, append-only list of [`OffsetEntry`] for one field. Position
/// in the table IS the field's stable id within that field name.
#[derive(Debug, Clone, Default)]
pub struct FieldOffsetTable {
    entries: Vec<OffsetEntry>,
}

impl FieldOffsetTable {
    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an existing entry with the given checksum, for dedup.
    pub fn find_checksum(&self, checksum: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.checksum == checksum)
    }

    /// Entry at `id`.
    pub fn get(&self, id: usize) -> Option<&OffsetEntry> {
        self.entries.get(id)
    }

    /// Append an entry, used by the legacy upgrade path to reconstruct a
    /// table from a pre-existing offsets document.
    pub(crate) fn push(&mut self, entry: OffsetEntry) {
        self.entries.push(entry);
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

/// Encode a view's elements into a contiguous little-endian byte buffer,
/// per §4.4 step 1. Strings are length-prefixed (u32 LE) so the decoder can
/// recover element boundaries; all other tags are fixed width.
fn encode_view(view: &dyn StorageView) -> Vec<u8> {
    let mut buf = Vec::new();
    for scalar in view.elements() {
        match scalar {
            Scalar::Boolean(v) => buf.push(v as u8),
            Scalar::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Scalar::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Scalar::Float32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Scalar::Float64(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Scalar::String(v) => {
                let bytes = v.as_bytes();
                buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(bytes);
            }
        }
    }
    buf
}

/// Decode `bytes` into exactly `count` scalars of `element_type`, per §4.4
/// step 4 (scatter into the view in element order).
fn decode_elements(element_type: ElementType, count: u64, bytes: &[u8]) -> Result<Vec<Scalar>> {
    let mut out = Vec::with_capacity(count as usize);
    let mut cursor = 0usize;
    for _ in 0..count {
        match element_type {
            ElementType::Boolean => {
                let b = *bytes.get(cursor).ok_or_else(|| short_decode_error())?;
                out.push(Scalar::Boolean(b != 0));
                cursor += 1;
            }
            ElementType::Int32 => {
                let slice = bytes
                    .get(cursor..cursor + 4)
                    .ok_or_else(short_decode_error)?;
                out.push(Scalar::Int32(i32::from_le_bytes(slice.try_into().unwrap())));
                cursor += 4;
            }
            ElementType::Int64 => {
                let slice = bytes
                    .get(cursor..cursor + 8)
                    .ok_or_else(short_decode_error)?;
                out.push(Scalar::Int64(i64::from_le_bytes(slice.try_into().unwrap())));
                cursor += 8;
            }
            ElementType::Float32 => {
                let slice = bytes
                    .get(cursor..cursor + 4)
                    .ok_or_else(short_decode_error)?;
                out.push(Scalar::Float32(f32::from_le_bytes(slice.try_into().unwrap())));
                cursor += 4;
            }
            ElementType::Float64 => {
                let slice = bytes
                    .get(cursor..cursor + 8)
                    .ok_or_else(short_decode_error)?;
                out.push(Scalar::Float64(f64::from_le_bytes(slice.try_into().unwrap())));
                cursor += 8;
            }
            ElementType::String => {
                let len_slice = bytes
                    .get(cursor..cursor + 4)
                    .ok_or_else(short_decode_error)?;
                let len = u32::from_le_bytes(len_slice.try_into().unwrap()) as usize;
                cursor += 4;
                let str_bytes = bytes.get(cursor..cursor + len).ok_or_else(short_decode_error)?;
                out.push(Scalar::String(
                    String::from_utf8(str_bytes.to_vec())
                        .map_err(|_| Error::MetadataCorrupt("non-UTF8 string payload".into()))?,
                ));
                cursor += len;
            }
        }
    }
    Ok(out)
}

fn short_decode_error() -> Error {
    Error::MetadataCorrupt("payload shorter than declared element count".into())
}

fn data_file_path(dir: &Path, prefix: &str, field: &str) -> PathBuf {
    dir.join(format!("{prefix}_{field}.dat"))
}

fn archive_metadata_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("ArchiveMetaData-{prefix}.json"))
}

/// The reference [`Archive`](super::Archive) implementation: one data file
/// per field, with an offset/checksum table persisted to
/// `ArchiveMetaData-<prefix>.json`.
#[derive(Debug)]
pub struct BinaryArchive {
    dir: PathBuf,
    prefix: String,
    tables: Vec<(String, FieldOffsetTable)>,
}

impl BinaryArchive {
    /// Construct an archive directly from reconstructed offset tables,
    /// without touching disk. Used by the legacy upgrade path, which
    /// rebuilds tables from a pre-existing offsets document while the raw
    /// `.dat` files are left untouched on disk.
    pub(crate) fn from_tables(dir: PathBuf, prefix: String, tables: Vec<(String, FieldOffsetTable)>) -> Self {
        Self { dir, prefix, tables }
    }

    /// Best-effort persist the offset tables to `ArchiveMetaData-<prefix>.json`.
    pub(crate) fn persist_to_disk(&self) -> Result<()> {
        self.persist()
    }

    /// Open (or create an empty) archive under `dir` for archive `prefix`.
    /// If `ArchiveMetaData-<prefix>.json` exists it is parsed; otherwise an
    /// empty table set is used.
    #[instrument(skip_all, fields(prefix = %prefix))]
    pub fn open(dir: &Path, prefix: &str) -> Result<Self> {
        let meta_path = archive_metadata_path(dir, prefix);
        let tables = if meta_path.exists() {
            let text = fs::read_to_string(&meta_path)?;
            let doc: serde_json::Value = serde_json::from_str(&text)?;
            Self::parse_tables(&doc)?
        } else {
            Vec::new()
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_owned(),
            tables,
        })
    }

    fn parse_tables(doc: &serde_json::Value) -> Result<Vec<(String, FieldOffsetTable)>> {
        let fields_table = doc
            .get("fields_table")
            .and_then(|v| v.as_object())
            .ok_or_else(|| Error::MetadataCorrupt("archive metadata missing 'fields_table'".into()))?;
        let mut tables = Vec::new();
        for (name, entries) in fields_table {
            let entries = entries
                .as_array()
                .ok_or_else(|| Error::MetadataCorrupt(format!("field '{name}' entries must be an array")))?;
            let mut table = FieldOffsetTable::default();
            for entry in entries {
                let pair = entry
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| Error::MetadataCorrupt(format!("malformed offset entry for '{name}'")))?;
                let offset = pair[0]
                    .as_u64()
                    .ok_or_else(|| Error::MetadataCorrupt(format!("malformed offset for '{name}'")))?;
                let checksum = pair[1]
                    .as_str()
                    .ok_or_else(|| Error::MetadataCorrupt(format!("malformed checksum for '{name}'")))?
                    .to_owned();
                table.entries.push(OffsetEntry { offset, checksum });
            }
            tables.push((name.clone(), table));
        }
        Ok(tables)
    }

    fn table_for(&self, name: &str) -> Option<&FieldOffsetTable> {
        self.tables.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    fn table_for_mut(&mut self, name: &str) -> &mut FieldOffsetTable {
        if self.tables.iter().any(|(n, _)| n == name) {
            &mut self.tables.iter_mut().find(|(n, _)| n == name).unwrap().1
        } else {
            self.tables.push((name.to_owned(), FieldOffsetTable::default()));
            &mut self.tables.last_mut().unwrap().1
        }
    }

    /// Atomically rewrite `ArchiveMetaData-<prefix>.json` via a sibling
    /// temp file plus rename, per §5.
    fn persist(&self) -> Result<()> {
        let mut fields_table = serde_json::Map::new();
        for (name, table) in &self.tables {
            let entries: Vec<serde_json::Value> = table
                .entries
                .iter()
                .map(|e| json!([e.offset, e.checksum]))
                .collect();
            fields_table.insert(name.clone(), serde_json::Value::Array(entries));
        }
        let doc = json!({
            "archive_name": ARCHIVE_NAME,
            "archive_version": ARCHIVE_VERSION,
            "checksum_algorithm": CHECKSUM_ALGORITHM,
            "fields_table": fields_table,
        });
        let text = serde_json::to_string_pretty(&doc)?;
        let final_path = archive_metadata_path(&self.dir, &self.prefix);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.flush()?;
        tmp.persist(final_path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

impl Archive for BinaryArchive {
    #[instrument(skip(self, view), fields(field = %name))]
    fn write(&mut self, name: &str, view: &dyn StorageView) -> Result<FieldId> {
        let bytes = encode_view(view);
        let checksum = digest_hex(&bytes);

        if let Some(existing) = self.table_for(name).and_then(|t| t.find_checksum(&checksum)) {
            debug!(id = existing, "deduplicated write");
            return Ok(FieldId::new(existing));
        }

        let path = data_file_path(&self.dir, &self.prefix, name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&bytes)?;
        file.flush()?;

        let table = self.table_for_mut(name);
        table.entries.push(OffsetEntry { offset, checksum });
        let id = table.entries.len() - 1;
        self.persist()?;
        debug!(id, offset, "appended new payload");
        Ok(FieldId::new(id))
    }

    #[instrument(skip(self, view), fields(field = %name, id = id.id))]
    fn read(&self, name: &str, id: FieldId, view: &mut dyn StorageView) -> Result<()> {
        let table = self
            .table_for(name)
            .ok_or(Error::ArchiveEntryNotFound { field: name.to_owned(), index: id.id })?;
        let entry = table
            .get(id.id)
            .ok_or(Error::ArchiveEntryNotFound { field: name.to_owned(), index: id.id })?;

        let path = data_file_path(&self.dir, &self.prefix, name);
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        let expected_len = match view.element_type().fixed_size() {
            Some(sz) => view.element_count() * sz as u64,
            None => {
                // Variable-width (string) payloads: length is bounded by
                // the next entry's offset, or end of file for the last entry.
                match table.get(id.id + 1) {
                    Some(next) => next.offset.saturating_sub(entry.offset),
                    None => file_len.saturating_sub(entry.offset),
                }
            }
        };

        if entry.offset + expected_len > file_len {
            return Err(Error::ShortRead {
                field: name.to_owned(),
                offset: entry.offset,
                expected: expected_len,
                available: file_len.saturating_sub(entry.offset),
            });
        }

        file.seek(SeekFrom::Start(entry.offset))?;
        let mut buf = vec![0u8; expected_len as usize];
        file.read_exact(&mut buf)?;

        let checksum = digest_hex(&buf);
        if checksum != entry.checksum {
            return Err(Error::ChecksumMismatch {
                field: name.to_owned(),
                offset: entry.offset,
            });
        }

        let scalars = decode_elements(view.element_type(), view.element_count(), &buf)?;
        view.fill(Box::new(scalars.into_iter()));
        Ok(())
    }

    #[instrument(skip(self))]
    fn clear(&mut self) -> Result<()> {
        for (name, table) in &mut self.tables {
            table.entries.clear();
            let path = data_file_path(&self.dir, &self.prefix, name);
            if path.exists() {
                File::create(&path)?;
            }
        }
        self.tables.clear();
        if archive_metadata_path(&self.dir, &self.prefix).exists() {
            self.persist()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::OwnedView;
    use tempfile::tempdir;

    fn float_view(values: Vec<f32>) -> OwnedView {
        let len = values.len() as u64;
        OwnedView::new(
            ElementType::Float32,
            vec![len],
            values.into_iter().map(Scalar::Float32).collect(),
        )
    }

    #[test]
    fn dedup_reuses_id_and_does_not_grow_file() {
        let dir = tempdir().unwrap();
        let mut archive = BinaryArchive::open(dir.path(), "P").unwrap();

        let id1 = archive.write("f", &float_view(vec![1.0, 2.0])).unwrap();
        let id2 = archive.write("f", &float_view(vec![1.0, 2.0])).unwrap();
        assert_eq!(id1, id2);

        let path = data_file_path(dir.path(), "P", "f");
        assert_eq!(fs::metadata(path).unwrap().len(), 8);
    }

    #[test]
    fn distinct_content_grows_file_and_gets_distinct_ids() {
        let dir = tempdir().unwrap();
        let mut archive = BinaryArchive::open(dir.path(), "P").unwrap();

        let id1 = archive.write("f", &float_view(vec![1.0, 2.0])).unwrap();
        let id2 = archive.write("f", &float_view(vec![1.0, 3.0])).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(id1.id, 0);
        assert_eq!(id2.id, 1);

        let path = data_file_path(dir.path(), "P", "f");
        assert_eq!(fs::metadata(path).unwrap().len(), 16);
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let mut archive = BinaryArchive::open(dir.path(), "P").unwrap();
        let id = archive.write("f", &float_view(vec![1.0, 2.0, 3.0])).unwrap();

        let mut out = OwnedView::zeroed(ElementType::Float32, vec![3]);
        archive.read("f", id, &mut out).unwrap();
        assert_eq!(out.data(), float_view(vec![1.0, 2.0, 3.0]).data());
    }

    #[test]
    fn reopen_preserves_offset_table() {
        let dir = tempdir().unwrap();
        let id = {
            let mut archive = BinaryArchive::open(dir.path(), "P").unwrap();
            archive.write("f", &float_view(vec![9.0])).unwrap()
        };
        let archive = BinaryArchive::open(dir.path(), "P").unwrap();
        let mut out = OwnedView::zeroed(ElementType::Float32, vec![1]);
        archive.read("f", id, &mut out).unwrap();
        assert_eq!(out.data(), &[Scalar::Float32(9.0)]);
    }

    #[test]
    fn out_of_range_id_is_archive_entry_not_found() {
        let dir = tempdir().unwrap();
        let mut archive = BinaryArchive::open(dir.path(), "P").unwrap();
        archive.write("f", &float_view(vec![1.0])).unwrap();
        let mut out = OwnedView::zeroed(ElementType::Float32, vec![1]);
        let err = archive.read("f", FieldId::new(5), &mut out).unwrap_err();
        assert!(matches!(err, Error::ArchiveEntryNotFound { .. }));
    }

    #[test]
    fn truncated_data_file_is_short_read() {
        let dir = tempdir().unwrap();
        let mut archive = BinaryArchive::open(dir.path(), "P").unwrap();
        let id = archive.write("f", &float_view(vec![1.0, 2.0])).unwrap();
        let path = data_file_path(dir.path(), "P", "f");
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(2).unwrap();

        let mut out = OwnedView::zeroed(ElementType::Float32, vec![2]);
        let err = archive.read("f", id, &mut out).unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }));
    }

    #[test]
    fn empty_payload_is_permitted() {
        let dir = tempdir().unwrap();
        let mut archive = BinaryArchive::open(dir.path(), "P").unwrap();
        let view = OwnedView::new(ElementType::Int32, vec![0], vec![]);
        let id = archive.write("f", &view).unwrap();
        assert_eq!(id.id, 0);
    }
}
