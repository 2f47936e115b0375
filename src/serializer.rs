//! Serializer Core (`S`): composes the global metainfo, field map, savepoint
//! vector, and archive; enforces the write/read contracts; persists the
//! top-level metadata document.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::archive::{Archive, BinaryArchive};
use crate::error::{Error, Result};
use crate::field::{FieldMap, FieldMetaInfo};
use crate::legacy;
use crate::metainfo::MetaInfoMap;
use crate::savepoint::{Savepoint, SavepointVector};
use crate::view::StorageView;

/// The current on-disk format version, encoded as `100*major + 10*minor + patch`.
pub const CURRENT_VERSION: i32 = 210;
/// The major version required of any document this library opens.
pub const REQUIRED_MAJOR: i32 = 2;

fn version_major(v: i32) -> i32 {
    v / 100
}

/// How a [`Serializer`] was opened, fixing which operations are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Directory and metadata must exist; frozen, no mutation permitted.
    Read,
    /// Directory is created if absent; any existing archive state for this
    /// prefix is cleared.
    Write,
    /// Directory must exist; existing metadata is extended, deduplicating
    /// against prior content.
    Append,
}

fn metadata_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("MetaData-{prefix}.json"))
}

pub(crate) fn legacy_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}.json"))
}

/// Composes the global metainfo map, field map, savepoint vector, and
/// archive; the single entry point callers use to register fields and
/// write/read data.
#[derive(Debug)]
pub struct Serializer {
    dir: PathBuf,
    prefix: String,
    mode: OpenMode,
    global_meta: MetaInfoMap,
    field_map: FieldMap,
    savepoints: SavepointVector,
    archive: BinaryArchive,
}

impl Serializer {
    /// Open a serializer rooted at `dir` for archive `prefix` in `mode`.
    #[instrument(skip_all, fields(prefix = %prefix, mode = ?mode))]
    pub fn open(dir: impl Into<PathBuf>, prefix: impl Into<String>, mode: OpenMode) -> Result<Self> {
        let dir = dir.into();
        let prefix = prefix.into();

        match mode {
            OpenMode::Read => Self::open_read(dir, prefix),
            OpenMode::Write => Self::open_write(dir, prefix),
            OpenMode::Append => Self::open_append(dir, prefix),
        }
    }

    fn open_read(dir: PathBuf, prefix: String) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::DirectoryMissing(dir));
        }
        let meta_path = metadata_path(&dir, &prefix);
        if !meta_path.exists() {
            let legacy_path = legacy_path(&dir, &prefix);
            if legacy_path.exists() {
                return legacy::upgrade(&dir, &prefix);
            }
            return Err(Error::MetadataNotFound(prefix, dir));
        }

        let text = fs::read_to_string(&meta_path)?;
        let doc: serde_json::Value = serde_json::from_str(&text)?;
        let (global_meta, field_map, savepoints) = parse_document(&doc, &prefix)?;
        let archive = BinaryArchive::open(&dir, &prefix)?;

        info!(savepoints = savepoints.len(), fields = field_map.len(), "opened in Read mode");
        Ok(Self {
            dir,
            prefix,
            mode: OpenMode::Read,
            global_meta,
            field_map,
            savepoints,
            archive,
        })
    }

    fn open_write(dir: PathBuf, prefix: String) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        if !metadata_path(&dir, &prefix).exists() && legacy_path(&dir, &prefix).exists() {
            return Err(Error::UpgradeReadOnly);
        }
        let mut archive = BinaryArchive::open(&dir, &prefix)?;
        archive.clear()?;
        let meta_path = metadata_path(&dir, &prefix);
        if meta_path.exists() {
            fs::remove_file(&meta_path)?;
        }
        info!("opened in Write mode, cleared prior archive state");
        let s = Self {
            dir,
            prefix,
            mode: OpenMode::Write,
            global_meta: MetaInfoMap::new(),
            field_map: FieldMap::new(),
            savepoints: SavepointVector::new(),
            archive,
        };
        s.persist_metadata()?;
        Ok(s)
    }

    fn open_append(dir: PathBuf, prefix: String) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::DirectoryMissing(dir));
        }
        let meta_path = metadata_path(&dir, &prefix);
        if !meta_path.exists() && legacy_path(&dir, &prefix).exists() {
            return Err(Error::UpgradeReadOnly);
        }
        let (global_meta, field_map, savepoints) = if meta_path.exists() {
            let text = fs::read_to_string(&meta_path)?;
            let doc: serde_json::Value = serde_json::from_str(&text)?;
            parse_document(&doc, &prefix)?
        } else {
            (MetaInfoMap::new(), FieldMap::new(), SavepointVector::new())
        };
        let archive = BinaryArchive::open(&dir, &prefix)?;
        info!("opened in Append mode");
        Ok(Self {
            dir,
            prefix,
            mode: OpenMode::Append,
            global_meta,
            field_map,
            savepoints,
            archive,
        })
    }

    /// Construct a serializer directly from its parts, bypassing `open`'s
    /// disk discovery. Used by the legacy upgrade path once it has
    /// reconstructed every component in memory.
    pub(crate) fn from_parts(
        dir: PathBuf,
        prefix: String,
        mode: OpenMode,
        global_meta: MetaInfoMap,
        field_map: FieldMap,
        savepoints: SavepointVector,
        archive: BinaryArchive,
    ) -> Self {
        Self {
            dir,
            prefix,
            mode,
            global_meta,
            field_map,
            savepoints,
            archive,
        }
    }

    /// Best-effort persist both metadata documents, logging and swallowing
    /// any failure rather than propagating it. Used only by the legacy
    /// upgrade path (§10.5): a failed persist here must not fail `open()`.
    pub(crate) fn persist_all_best_effort(&self) {
        if let Err(e) = self.persist_metadata() {
            warn!(error = %e, "legacy upgrade: failed to persist upgraded metadata document");
        }
        if let Err(e) = self.archive.persist_to_disk() {
            warn!(error = %e, "legacy upgrade: failed to persist upgraded archive metadata");
        }
    }

    /// The mode this serializer was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// The serializer's global metainfo map.
    pub fn global_meta(&self) -> &MetaInfoMap {
        &self.global_meta
    }

    /// Mutable access to the global metainfo map. Mutations are not
    /// persisted until the next write; callers in Write/Append mode should
    /// follow a mutation with an explicit [`Serializer::persist_metadata`] call
    /// if no field write will follow immediately.
    ///
    /// Fails with [`Error::SerializerNotWritable`] in Read mode, per §4.5's
    /// "frozen, no mutating operations permitted" rule.
    pub fn global_meta_mut(&mut self) -> Result<&mut MetaInfoMap> {
        if self.mode == OpenMode::Read {
            return Err(Error::SerializerNotWritable);
        }
        Ok(&mut self.global_meta)
    }

    /// Registered fields.
    pub fn field_map(&self) -> &FieldMap {
        &self.field_map
    }

    /// Recorded savepoints.
    pub fn savepoints(&self) -> &SavepointVector {
        &self.savepoints
    }

    /// Register `name` with descriptor `fm`. Idempotent under FMAP's rule (§4.2).
    ///
    /// Fails with [`Error::SerializerNotWritable`] in Read mode, per §4.5's
    /// "frozen, no mutating operations permitted" rule.
    pub fn register_field(&mut self, name: impl Into<String>, fm: FieldMetaInfo) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Err(Error::SerializerNotWritable);
        }
        self.field_map.insert(name, fm)
    }

    fn check_storage_view(&self, name: &str, view: &dyn StorageView) -> Result<()> {
        let fm = self.field_map.get(name)?;
        if fm.element_type() != view.element_type() {
            return Err(Error::TypeMismatch {
                name: name.to_owned(),
                expected: fm.element_type(),
                actual: view.element_type(),
            });
        }
        if fm.dims() != view.dims() {
            return Err(Error::ShapeMismatch {
                name: name.to_owned(),
                expected: fm.dims().to_vec(),
                actual: view.dims().to_vec(),
            });
        }
        Ok(())
    }

    /// Write `view` under `name` at `sp`, per §4.5.
    #[instrument(skip(self, view), fields(field = %name, savepoint = %sp.name()))]
    pub fn write(&mut self, name: &str, sp: Savepoint, view: &dyn StorageView) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Err(Error::SerializerNotWritable);
        }
        self.check_storage_view(name, view)?;

        let idx = self.savepoints.insert(sp);
        if self.savepoints.has_field(idx, name) {
            return Err(Error::FieldAlreadyAtSavepoint { field: name.to_owned() });
        }

        let fid = self.archive.write(name, view)?;
        self.savepoints.add_field(idx, name, fid)?;
        self.persist_metadata()?;
        Ok(())
    }

    /// Read `name` at `sp` into `view`, per §4.5.
    #[instrument(skip(self, view), fields(field = %name, savepoint = %sp.name()))]
    pub fn read(&self, name: &str, sp: &Savepoint, view: &mut dyn StorageView) -> Result<()> {
        if self.mode != OpenMode::Read {
            return Err(Error::SerializerNotReadable(self.mode));
        }
        self.check_storage_view(name, view)?;
        let idx = self.savepoints.find(sp).ok_or(Error::SavepointNotFound)?;
        let fid = self.savepoints.get_field_id(idx, name)?;
        self.archive.read(name, fid, view)
    }

    /// Atomically rewrite `MetaData-<prefix>.json` via a sibling temp file
    /// plus rename, per §5.
    pub fn persist_metadata(&self) -> Result<()> {
        let doc = json!({
            "serialbox_version": CURRENT_VERSION,
            "prefix": self.prefix,
            "global_meta_info": self.global_meta.to_json(),
            "savepoint_vector": self.savepoints.to_json(),
            "field_map": self.field_map.to_json().get("field_map").cloned().unwrap_or(json!({})),
        });
        let text = serde_json::to_string_pretty(&doc)?;
        let final_path = metadata_path(&self.dir, &self.prefix);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.flush()?;
        tmp.persist(final_path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

fn parse_document(doc: &serde_json::Value, expected_prefix: &str) -> Result<(MetaInfoMap, FieldMap, SavepointVector)> {
    let on_disk_version = doc
        .get("serialbox_version")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::MetadataCorrupt("missing 'serialbox_version'".into()))? as i32;
    if version_major(on_disk_version) != REQUIRED_MAJOR {
        return Err(Error::VersionMismatch {
            on_disk: on_disk_version,
            required_major: REQUIRED_MAJOR,
        });
    }

    let found_prefix = doc
        .get("prefix")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::MetadataCorrupt("missing 'prefix'".into()))?;
    if found_prefix != expected_prefix {
        return Err(Error::PrefixMismatch {
            expected: expected_prefix.to_owned(),
            found: found_prefix.to_owned(),
        });
    }

    let global_meta = match doc.get("global_meta_info") {
        Some(m) => MetaInfoMap::from_json(m)?,
        None => MetaInfoMap::new(),
    };
    let field_map = FieldMap::from_json(doc)?;
    let savepoints = match doc.get("savepoint_vector") {
        Some(v) => SavepointVector::from_json(v)?,
        None => SavepointVector::new(),
    };
    Ok((global_meta, field_map, savepoints))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{ElementType, Scalar};
    use crate::view::OwnedView;
    use anyhow::Result as AnyResult;
    use tempfile::tempdir;

    fn field_view(values: Vec<f64>) -> OwnedView {
        let len = values.len() as u64;
        OwnedView::new(ElementType::Float64, vec![len], values.into_iter().map(Scalar::Float64).collect())
    }

    #[test]
    fn write_then_reopen_and_read_round_trips() -> AnyResult<()> {
        let dir = tempdir()?;
        {
            let mut s = Serializer::open(dir.path(), "p", OpenMode::Write)?;
            s.register_field("f", FieldMetaInfo::new(ElementType::Float64, vec![2, 3], MetaInfoMap::new()))?;
            let view = field_view(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
            s.write("f", Savepoint::new("s", MetaInfoMap::new()), &view)?;
        }

        let s = Serializer::open(dir.path(), "p", OpenMode::Read)?;
        let mut out = OwnedView::zeroed(ElementType::Float64, vec![2, 3]);
        s.read("f", &Savepoint::new("s", MetaInfoMap::new()), &mut out)?;
        assert_eq!(
            out.data(),
            field_view(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).data()
        );
        Ok(())
    }

    #[test]
    fn dedup_across_savepoints_shares_field_id() -> AnyResult<()> {
        let dir = tempdir()?;
        let mut s = Serializer::open(dir.path(), "p", OpenMode::Write)?;
        s.register_field("f", FieldMetaInfo::new(ElementType::Float64, vec![2], MetaInfoMap::new()))?;
        s.write("f", Savepoint::new("s1", MetaInfoMap::new()), &field_view(vec![1.0, 2.0]))?;
        s.write("f", Savepoint::new("s2", MetaInfoMap::new()), &field_view(vec![1.0, 2.0]))?;

        let idx1 = s.savepoints().find(&Savepoint::new("s1", MetaInfoMap::new())).unwrap();
        let idx2 = s.savepoints().find(&Savepoint::new("s2", MetaInfoMap::new())).unwrap();
        assert_eq!(
            s.savepoints().get_field_id(idx1, "f")?.id,
            s.savepoints().get_field_id(idx2, "f")?.id
        );
        Ok(())
    }

    #[test]
    fn duplicate_write_at_same_savepoint_fails() -> AnyResult<()> {
        let dir = tempdir()?;
        let mut s = Serializer::open(dir.path(), "p", OpenMode::Write)?;
        s.register_field("f", FieldMetaInfo::new(ElementType::Float64, vec![1], MetaInfoMap::new()))?;
        s.write("f", Savepoint::new("s1", MetaInfoMap::new()), &field_view(vec![1.0]))?;
        let err = s
            .write("f", Savepoint::new("s1", MetaInfoMap::new()), &field_view(vec![2.0]))
            .unwrap_err();
        assert!(matches!(err, Error::FieldAlreadyAtSavepoint { .. }));
        Ok(())
    }

    #[test]
    fn read_mode_rejects_writes() -> AnyResult<()> {
        let dir = tempdir()?;
        {
            Serializer::open(dir.path(), "p", OpenMode::Write)?;
        }
        let mut s = Serializer::open(dir.path(), "p", OpenMode::Read)?;
        let err = s
            .write("f", Savepoint::new("s", MetaInfoMap::new()), &field_view(vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, Error::SerializerNotWritable));
        Ok(())
    }

    #[test]
    fn version_gate_rejects_incompatible_major() -> AnyResult<()> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path())?;
        let doc = json!({
            "serialbox_version": 100,
            "prefix": "p",
            "global_meta_info": {},
            "savepoint_vector": [],
            "field_map": {},
        });
        fs::write(metadata_path(dir.path(), "p"), serde_json::to_string(&doc)?)?;
        let err = Serializer::open(dir.path(), "p", OpenMode::Read).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
        assert!(!metadata_path(dir.path(), "p").exists() || fs::read_to_string(metadata_path(dir.path(), "p"))?.contains("100"));
        Ok(())
    }
}
