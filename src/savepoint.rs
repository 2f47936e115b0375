//! Savepoints (`SP`) and the append-only savepoint vector (`SV`).

use serde_json::json;

use crate::error::{Error, Result};
use crate::metainfo::MetaInfoMap;

/// A named checkpoint plus attached metainfo. Two savepoints are equal iff
/// their names are equal and their metainfo maps are logically (order
/// insensitive) equal.
#[derive(Debug, Clone)]
pub struct Savepoint {
    name: String,
    meta: MetaInfoMap,
}

impl Savepoint {
    /// Construct a savepoint from a name and metainfo.
    pub fn new(name: impl Into<String>, meta: MetaInfoMap) -> Self {
        Self {
            name: name.into(),
            meta,
        }
    }

    /// The savepoint's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The savepoint's attached metainfo.
    pub fn meta(&self) -> &MetaInfoMap {
        &self.meta
    }

    /// Order-insensitive equality over `(name, meta)`.
    pub fn logically_eq(&self, other: &Savepoint) -> bool {
        self.name == other.name && self.meta.logically_eq(&other.meta)
    }

    /// Serialize as `SP.toJSON()`.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "meta_info": self.meta.to_json(),
        })
    }

    /// Parse the `SP.toJSON()` form.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MetadataCorrupt("savepoint must be a JSON object".into()))?;
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::MetadataCorrupt("savepoint missing 'name'".into()))?
            .to_owned();
        let meta = match obj.get("meta_info") {
            Some(m) => MetaInfoMap::from_json(m)?,
            None => MetaInfoMap::new(),
        };
        Ok(Savepoint::new(name, meta))
    }
}

/// A stable numeric identity for a field's stored payload: an index into
/// that field's offset table. Resolved against a field name (held
/// separately, e.g. as the key under which this id was recorded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldId {
    /// The offset-table index.
    pub id: usize,
}

impl FieldId {
    /// Construct a FieldId for a given offset-table index.
    pub fn new(id: usize) -> Self {
        Self { id }
    }
}

/// Per-savepoint, insertion-ordered mapping from field name to its
/// [`FieldId`] at that savepoint.
#[derive(Debug, Clone, Default)]
struct SavepointFields {
    entries: Vec<(String, FieldId)>,
}

impl SavepointFields {
    fn get(&self, name: &str) -> Option<FieldId> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    fn insert(&mut self, name: impl Into<String>, id: FieldId) -> Result<()> {
        let name = name.into();
        if self.has(&name) {
            return Err(Error::FieldAlreadyAtSavepoint { field: name });
        }
        self.entries.push((name, id));
        Ok(())
    }
}

/// An append-only, order-preserving list of unique savepoints, each with its
/// own field → [`FieldId`] map. Indices are stable identity for the
/// lifetime of the vector.
#[derive(Debug, Clone, Default)]
pub struct SavepointVector {
    savepoints: Vec<Savepoint>,
    fields: Vec<SavepointFields>,
}

impl SavepointVector {
    /// An empty savepoint vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Linear-scan for a savepoint logically equal to `sp`, returning its
    /// stable index.
    pub fn find(&self, sp: &Savepoint) -> Option<usize> {
        self.savepoints.iter().position(|s| s.logically_eq(sp))
    }

    /// Insert `sp` if not already present, returning its (possibly
    /// pre-existing) stable index. Does not touch the fields map of an
    /// already-present entry.
    pub fn insert(&mut self, sp: Savepoint) -> usize {
        if let Some(idx) = self.find(&sp) {
            return idx;
        }
        self.savepoints.push(sp);
        self.fields.push(SavepointFields::default());
        self.savepoints.len() - 1
    }

    /// The savepoint at `idx`, failing with [`Error::SavepointNotFound`] if out of range.
    pub fn get(&self, idx: usize) -> Result<&Savepoint> {
        self.savepoints.get(idx).ok_or(Error::SavepointNotFound)
    }

    /// Whether `name` has a recorded field at savepoint `idx`.
    pub fn has_field(&self, idx: usize, name: &str) -> bool {
        self.fields.get(idx).map(|f| f.has(name)).unwrap_or(false)
    }

    /// Record `name` → `id` at savepoint `idx`. Fails with
    /// [`Error::FieldAlreadyAtSavepoint`] if `name` is already recorded there.
    pub fn add_field(&mut self, idx: usize, name: impl Into<String>, id: FieldId) -> Result<()> {
        let fields = self
            .fields
            .get_mut(idx)
            .ok_or(Error::SavepointNotFound)?;
        fields.insert(name, id)
    }

    /// Look up the FieldId for `name` at savepoint `idx`, failing with
    /// [`Error::SavepointNotFound`] or [`Error::FieldNotAtSavepoint`].
    pub fn get_field_id(&self, idx: usize, name: &str) -> Result<FieldId> {
        let fields = self.fields.get(idx).ok_or(Error::SavepointNotFound)?;
        fields
            .get(name)
            .ok_or_else(|| Error::FieldNotAtSavepoint(name.to_owned()))
    }

    /// Number of savepoints.
    pub fn len(&self) -> usize {
        self.savepoints.len()
    }

    /// Whether the vector has no savepoints.
    pub fn is_empty(&self) -> bool {
        self.savepoints.is_empty()
    }

    /// Iterate savepoints in stable index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Savepoint)> {
        self.savepoints.iter().enumerate()
    }

    /// Serialize as `SV.toJSON()`: an ordered array whose position is the
    /// stable index.
    pub fn to_json(&self) -> serde_json::Value {
        let array: Vec<serde_json::Value> = self
            .savepoints
            .iter()
            .zip(&self.fields)
            .map(|(sp, fields)| {
                let fields_obj: serde_json::Map<String, serde_json::Value> = fields
                    .entries
                    .iter()
                    .map(|(name, id)| (name.clone(), json!([id.id])))
                    .collect();
                json!({
                    "savepoint": sp.to_json(),
                    "fields": serde_json::Value::Object(fields_obj),
                })
            })
            .collect();
        serde_json::Value::Array(array)
    }

    /// Parse the `SV.toJSON()` form, preserving array position as stable index.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let array = value
            .as_array()
            .ok_or_else(|| Error::MetadataCorrupt("savepoint_vector must be a JSON array".into()))?;
        let mut sv = SavepointVector::new();
        for entry in array {
            let obj = entry
                .as_object()
                .ok_or_else(|| Error::MetadataCorrupt("savepoint_vector entry must be an object".into()))?;
            let sp = Savepoint::from_json(
                obj.get("savepoint")
                    .ok_or_else(|| Error::MetadataCorrupt("savepoint_vector entry missing 'savepoint'".into()))?,
            )?;
            let fields_obj = obj
                .get("fields")
                .and_then(|v| v.as_object())
                .ok_or_else(|| Error::MetadataCorrupt("savepoint_vector entry missing 'fields'".into()))?;
            let mut fields = SavepointFields::default();
            for (name, ids) in fields_obj {
                let id = ids
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| Error::MetadataCorrupt(format!("malformed field id for '{name}'")))?;
                fields.entries.push((name.clone(), FieldId::new(id as usize)));
            }
            sv.savepoints.push(sp);
            sv.fields.push(fields);
        }
        Ok(sv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{MetaValue, Scalar};

    #[test]
    fn insert_is_deduplicated_by_logical_equality() {
        let mut sv = SavepointVector::new();
        let mut meta_a = MetaInfoMap::new();
        meta_a.insert("x", MetaValue::Scalar(Scalar::Int32(1)));
        meta_a.insert("y", MetaValue::Scalar(Scalar::Int32(2)));
        let mut meta_b = MetaInfoMap::new();
        meta_b.insert("y", MetaValue::Scalar(Scalar::Int32(2)));
        meta_b.insert("x", MetaValue::Scalar(Scalar::Int32(1)));

        let idx1 = sv.insert(Savepoint::new("s", meta_a));
        let idx2 = sv.insert(Savepoint::new("s", meta_b));
        assert_eq!(idx1, idx2);
        assert_eq!(sv.len(), 1);
    }

    #[test]
    fn duplicate_field_at_same_savepoint_fails() {
        let mut sv = SavepointVector::new();
        let idx = sv.insert(Savepoint::new("s1", MetaInfoMap::new()));
        sv.add_field(idx, "u", FieldId::new(0)).unwrap();
        let err = sv.add_field(idx, "u", FieldId::new(1)).unwrap_err();
        assert!(matches!(err, Error::FieldAlreadyAtSavepoint { field } if field == "u"));
    }

    #[test]
    fn indices_are_stable_across_inserts() {
        let mut sv = SavepointVector::new();
        let idx0 = sv.insert(Savepoint::new("s0", MetaInfoMap::new()));
        let idx1 = sv.insert(Savepoint::new("s1", MetaInfoMap::new()));
        assert_eq!(idx0, 0);
        assert_eq!(idx1, 1);
        assert_eq!(sv.insert(Savepoint::new("s0", MetaInfoMap::new())), 0);
    }

    #[test]
    fn round_trip_preserves_order_and_fields() {
        let mut sv = SavepointVector::new();
        let idx = sv.insert(Savepoint::new("s0", MetaInfoMap::new()));
        sv.add_field(idx, "u", FieldId::new(0)).unwrap();
        sv.add_field(idx, "v", FieldId::new(2)).unwrap();
        let json = sv.to_json();
        let restored = SavepointVector::from_json(&json).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get_field_id(0, "u").unwrap().id, 0);
        assert_eq!(restored.get_field_id(0, "v").unwrap().id, 2);
    }
}
