//! Field descriptors (`FM`) and the name-keyed field map (`FMAP`).

use serde_json::json;

use crate::error::{Error, Result};
use crate::metainfo::{ElementType, MetaInfoMap};

/// `(type, dims, meta)` describing a registered field: its element type,
/// its fixed dimensionality, and arbitrary attached metadata.
#[derive(Debug, Clone)]
pub struct FieldMetaInfo {
    element_type: ElementType,
    dims: Vec<u64>,
    meta: MetaInfoMap,
}

impl FieldMetaInfo {
    /// Construct a new descriptor. `dims` must be non-empty and contain
    /// only positive integers; dimensionality is fixed thereafter.
    pub fn new(element_type: ElementType, dims: Vec<u64>, meta: MetaInfoMap) -> Self {
        debug_assert!(dims.iter().all(|&d| d > 0), "dims must be positive");
        Self {
            element_type,
            dims,
            meta,
        }
    }

    /// The registered element type.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// The registered dimensions.
    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    /// The attached metainfo map.
    pub fn meta(&self) -> &MetaInfoMap {
        &self.meta
    }

    /// Number of scalar elements, the product of `dims`.
    pub fn element_count(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Structural equality across type, dims, and logical (order-insensitive) meta.
    pub fn structurally_eq(&self, other: &FieldMetaInfo) -> bool {
        self.element_type == other.element_type
            && self.dims == other.dims
            && self.meta.logically_eq(&other.meta)
    }

    /// Serialize as `FM.toJSON()`.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "type": self.element_type.to_string(),
            "dims": self.dims,
            "meta_info": self.meta.to_json(),
        })
    }

    /// Parse the `FM.toJSON()` form.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MetadataCorrupt("field metainfo must be a JSON object".into()))?;
        let type_name = obj
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::MetadataCorrupt("field metainfo missing 'type'".into()))?;
        let element_type = parse_element_type(type_name)?;
        let dims = obj
            .get("dims")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::MetadataCorrupt("field metainfo missing 'dims'".into()))?
            .iter()
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| Error::MetadataCorrupt("field metainfo dims must be non-negative integers".into()))
            })
            .collect::<Result<Vec<_>>>()?;
        let meta = match obj.get("meta_info") {
            Some(m) => MetaInfoMap::from_json(m)?,
            None => MetaInfoMap::new(),
        };
        Ok(FieldMetaInfo::new(element_type, dims, meta))
    }
}

fn parse_element_type(name: &str) -> Result<ElementType> {
    Ok(match name {
        "boolean" => ElementType::Boolean,
        "int32" => ElementType::Int32,
        "int64" => ElementType::Int64,
        "float32" => ElementType::Float32,
        "float64" => ElementType::Float64,
        "string" => ElementType::String,
        other => return Err(Error::MetadataCorrupt(format!("unknown element type '{other}'"))),
    })
}

/// Name-keyed map of registered fields, insertion-order preserving.
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    entries: Vec<(String, FieldMetaInfo)>,
}

impl FieldMap {
    /// An empty field map.
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    /// Register `name` → `fm`. Idempotent if `name` is already registered
    /// with a structurally identical descriptor; fails with
    /// [`Error::FieldAlreadyRegisteredDifferently`] if it conflicts.
    pub fn insert(&mut self, name: impl Into<String>, fm: FieldMetaInfo) -> Result<()> {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => {
                if self.entries[idx].1.structurally_eq(&fm) {
                    Ok(())
                } else {
                    Err(Error::FieldAlreadyRegisteredDifferently(name))
                }
            }
            None => {
                self.entries.push((name, fm));
                Ok(())
            }
        }
    }

    /// Look up a registered field's descriptor.
    pub fn find(&self, name: &str) -> Option<&FieldMetaInfo> {
        self.position(name).map(|idx| &self.entries[idx].1)
    }

    /// Look up a registered field, failing with [`Error::FieldNotRegistered`] if absent.
    pub fn get(&self, name: &str) -> Result<&FieldMetaInfo> {
        self.find(name)
            .ok_or_else(|| Error::FieldNotRegistered(name.to_owned()))
    }

    /// Iterate registered fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldMetaInfo)> {
        self.entries.iter().map(|(n, fm)| (n.as_str(), fm))
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no fields are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize under the top-level `"field_map"` key, per §4.2.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(n, fm)| (n.clone(), fm.to_json()))
            .collect();
        json!({ "field_map": serde_json::Value::Object(map) })
    }

    /// Parse a document carrying the top-level `"field_map"` key. Its
    /// absence is a schema error, per §4.2.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let field_map = value
            .get("field_map")
            .ok_or_else(|| Error::MetadataCorrupt("missing 'field_map' key".into()))?
            .as_object()
            .ok_or_else(|| Error::MetadataCorrupt("'field_map' must be a JSON object".into()))?;
        let mut map = FieldMap::new();
        for (name, fm) in field_map {
            let fm = FieldMetaInfo::from_json(fm)?;
            map.entries.push((name.clone(), fm));
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{MetaValue, Scalar};

    fn fm(dims: Vec<u64>) -> FieldMetaInfo {
        FieldMetaInfo::new(ElementType::Float64, dims, MetaInfoMap::new())
    }

    #[test]
    fn idempotent_reregistration_is_noop() {
        let mut map = FieldMap::new();
        map.insert("u", fm(vec![2, 3])).unwrap();
        map.insert("u", fm(vec![2, 3])).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn conflicting_reregistration_fails() {
        let mut map = FieldMap::new();
        map.insert("u", fm(vec![2, 3])).unwrap();
        let err = map.insert("u", fm(vec![2, 4])).unwrap_err();
        assert!(matches!(err, Error::FieldAlreadyRegisteredDifferently(name) if name == "u"));
    }

    #[test]
    fn reregistration_ignores_meta_key_order() {
        let mut a = MetaInfoMap::new();
        a.insert("x", MetaValue::Scalar(Scalar::Int32(1)));
        a.insert("y", MetaValue::Scalar(Scalar::Int32(2)));
        let mut b = MetaInfoMap::new();
        b.insert("y", MetaValue::Scalar(Scalar::Int32(2)));
        b.insert("x", MetaValue::Scalar(Scalar::Int32(1)));

        let mut map = FieldMap::new();
        map.insert("u", FieldMetaInfo::new(ElementType::Int32, vec![1], a))
            .unwrap();
        map.insert("u", FieldMetaInfo::new(ElementType::Int32, vec![1], b))
            .unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn round_trip_preserves_fields() {
        let mut map = FieldMap::new();
        map.insert("u", fm(vec![2, 2, 1])).unwrap();
        map.insert("v", FieldMetaInfo::new(ElementType::Int32, vec![4], MetaInfoMap::new()))
            .unwrap();
        let json = map.to_json();
        let restored = FieldMap::from_json(&json).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.get("u").unwrap().structurally_eq(map.get("u").unwrap()));
        assert!(restored.get("v").unwrap().structurally_eq(map.get("v").unwrap()));
    }

    #[test]
    fn missing_field_map_key_is_schema_error() {
        let err = FieldMap::from_json(&json!({})).unwrap_err();
        assert!(matches!(err, Error::MetadataCorrupt(_)));
    }
}
