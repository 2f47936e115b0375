//! The metainfo map `M`: an ordered, insertion-order-preserving mapping from
//! string keys to a tagged scalar or homogeneous scalar array.
//!
//! Construction fixes the tag of a value; there is no in-place retagging —
//! callers must [`MetaInfoMap::erase`] and reinsert to change a key's type.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// The tag fixing a metainfo value's (or field's) scalar element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// `0x00` for false, any non-zero byte for true.
    Boolean,
    /// 4-byte little-endian signed integer.
    Int32,
    /// 8-byte little-endian signed integer.
    Int64,
    /// 4-byte little-endian IEEE-754 float.
    Float32,
    /// 8-byte little-endian IEEE-754 float.
    Float64,
    /// UTF-8 bytes, variable length.
    String,
}

impl ElementType {
    /// Fixed on-disk byte width of one scalar of this type, or `None` for
    /// the variable-length `String` tag.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ElementType::Boolean => Some(1),
            ElementType::Int32 => Some(4),
            ElementType::Int64 => Some(8),
            ElementType::Float32 => Some(4),
            ElementType::Float64 => Some(8),
            ElementType::String => None,
        }
    }

    /// The wire name used in `M.toJSON()`'s `"<type-tag>"` slot.
    fn wire_name(self) -> &'static str {
        match self {
            ElementType::Boolean => "boolean",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::String => "string",
        }
    }

    fn from_wire_name(s: &str) -> Option<Self> {
        Some(match s {
            "boolean" => ElementType::Boolean,
            "int32" => ElementType::Int32,
            "int64" => ElementType::Int64,
            "float32" => ElementType::Float32,
            "float64" => ElementType::Float64,
            "string" => ElementType::String,
            _ => return None,
        })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A single scalar, tagged by [`ElementType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// A boolean scalar.
    Boolean(bool),
    /// A 32-bit signed integer scalar.
    Int32(i32),
    /// A 64-bit signed integer scalar.
    Int64(i64),
    /// A 32-bit float scalar. Compared bit-for-bit, never by `==` on `f32`.
    Float32(f32),
    /// A 64-bit float scalar. Compared bit-for-bit, never by `==` on `f64`.
    Float64(f64),
    /// A string scalar.
    String(String),
}

impl Scalar {
    /// The tag of this scalar.
    pub fn tag(&self) -> ElementType {
        match self {
            Scalar::Boolean(_) => ElementType::Boolean,
            Scalar::Int32(_) => ElementType::Int32,
            Scalar::Int64(_) => ElementType::Int64,
            Scalar::Float32(_) => ElementType::Float32,
            Scalar::Float64(_) => ElementType::Float64,
            Scalar::String(_) => ElementType::String,
        }
    }

    /// Numeric widening: read this scalar as `target`, succeeding only when
    /// the value is exactly representable. Narrowing is never silent.
    fn widen(&self, target: ElementType) -> Option<Scalar> {
        if self.tag() == target {
            return Some(self.clone());
        }
        match (self, target) {
            (Scalar::Int32(v), ElementType::Int64) => Some(Scalar::Int64(*v as i64)),
            (Scalar::Int32(v), ElementType::Float32) => {
                let widened = *v as f32;
                (widened as i32 == *v).then_some(Scalar::Float32(widened))
            }
            (Scalar::Int32(v), ElementType::Float64) => Some(Scalar::Float64(*v as f64)),
            _ => None,
        }
    }
}

impl Scalar {
    fn scalar_eq(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::Boolean(a), Scalar::Boolean(b)) => a == b,
            (Scalar::Int32(a), Scalar::Int32(b)) => a == b,
            (Scalar::Int64(a), Scalar::Int64(b)) => a == b,
            (Scalar::Float32(a), Scalar::Float32(b)) => a.to_bits() == b.to_bits(),
            (Scalar::Float64(a), Scalar::Float64(b)) => a.to_bits() == b.to_bits(),
            (Scalar::String(a), Scalar::String(b)) => a == b,
            _ => false,
        }
    }
}

/// A metainfo value: either one scalar, or a homogeneous sequence of
/// scalars all sharing the same tag.
#[derive(Debug, Clone)]
pub enum MetaValue {
    /// A single scalar.
    Scalar(Scalar),
    /// A homogeneous array of scalars, all of the same tag.
    Array(ElementType, Vec<Scalar>),
}

impl MetaValue {
    /// The tag fixed at construction.
    pub fn tag(&self) -> ElementType {
        match self {
            MetaValue::Scalar(s) => s.tag(),
            MetaValue::Array(t, _) => *t,
        }
    }

    /// Attempt to read this value as a single scalar of `target`, widening
    /// numerically where exactly representable.
    pub fn as_scalar(&self, target: ElementType) -> Option<Scalar> {
        match self {
            MetaValue::Scalar(s) => s.widen(target),
            MetaValue::Array(_, _) => None,
        }
    }

    /// Logical equality: same tag, same values — order-sensitive within an
    /// array (arrays are ordered sequences, unlike map keys).
    fn value_eq(&self, other: &MetaValue) -> bool {
        match (self, other) {
            (MetaValue::Scalar(a), MetaValue::Scalar(b)) => a.scalar_eq(b),
            (MetaValue::Array(ta, a), MetaValue::Array(tb, b)) => {
                ta == tb && a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.scalar_eq(y))
            }
            _ => false,
        }
    }
}

fn scalar_to_json(s: &Scalar) -> serde_json::Value {
    match s {
        Scalar::Boolean(v) => serde_json::Value::from(*v),
        Scalar::Int32(v) => serde_json::Value::from(*v),
        Scalar::Int64(v) => serde_json::Value::from(*v),
        Scalar::Float32(v) => serde_json::Value::from(*v as f64),
        Scalar::Float64(v) => serde_json::Value::from(*v),
        Scalar::String(v) => serde_json::Value::from(v.clone()),
    }
}

fn json_to_scalar(tag: ElementType, v: &serde_json::Value) -> Result<Scalar> {
    Ok(match tag {
        ElementType::Boolean => Scalar::Boolean(
            v.as_bool()
                .ok_or_else(|| Error::MetadataCorrupt("expected boolean".into()))?,
        ),
        ElementType::Int32 => Scalar::Int32(
            v.as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| Error::MetadataCorrupt("expected int32".into()))?,
        ),
        ElementType::Int64 => Scalar::Int64(
            v.as_i64()
                .ok_or_else(|| Error::MetadataCorrupt("expected int64".into()))?,
        ),
        ElementType::Float32 => Scalar::Float32(
            v.as_f64()
                .ok_or_else(|| Error::MetadataCorrupt("expected float32".into()))? as f32,
        ),
        ElementType::Float64 => Scalar::Float64(
            v.as_f64()
                .ok_or_else(|| Error::MetadataCorrupt("expected float64".into()))?,
        ),
        ElementType::String => Scalar::String(
            v.as_str()
                .ok_or_else(|| Error::MetadataCorrupt("expected string".into()))?
                .to_owned(),
        ),
    })
}

impl MetaValue {
    /// Encode as `["<type-tag>", <value-or-array>]`, per `M.toJSON()`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetaValue::Scalar(s) => {
                serde_json::Value::Array(vec![s.tag().wire_name().into(), scalar_to_json(s)])
            }
            MetaValue::Array(tag, items) => serde_json::Value::Array(vec![
                tag.wire_name().into(),
                serde_json::Value::Array(items.iter().map(scalar_to_json).collect()),
            ]),
        }
    }

    /// Decode the `["<type-tag>", <value-or-array>]` form produced by
    /// [`MetaValue::to_json`].
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let pair = value
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| Error::MetadataCorrupt("metainfo value must be a 2-element array".into()))?;
        let tag_name = pair[0]
            .as_str()
            .ok_or_else(|| Error::MetadataCorrupt("metainfo tag must be a string".into()))?;
        let tag = ElementType::from_wire_name(tag_name)
            .ok_or_else(|| Error::MetadataCorrupt(format!("unknown metainfo tag '{tag_name}'")))?;
        match &pair[1] {
            serde_json::Value::Array(items) => {
                let scalars = items
                    .iter()
                    .map(|v| json_to_scalar(tag, v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(MetaValue::Array(tag, scalars))
            }
            other => Ok(MetaValue::Scalar(json_to_scalar(tag, other)?)),
        }
    }
}

/// An ordered mapping from string key to tagged [`MetaValue`]. Iteration and
/// serialized key order follow insertion order.
#[derive(Debug, Clone, Default)]
pub struct MetaInfoMap {
    entries: Vec<(String, MetaValue)>,
}

impl MetaInfoMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Insert `key` → `value`. Returns `true` if inserted, `false` (without
    /// error) if `key` is already present.
    pub fn insert(&mut self, key: impl Into<String>, value: MetaValue) -> bool {
        let key = key.into();
        if self.position(&key).is_some() {
            return false;
        }
        self.entries.push((key, value));
        true
    }

    /// Replace the value stored at an existing `key`, keeping its tag.
    ///
    /// Fails with [`Error::KeyNotFound`] if absent, or
    /// [`Error::MetainfoTypeMismatch`] if `value`'s tag differs from the
    /// stored tag.
    pub fn overwrite(&mut self, key: &str, value: MetaValue) -> Result<()> {
        let idx = self
            .position(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_owned()))?;
        let stored_tag = self.entries[idx].1.tag();
        if stored_tag != value.tag() {
            return Err(Error::MetainfoTypeMismatch {
                key: key.to_owned(),
                stored: stored_tag,
                requested: value.tag(),
            });
        }
        self.entries[idx].1 = value;
        Ok(())
    }

    /// Remove `key` if present. Idempotent.
    pub fn erase(&mut self, key: &str) {
        if let Some(idx) = self.position(key) {
            self.entries.remove(idx);
        }
    }

    /// Look up `key`, failing with [`Error::KeyNotFound`] if absent.
    pub fn at(&self, key: &str) -> Result<&MetaValue> {
        self.position(key)
            .map(|idx| &self.entries[idx].1)
            .ok_or_else(|| Error::KeyNotFound(key.to_owned()))
    }

    /// Look up `key` and read it as a scalar of `target`, widening
    /// numerically where exactly representable. Fails with
    /// [`Error::KeyNotFound`] or [`Error::MetainfoTypeMismatch`].
    pub fn as_scalar(&self, key: &str, target: ElementType) -> Result<Scalar> {
        let value = self.at(key)?;
        value.as_scalar(target).ok_or_else(|| Error::MetainfoTypeMismatch {
            key: key.to_owned(),
            stored: value.tag(),
            requested: target,
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Serialize to the `M.toJSON()` object form: insertion-ordered keys,
    /// each mapped to `["<type-tag>", value]`.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Parse the `M.toJSON()` object form, preserving the on-disk key order.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MetadataCorrupt("metainfo map must be a JSON object".into()))?;
        let mut map = MetaInfoMap::new();
        for (key, v) in obj {
            map.insert(key.clone(), MetaValue::from_json(v)?);
        }
        Ok(map)
    }

    /// Structural, order-insensitive equality: same keys mapped to equal
    /// values, regardless of insertion order. Used to compare `M` for
    /// [`crate::savepoint::Savepoint`] and [`crate::field::FieldMetaInfo`]
    /// equality.
    pub fn logically_eq(&self, other: &MetaInfoMap) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(k, v)| {
            other
                .position(k)
                .map(|idx| v.value_eq(&other.entries[idx].1))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_scalar() -> impl Strategy<Value = Scalar> {
        prop_oneof![
            any::<bool>().prop_map(Scalar::Boolean),
            any::<i32>().prop_map(Scalar::Int32),
            any::<i64>().prop_map(Scalar::Int64),
            any::<f32>().prop_map(Scalar::Float32),
            any::<f64>().prop_map(Scalar::Float64),
            "[a-zA-Z0-9_]{0,16}".prop_map(Scalar::String),
        ]
    }

    fn arb_value() -> impl Strategy<Value = MetaValue> {
        prop_oneof![
            arb_scalar().prop_map(MetaValue::Scalar),
            arb_scalar().prop_flat_map(|s| {
                let tag = s.tag();
                prop::collection::vec(arb_scalar_of(tag), 0..4).prop_map(move |v| MetaValue::Array(tag, v))
            }),
        ]
    }

    fn arb_scalar_of(tag: ElementType) -> BoxedStrategy<Scalar> {
        match tag {
            ElementType::Boolean => any::<bool>().prop_map(Scalar::Boolean).boxed(),
            ElementType::Int32 => any::<i32>().prop_map(Scalar::Int32).boxed(),
            ElementType::Int64 => any::<i64>().prop_map(Scalar::Int64).boxed(),
            ElementType::Float32 => any::<f32>().prop_map(Scalar::Float32).boxed(),
            ElementType::Float64 => any::<f64>().prop_map(Scalar::Float64).boxed(),
            ElementType::String => "[a-zA-Z0-9_]{0,16}".prop_map(Scalar::String).boxed(),
        }
    }

    fn arb_map() -> impl Strategy<Value = MetaInfoMap> {
        prop::collection::vec(("[a-zA-Z][a-zA-Z0-9_]{0,8}", arb_value()), 0..6).prop_map(|pairs| {
            let mut map = MetaInfoMap::new();
            for (k, v) in pairs {
                map.insert(k, v);
            }
            map
        })
    }

    proptest! {
        #[test]
        fn round_trip_preserves_tags(map in arb_map()) {
            let json = map.to_json();
            let restored = MetaInfoMap::from_json(&json).unwrap();
            prop_assert!(map.logically_eq(&restored));
            for (k, v) in map.iter() {
                prop_assert_eq!(v.tag(), restored.at(k).unwrap().tag());
            }
        }
    }

    #[test]
    fn insert_rejects_duplicate_without_erroring() {
        let mut map = MetaInfoMap::new();
        assert!(map.insert("k", MetaValue::Scalar(Scalar::Int32(1))));
        assert!(!map.insert("k", MetaValue::Scalar(Scalar::Int32(2))));
        assert_eq!(map.at("k").unwrap().as_scalar(ElementType::Int32), Some(Scalar::Int32(1)));
    }

    #[test]
    fn widening_is_exact_only() {
        let mut map = MetaInfoMap::new();
        map.insert("i", MetaValue::Scalar(Scalar::Int32(42)));
        assert_eq!(
            map.as_scalar("i", ElementType::Int64).unwrap(),
            Scalar::Int64(42)
        );
        assert_eq!(
            map.as_scalar("i", ElementType::Float64).unwrap(),
            Scalar::Float64(42.0)
        );
        // Narrowing must never happen silently: Int64 cannot be read as Int32.
        map.insert("j", MetaValue::Scalar(Scalar::Int64(7)));
        assert!(map.as_scalar("j", ElementType::Int32).is_err());
    }

    #[test]
    fn key_order_is_insertion_order_on_disk() {
        let mut map = MetaInfoMap::new();
        map.insert("z", MetaValue::Scalar(Scalar::Int32(1)));
        map.insert("a", MetaValue::Scalar(Scalar::Int32(2)));
        let json = map.to_json();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn equality_ignores_key_order() {
        let mut a = MetaInfoMap::new();
        a.insert("x", MetaValue::Scalar(Scalar::Int32(1)));
        a.insert("y", MetaValue::Scalar(Scalar::Int32(2)));

        let mut b = MetaInfoMap::new();
        b.insert("y", MetaValue::Scalar(Scalar::Int32(2)));
        b.insert("x", MetaValue::Scalar(Scalar::Int32(1)));

        assert!(a.logically_eq(&b));
    }

    #[test]
    fn erase_is_idempotent() {
        let mut map = MetaInfoMap::new();
        map.insert("k", MetaValue::Scalar(Scalar::Boolean(true)));
        map.erase("k");
        map.erase("k");
        assert!(map.is_empty());
    }
}
