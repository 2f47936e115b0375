//! Legacy format upgrade (§4.6): migrates a pre-existing `<prefix>.json`
//! document (top-level keys `FieldsTable`, `GlobalMetainfo`, `OffsetTable`)
//! into this crate's current model, losslessly.
//!
//! The raw `P_<fieldname>.dat` payload files are assumed unchanged by the
//! legacy format and are left untouched; only the JSON metadata side cars
//! are migrated.

use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::warn;

use crate::archive::binary::{BinaryArchive, FieldOffsetTable, OffsetEntry};
use crate::error::{Error, Result};
use crate::field::{FieldMap, FieldMetaInfo};
use crate::metainfo::{ElementType, MetaInfoMap, MetaValue, Scalar};
use crate::savepoint::{FieldId, Savepoint, SavepointVector};
use crate::serializer::{legacy_path, OpenMode, Serializer};

const DIM_KEYS: [&str; 4] = ["__isize", "__jsize", "__ksize", "__lsize"];

/// Run the legacy migration over `dir/<prefix>.json` and return a
/// Read-mode [`Serializer`] over the reconstructed, in-memory model.
pub(crate) fn upgrade(dir: &Path, prefix: &str) -> Result<Serializer> {
    let path = legacy_path(dir, prefix);
    let text = fs::read_to_string(&path)?;
    let doc: Value = serde_json::from_str(&text)?;

    let fields_table = doc
        .get("FieldsTable")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::MetadataCorrupt("legacy document missing 'FieldsTable'".into()))?;
    let global_meta_raw = doc
        .get("GlobalMetainfo")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::MetadataCorrupt("legacy document missing 'GlobalMetainfo'".into()))?;
    let offset_table_raw = doc
        .get("OffsetTable")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::MetadataCorrupt("legacy document missing 'OffsetTable'".into()))?;

    let float_tag = infer_float_tag(fields_table);
    let global_meta = infer_meta_map(global_meta_raw, float_tag)?;
    let field_map = build_field_map(fields_table, float_tag)?;
    let (savepoints, tables) = build_savepoints_and_tables(offset_table_raw, float_tag)?;

    let archive = BinaryArchive::from_tables(dir.to_path_buf(), prefix.to_owned(), tables);
    let serializer = Serializer::from_parts(
        dir.to_path_buf(),
        prefix.to_owned(),
        OpenMode::Read,
        global_meta,
        field_map,
        savepoints,
        archive,
    );

    // Best-effort: a failed persist of the upgraded documents must not fail
    // this open — the next process to open this directory just redoes the
    // upgrade.
    serializer.persist_all_best_effort();

    Ok(serializer)
}

fn infer_float_tag(fields_table: &[Value]) -> ElementType {
    let any_float = fields_table.iter().any(|entry| {
        entry
            .get("__elementtype")
            .and_then(Value::as_str)
            .map(|s| s == "float")
            .unwrap_or(false)
    });
    if any_float {
        ElementType::Float32
    } else {
        ElementType::Float64
    }
}

fn infer_value(key: &str, value: &Value, float_tag: ElementType) -> Result<MetaValue> {
    Ok(match value {
        Value::Bool(b) => MetaValue::Scalar(Scalar::Boolean(*b)),
        Value::String(s) => MetaValue::Scalar(Scalar::String(s.clone())),
        Value::Number(n) => {
            if n.is_f64() && n.as_f64().map(|f| f.fract() != 0.0).unwrap_or(false) {
                match float_tag {
                    ElementType::Float32 => MetaValue::Scalar(Scalar::Float32(n.as_f64().unwrap() as f32)),
                    _ => MetaValue::Scalar(Scalar::Float64(n.as_f64().unwrap())),
                }
            } else if let Some(i) = n.as_i64() {
                match i32::try_from(i) {
                    Ok(v) => MetaValue::Scalar(Scalar::Int32(v)),
                    Err(_) => match float_tag {
                        ElementType::Float32 => MetaValue::Scalar(Scalar::Float32(i as f32)),
                        _ => MetaValue::Scalar(Scalar::Float64(i as f64)),
                    },
                }
            } else {
                match float_tag {
                    ElementType::Float32 => MetaValue::Scalar(Scalar::Float32(n.as_f64().unwrap_or_default() as f32)),
                    _ => MetaValue::Scalar(Scalar::Float64(n.as_f64().unwrap_or_default())),
                }
            }
        }
        _ => return Err(Error::UpgradeTypeInferenceFailure(key.to_owned())),
    })
}

fn infer_meta_map(obj: &Map<String, Value>, float_tag: ElementType) -> Result<MetaInfoMap> {
    let mut map = MetaInfoMap::new();
    for (key, value) in obj {
        if key.starts_with("__") {
            continue;
        }
        map.insert(key.clone(), infer_value(key, value, float_tag)?);
    }
    Ok(map)
}

fn legacy_element_type(name: &str) -> ElementType {
    match name {
        "int" => ElementType::Int32,
        "float" => ElementType::Float32,
        "double" => ElementType::Float64,
        _ => ElementType::Float64,
    }
}

fn collect_dims(obj: &Map<String, Value>) -> Vec<u64> {
    let mut dims = Vec::new();
    for key in DIM_KEYS {
        match obj.get(key).and_then(Value::as_u64) {
            Some(v) => dims.push(v),
            None => break,
        }
    }
    dims
}

fn build_field_map(fields_table: &[Value], float_tag: ElementType) -> Result<FieldMap> {
    let mut field_map = FieldMap::new();
    for entry in fields_table {
        let obj = entry
            .as_object()
            .ok_or_else(|| Error::MetadataCorrupt("legacy FieldsTable entry must be an object".into()))?;
        let name = obj
            .get("__name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MetadataCorrupt("legacy field entry missing '__name'".into()))?;
        let element_type = obj
            .get("__elementtype")
            .and_then(Value::as_str)
            .map(legacy_element_type)
            .unwrap_or(ElementType::Float64);
        let dims = collect_dims(obj);
        let meta = infer_meta_map(obj, float_tag)?;
        field_map.insert(name, FieldMetaInfo::new(element_type, dims, meta))?;
    }
    Ok(field_map)
}

fn table_for_mut<'a>(tables: &'a mut Vec<(String, FieldOffsetTable)>, name: &str) -> &'a mut FieldOffsetTable {
    if let Some(idx) = tables.iter().position(|(n, _)| n == name) {
        &mut tables[idx].1
    } else {
        tables.push((name.to_owned(), FieldOffsetTable::default()));
        &mut tables.last_mut().unwrap().1
    }
}

fn build_savepoints_and_tables(
    offset_table_raw: &[Value],
    float_tag: ElementType,
) -> Result<(SavepointVector, Vec<(String, FieldOffsetTable)>)> {
    let mut savepoints = SavepointVector::new();
    let mut tables: Vec<(String, FieldOffsetTable)> = Vec::new();

    for entry in offset_table_raw {
        let obj = entry
            .as_object()
            .ok_or_else(|| Error::MetadataCorrupt("legacy OffsetTable entry must be an object".into()))?;
        let name = obj
            .get("__name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MetadataCorrupt("legacy savepoint entry missing '__name'".into()))?;
        let sp_meta = infer_meta_map(obj, float_tag)?;
        let idx = savepoints.insert(Savepoint::new(name, sp_meta));

        let offsets = obj
            .get("__offsets")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::MetadataCorrupt("legacy savepoint entry missing '__offsets'".into()))?;
        for (field_name, pair) in offsets {
            let pair = pair
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| Error::MetadataCorrupt(format!("malformed legacy offset for '{field_name}'")))?;
            let offset = pair[0]
                .as_u64()
                .ok_or_else(|| Error::MetadataCorrupt(format!("malformed legacy offset for '{field_name}'")))?;
            let checksum = pair[1]
                .as_str()
                .ok_or_else(|| Error::MetadataCorrupt(format!("malformed legacy checksum for '{field_name}'")))?
                .to_owned();

            let table = table_for_mut(&mut tables, field_name);
            let id = if table.is_empty() {
                debug_assert_eq!(offset, 0, "first offset entry for a field must start at 0");
                table.push(OffsetEntry { offset, checksum });
                0
            } else if let Some(existing) = table.find_checksum(&checksum) {
                existing
            } else {
                debug_assert_ne!(offset, 0, "non-dedup offset entry must not restart at 0");
                table.push(OffsetEntry { offset, checksum });
                table.len() - 1
            };
            if let Err(e) = savepoints.add_field(idx, field_name.clone(), FieldId::new(id)) {
                warn!(field = %field_name, error = %e, "legacy upgrade: skipping duplicate field at savepoint");
            }
        }
    }

    Ok((savepoints, tables))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn upgrades_a_minimal_legacy_document() -> AnyResult<()> {
        let dir = tempdir()?;
        let legacy_doc = json!({
            "FieldsTable": [
                {
                    "__name": "u",
                    "__elementtype": "double",
                    "__isize": 2,
                    "__jsize": 2,
                    "__lsize": 1,
                }
            ],
            "GlobalMetainfo": {},
            "OffsetTable": [
                {
                    "__name": "sp0",
                    "__offsets": {
                        "u": [0, "deadbeef"]
                    }
                }
            ],
        });
        fs::write(dir.path().join("p.json"), serde_json::to_string(&legacy_doc)?)?;

        let serializer = upgrade(dir.path(), "p")?;
        assert_eq!(serializer.field_map().get("u")?.dims(), &[2, 2]);
        let idx = serializer
            .savepoints()
            .find(&Savepoint::new("sp0", MetaInfoMap::new()))
            .unwrap();
        assert_eq!(serializer.savepoints().get_field_id(idx, "u")?.id, 0);
        Ok(())
    }

    #[test]
    fn dims_stop_at_first_gap() -> AnyResult<()> {
        let mut obj = Map::new();
        obj.insert("__isize".into(), json!(3));
        obj.insert("__ksize".into(), json!(5));
        assert_eq!(collect_dims(&obj), vec![3]);
        Ok(())
    }

    #[test]
    fn dedup_reuses_checksum_across_savepoints() -> AnyResult<()> {
        let dir = tempdir()?;
        let legacy_doc = json!({
            "FieldsTable": [
                { "__name": "u", "__elementtype": "float", "__isize": 2 }
            ],
            "GlobalMetainfo": {},
            "OffsetTable": [
                { "__name": "sp0", "__offsets": { "u": [0, "aaa"] } },
                { "__name": "sp1", "__offsets": { "u": [0, "aaa"] } },
            ],
        });
        fs::write(dir.path().join("p.json"), serde_json::to_string(&legacy_doc)?)?;

        let serializer = upgrade(dir.path(), "p")?;
        let idx0 = serializer.savepoints().find(&Savepoint::new("sp0", MetaInfoMap::new())).unwrap();
        let idx1 = serializer.savepoints().find(&Savepoint::new("sp1", MetaInfoMap::new())).unwrap();
        assert_eq!(
            serializer.savepoints().get_field_id(idx0, "u")?.id,
            serializer.savepoints().get_field_id(idx1, "u")?.id
        );
        Ok(())
    }
}
