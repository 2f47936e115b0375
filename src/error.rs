//! Crate-wide error type.
//!
//! One variant per failure mode the engine's write/read/open contracts can
//! raise. Library code returns [`Result`]; `anyhow` is reserved for test
//! bodies.

use thiserror::Error;

/// Result alias used throughout the public API.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong opening, writing to, or reading from an
/// archive.
#[derive(Error, Debug)]
pub enum Error {
    /// A mutating operation was attempted on a serializer opened in `Read` mode.
    #[error("serializer is not writable (opened in Read mode)")]
    SerializerNotWritable,

    /// `read` was called on a serializer not opened in `Read` mode.
    #[error("serializer is not readable (opened in {0:?} mode)")]
    SerializerNotReadable(crate::serializer::OpenMode),

    /// `Read` mode was requested but the archive directory does not exist.
    #[error("archive directory does not exist: {0}")]
    DirectoryMissing(std::path::PathBuf),

    /// `Read` mode was requested but no metadata document could be found.
    #[error("no metadata document found for prefix '{0}' in {1}")]
    MetadataNotFound(String, std::path::PathBuf),

    /// A metadata document failed to parse or violated the documented schema.
    #[error("metadata document is corrupt: {0}")]
    MetadataCorrupt(String),

    /// The on-disk format version falls outside the library's compatibility window.
    #[error("version mismatch: on-disk version {on_disk} is incompatible with this library (requires major version {required_major})")]
    VersionMismatch {
        /// The `serialbox_version`-style integer read from disk.
        on_disk: i32,
        /// The major version this library requires.
        required_major: i32,
    },

    /// The on-disk `prefix` field did not match the prefix the serializer was opened with.
    #[error("prefix mismatch: expected '{expected}', found '{found}' on disk")]
    PrefixMismatch {
        /// The prefix requested at open time.
        expected: String,
        /// The prefix recorded in the metadata document.
        found: String,
    },

    /// A write or read referenced a field name never registered with the field map.
    #[error("field '{0}' is not registered")]
    FieldNotRegistered(String),

    /// A field was re-registered under the same name with a structurally different descriptor.
    #[error("field '{0}' is already registered with a different type, shape, or metadata")]
    FieldAlreadyRegisteredDifferently(String),

    /// The storage view's shape didn't match the field's registered dimensions.
    #[error("shape mismatch for field '{name}': registered dims {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Field name.
        name: String,
        /// Dimensions recorded in the field map.
        expected: Vec<u64>,
        /// Dimensions presented by the storage view.
        actual: Vec<u64>,
    },

    /// The storage view's element type didn't match the field's registered type.
    #[error("type mismatch for field '{name}': registered {expected:?}, got {actual:?}")]
    TypeMismatch {
        /// Field name.
        name: String,
        /// Element type recorded in the field map.
        expected: crate::metainfo::ElementType,
        /// Element type presented by the storage view.
        actual: crate::metainfo::ElementType,
    },

    /// A metainfo lookup referenced a key that isn't present.
    #[error("key '{0}' not found in metainfo map")]
    KeyNotFound(String),

    /// A metainfo lookup requested a tag that doesn't match (and isn't
    /// exactly representable as) the stored tag.
    #[error("metainfo key '{key}' has tag {stored:?}, cannot be read as {requested:?}")]
    MetainfoTypeMismatch {
        /// The key that was looked up.
        key: String,
        /// The tag actually stored.
        stored: crate::metainfo::ElementType,
        /// The tag requested by the caller.
        requested: crate::metainfo::ElementType,
    },

    /// `write` was called twice for the same (field, savepoint) pair.
    #[error("field '{field}' is already written at this savepoint")]
    FieldAlreadyAtSavepoint {
        /// The field name.
        field: String,
    },

    /// A read referenced a savepoint that isn't in the savepoint vector.
    #[error("savepoint not found")]
    SavepointNotFound,

    /// A read referenced a field that was never written at the given savepoint.
    #[error("field '{0}' was not written at the given savepoint")]
    FieldNotAtSavepoint(String),

    /// A `FieldId`'s index fell outside the archive's offset table.
    #[error("no archive entry at index {index} for field '{field}'")]
    ArchiveEntryNotFound {
        /// Field name.
        field: String,
        /// Requested offset-table index.
        index: usize,
    },

    /// The data file ended before the expected payload length was read.
    #[error("short read on field '{field}': expected {expected} bytes at offset {offset}, file has {available}")]
    ShortRead {
        /// Field name.
        field: String,
        /// Byte offset the read started at.
        offset: u64,
        /// Number of bytes the view expected.
        expected: u64,
        /// Number of bytes actually available.
        available: u64,
    },

    /// The bytes read back from disk don't hash to the recorded checksum.
    #[error("checksum mismatch on field '{field}' at offset {offset}")]
    ChecksumMismatch {
        /// Field name.
        field: String,
        /// Byte offset of the payload.
        offset: u64,
    },

    /// Legacy upgrade was attempted on a serializer not opened in `Read` mode.
    #[error("legacy upgrade is only permitted in Read mode")]
    UpgradeReadOnly,

    /// The legacy document contained a JSON shape the tag-inference rules don't cover.
    #[error("legacy upgrade: could not infer a metainfo tag for key '{0}'")]
    UpgradeTypeInferenceFailure(String),

    /// Underlying filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure not otherwise classified as `MetadataCorrupt`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
