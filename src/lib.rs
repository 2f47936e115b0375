//! Content-addressed, checksum-deduplicated on-disk storage for labeled
//! multidimensional fields captured at execution savepoints.
//!
//! A [`Serializer`](serializer::Serializer) composes a global
//! [`MetaInfoMap`](metainfo::MetaInfoMap), a [`FieldMap`](field::FieldMap),
//! a [`SavepointVector`](savepoint::SavepointVector), and an
//! [`Archive`](archive::Archive) to register fields, write them at named
//! savepoints, and read them back bit-identically — deduplicating payloads
//! by content hash and persisting metadata atomically on every mutation.
//!
//! The engine is single-writer and synchronous: there is exactly one
//! logical writer per archive, and callers sharing a [`Serializer`] across
//! threads must serialize their own access (e.g. behind a `Mutex`).

pub mod archive;
pub mod error;
pub mod field;
mod legacy;
pub mod metainfo;
pub mod savepoint;
pub mod serializer;
pub mod view;

pub use archive::{Archive, BinaryArchive};
pub use error::{Error, Result};
pub use field::{FieldMap, FieldMetaInfo};
pub use metainfo::{ElementType, MetaInfoMap, MetaValue, Scalar};
pub use savepoint::{FieldId, Savepoint, SavepointVector};
pub use serializer::{OpenMode, Serializer};
pub use view::{OwnedView, StorageView};
