//! Archive (`A`): the backing store of raw typed payloads, addressed by
//! [`FieldId`](crate::savepoint::FieldId). [`binary`] provides the one
//! reference implementation, `BinaryArchive`.

pub mod binary;

use crate::error::Result;
use crate::savepoint::FieldId;
use crate::view::StorageView;

/// Backing store of raw field payloads, content-addressed within each
/// field name.
pub trait Archive {
    /// Serialize `view` and either reuse an existing identical payload
    /// (deduplication) or append a new one, returning its [`FieldId`].
    fn write(&mut self, name: &str, view: &dyn StorageView) -> Result<FieldId>;

    /// Resolve `id` within field `name` and scatter the stored payload into `view`.
    fn read(&self, name: &str, id: FieldId, view: &mut dyn StorageView) -> Result<()>;

    /// Truncate all per-field data files and empty every offset table.
    fn clear(&mut self) -> Result<()>;
}

pub use binary::BinaryArchive;
