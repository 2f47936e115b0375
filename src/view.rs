//! The `StorageView` seam: the engine's only contract with caller-owned
//! tensor storage. A real language binding implements this trait over its
//! own array type; this crate also ships [`OwnedView`], a simple in-memory
//! implementation used by its own tests.

use crate::metainfo::{ElementType, Scalar};

/// An opaque, iterable source or sink of typed scalar elements with a known
/// shape and element type. The engine never inspects strides or padding: it
/// reads/writes elements in the view's own declared order.
pub trait StorageView {
    /// The view's element type.
    fn element_type(&self) -> ElementType;

    /// The view's dimensions, outermost first.
    fn dims(&self) -> &[u64];

    /// Total element count, the product of `dims`.
    fn element_count(&self) -> u64 {
        self.dims().iter().product()
    }

    /// Iterate elements in the view's own order, for serialization into a
    /// contiguous little-endian byte buffer.
    fn elements(&self) -> Box<dyn Iterator<Item = Scalar> + '_>;

    /// Scatter `elements` into the view, in the same order `elements()`
    /// would yield them. The iterator yields exactly `element_count()` items.
    fn fill(&mut self, elements: Box<dyn Iterator<Item = Scalar> + '_>);
}

/// A simple in-memory [`StorageView`] backed by an owned `Vec<Scalar>`,
/// all sharing one [`ElementType`]. Used by this crate's own tests and
/// available to callers with no tensor library of their own.
#[derive(Debug, Clone)]
pub struct OwnedView {
    element_type: ElementType,
    dims: Vec<u64>,
    data: Vec<Scalar>,
}

impl OwnedView {
    /// Construct a view over `data`, which must have exactly
    /// `dims.iter().product()` elements all tagged `element_type`.
    pub fn new(element_type: ElementType, dims: Vec<u64>, data: Vec<Scalar>) -> Self {
        let expected: u64 = dims.iter().product();
        debug_assert_eq!(data.len() as u64, expected);
        debug_assert!(data.iter().all(|s| s.tag() == element_type));
        Self {
            element_type,
            dims,
            data,
        }
    }

    /// An all-default-valued view of the given shape and type, ready to be
    /// filled by a read.
    pub fn zeroed(element_type: ElementType, dims: Vec<u64>) -> Self {
        let count: u64 = dims.iter().product();
        let zero = match element_type {
            ElementType::Boolean => Scalar::Boolean(false),
            ElementType::Int32 => Scalar::Int32(0),
            ElementType::Int64 => Scalar::Int64(0),
            ElementType::Float32 => Scalar::Float32(0.0),
            ElementType::Float64 => Scalar::Float64(0.0),
            ElementType::String => Scalar::String(String::new()),
        };
        Self {
            element_type,
            data: vec![zero; count as usize],
            dims,
        }
    }

    /// The view's raw scalar buffer.
    pub fn data(&self) -> &[Scalar] {
        &self.data
    }
}

impl StorageView for OwnedView {
    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn dims(&self) -> &[u64] {
        &self.dims
    }

    fn elements(&self) -> Box<dyn Iterator<Item = Scalar> + '_> {
        Box::new(self.data.iter().cloned())
    }

    fn fill(&mut self, mut elements: Box<dyn Iterator<Item = Scalar> + '_>) {
        for slot in self.data.iter_mut() {
            if let Some(v) = elements.next() {
                *slot = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_then_filled_round_trips_elements() {
        let mut view = OwnedView::zeroed(ElementType::Int32, vec![2, 2]);
        assert_eq!(view.element_count(), 4);
        let values = vec![Scalar::Int32(1), Scalar::Int32(2), Scalar::Int32(3), Scalar::Int32(4)];
        view.fill(Box::new(values.clone().into_iter()));
        assert_eq!(view.data(), values.as_slice());
    }
}
