//! Data-layout descriptors
//!
//! A [`Dld`] is the neutral record exchanged at task boundaries to describe
//! one field column's physical storage: element shape, logical row count,
//! base address, per-row stride and in-row offset. Runtime interfaces that
//! move or fill field data consume descriptors; generated kernel bodies
//! never inspect one.
//!
//! Invariants:
//! - `physical_size = logical_size × stride`
//! - a descriptor is **compact** iff `stride = vector_size × base_bytes`
//!   and `offset = 0`.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::types::Primitive;

/// Element shape of one stored value: `vector_size` consecutive scalars of
/// `base_type`. A scalar column has `vector_size = 1`; a matrix column
/// flattens row-major into `rows × cols` lanes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DldType {
    /// Number of consecutive scalars per value.
    pub vector_size: u64,
    /// Scalar type of each lane.
    pub base_type: Primitive,
    /// Size in bytes of one scalar of `base_type`.
    pub base_bytes: u64,
}

impl DldType {
    /// Builds the element shape, computing `base_bytes` from `base_type`.
    pub fn new(base_type: Primitive, vector_size: u64) -> Self {
        Self { vector_size, base_type, base_bytes: base_type.size_in_bytes() }
    }

    /// Bytes occupied by one value when packed without padding.
    pub fn packed_bytes(&self) -> u64 {
        self.vector_size * self.base_bytes
    }
}

/// Neutral description of one field column's storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dld {
    /// Element shape.
    pub ty: DldType,
    /// Number of logical rows.
    pub logical_size: u64,
    /// Base address of row 0 (the owning region's buffer plus `offset`).
    /// Zero while the region is unallocated.
    pub address: usize,
    /// Bytes from one row's value to the next row's value.
    pub stride: u64,
    /// Bytes from the start of a row's storage slot to the value.
    pub offset: u64,
}

impl Dld {
    /// Descriptor for a column packed contiguously at `address`.
    pub fn compact(ty: DldType, logical_size: u64, address: usize) -> Self {
        Self { ty, logical_size, address, stride: ty.packed_bytes(), offset: 0 }
    }

    /// Total bytes spanned by the column.
    pub fn physical_size(&self) -> u64 {
        self.logical_size * self.stride
    }

    /// `stride` equals the packed element size and the value sits at the
    /// start of its slot.
    pub fn is_compact(&self) -> bool {
        self.stride == self.ty.packed_bytes() && self.offset == 0
    }

    /// Byte position of row `row`, relative to `address`.
    pub fn row_offset(&self, row: u64) -> u64 {
        debug_assert!(row < self.logical_size, "row out of range");
        row * self.stride + self.offset
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_descriptor_invariants() {
        let ty = DldType::new(Primitive::F64, 3);
        let d = Dld::compact(ty, 100, 0);
        assert!(d.is_compact());
        assert_eq!(d.stride, 24);
        assert_eq!(d.physical_size(), 2400);
        assert_eq!(d.row_offset(0), 0);
        assert_eq!(d.row_offset(7), 168);
    }

    #[test]
    fn strided_descriptor_is_not_compact() {
        let ty = DldType::new(Primitive::I32, 1);
        // A column interleaved inside a 16-byte row at offset 8.
        let d = Dld { ty, logical_size: 10, address: 0, stride: 16, offset: 8 };
        assert!(!d.is_compact());
        assert_eq!(d.physical_size(), 160);
        assert_eq!(d.row_offset(2), 40);
    }
}
